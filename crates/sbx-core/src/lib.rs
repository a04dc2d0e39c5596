//! sbx-core: shared library for the sbx file-synchronization service.
//!
//! This crate provides:
//! - Fixed-size packet framing and per-message reassembly
//! - Request/response envelopes and the four payload variants
//! - The per-connection transport hub, peer abstraction, and request loop
//! - The content-addressed tree model and the diff engine
//! - The blob-store contract
//! - Logging and error types

pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod transport;
pub mod tree;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
