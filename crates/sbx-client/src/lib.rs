//! sbx-client library: the agent that watches a directory, uploads digests,
//! and applies server-driven file operations.

pub mod agent;
pub mod cli;

pub use agent::{Client, ClientConfig};
pub use cli::Cli;
