//! sbx-server library: reference database, blob storage, and the server
//! agent that reconciles and fans out client trees.

pub mod cli;
pub mod db;
pub mod ref_graph;
pub mod server;
pub mod store_fs;

pub use cli::Cli;
pub use server::{Server, ServerConfig};
