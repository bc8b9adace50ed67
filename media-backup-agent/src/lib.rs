//! Media Backup Agent Library
//!
//! Unattended incremental backup of a media tree to a remote document sink,
//! with content-hash deduplication and a shared delivery history.

pub mod api;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod daemon;
pub mod dedup;
pub mod engine;
pub mod executor;
pub mod fs;
pub mod notify;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod transfer;
pub mod utils;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
