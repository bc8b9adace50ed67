//! Utility modules for the backup agent.

pub mod device;
pub mod errors;
pub mod logger;

pub use device::device_name;
pub use errors::{AgentError, Result};
