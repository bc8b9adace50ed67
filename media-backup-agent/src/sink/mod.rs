//! Remote document sink: where backed-up files are delivered.
//!
//! Every failed attempt is a [`DeliveryError`]. Callers decide whether to
//! retry from [`DeliveryError::kind`] alone.

pub mod telegram;

use crate::config::BackupConfig;
use crate::fs::FileRecord;
use crate::transfer::ProgressCallback;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use telegram::TelegramSink;

/// Credentials and destination for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub token: String,
    pub target_id: String,
}

impl RemoteTarget {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            token: config.remote_token.trim().to_string(),
            target_id: config.remote_target_id.trim().to_string(),
        }
    }
}

/// Confirmation of a delivered document or message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub remote_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, resets, server-side errors
    Transient,
    /// The remote asked us to wait this long before trying again
    RateLimited { retry_after: Duration },
    /// Retrying cannot help
    Permanent,
    /// The local file is no longer there
    Precondition,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::RateLimited { retry_after } => ErrorKind::RateLimited {
                retry_after: *retry_after,
            },
            DeliveryError::Transport(_) => ErrorKind::Transient,
            DeliveryError::Rejected { status, .. } if *status >= 500 => ErrorKind::Transient,
            DeliveryError::Rejected { .. } => ErrorKind::Permanent,
            DeliveryError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::Precondition,
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permanent,
                _ => ErrorKind::Transient,
            },
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => DeliveryError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => DeliveryError::Transport(e.to_string()),
        }
    }
}

/// A chat message addressed to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub update_id: i64,
    pub chat_id: String,
    pub text: String,
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Upload one file. `progress` receives the running byte count.
    async fn send_document(
        &self,
        target: &RemoteTarget,
        file: &FileRecord,
        progress: ProgressCallback,
    ) -> Result<Delivery, DeliveryError>;

    async fn send_message(
        &self,
        target: &RemoteTarget,
        text: &str,
    ) -> Result<Delivery, DeliveryError>;

    /// Largest file the remote accepts
    fn max_payload_bytes(&self) -> u64;
}

/// Inbound side of the remote: commands typed by the owner.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Messages with `update_id >= offset`.
    async fn fetch_updates(
        &self,
        target: &RemoteTarget,
        offset: i64,
    ) -> Result<Vec<IncomingMessage>, DeliveryError>;
}
