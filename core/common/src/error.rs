//! Common error types for bizsync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for bizsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A strategy rejected the payload. Never reaches the network.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A strategy denied the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A request or push call failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend rejected our credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The push connection is not open.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A queued write exhausted its retries and was dropped.
    #[error("Queue item {item_id} for '{resource}' dropped after {attempts} attempts")]
    QueueExhausted {
        resource: String,
        item_id: String,
        attempts: u32,
    },

    /// Operation against a resource name that was never registered.
    #[error("Unregistered resource: {0}")]
    UnregisteredResource(String),

    /// Local store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether a later attempt of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::NotConnected(_) | Error::Io(_)
        )
    }

    /// Short machine-readable kind, used in emitted event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::PermissionDenied(_) => "permission",
            Error::Transport(_) => "transport",
            Error::Authentication(_) => "authentication",
            Error::NotConnected(_) => "not_connected",
            Error::QueueExhausted { .. } => "queue_exhausted",
            Error::UnregisteredResource(_) => "unregistered_resource",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal signal that a cached read is older than its resource allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleDataWarning {
    pub resource: String,
    /// Age of the oldest item, in milliseconds.
    pub age_ms: i64,
    pub max_age_ms: i64,
}
