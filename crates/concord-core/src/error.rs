//! Error types for the sync services.

use concord_db::DbError;
use concord_types::MessageKind;

/// Errors that can occur in the sync services.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A message handler rejected a payload.
    #[error("{kind} handler failed: {message}")]
    Handler {
        /// Kind of the message being handled.
        kind: MessageKind,
        /// Description of the failure.
        message: String,
    },

    /// A job exceeded its time bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The service is shutting down and accepts no new work.
    #[error("service is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Build a handler failure.
    pub fn handler(kind: MessageKind, message: impl Into<String>) -> Self {
        Self::Handler {
            kind,
            message: message.into(),
        }
    }
}
