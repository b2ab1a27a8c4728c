//! Error types for the legacy migration tool.

use std::path::PathBuf;

use concord_db::DbError;

/// Errors raised while reading, writing, or migrating legacy files.
#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    /// The legacy root is missing or not a directory.
    #[error("legacy store unreadable at {}: {source}", path.display())]
    Unreadable {
        /// Root that was opened.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A file or directory operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A legacy file could not be parsed.
    #[error("failed to parse {}: {message}", path.display())]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Parser or conversion message.
        message: String,
    },

    /// A parsed field holds a value the relational schema cannot take.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Legacy key name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// A relational store operation failed.
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// A record could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record could not be encoded as YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// A file task on the blocking pool panicked or was cancelled.
    #[error("file task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LegacyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
