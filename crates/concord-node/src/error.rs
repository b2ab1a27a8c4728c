//! Error types for the node binary.
//!
//! [`NodeError`] wraps every failure `main` can propagate with `?`.

/// Top-level error for the node binary.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: concord_core::config::ConfigError,
    },

    /// A store operation failed.
    #[error("store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: concord_db::DbError,
    },

    /// A legacy file operation failed.
    #[error("legacy error: {source}")]
    Legacy {
        /// The underlying legacy tool error.
        #[from]
        source: concord_legacy::LegacyError,
    },

    /// A report could not be rendered.
    #[error("output error: {source}")]
    Output {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// Waiting for the shutdown signal failed.
    #[error("signal error: {source}")]
    Signal {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}
