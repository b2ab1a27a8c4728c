//! Error types for the data layer.
//!
//! Every failure leaving this crate is a [`DbError`]. Raw [`sqlx`] errors
//! are classified on conversion so callers can tell an unreachable store
//! from a timeout from a genuine query bug without inspecting driver
//! internals.

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed for a reason other than the ones below.
    #[error("PostgreSQL error: {0}")]
    Postgres(sqlx::Error),

    /// The store could not be reached (I/O, TLS, closed pool).
    #[error("store unreachable: {0}")]
    Connectivity(String),

    /// The store is disabled; store-backed features are degraded.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Connection acquisition or a background task exceeded its bound.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is structurally invalid (bad enum text, out of range).
    #[error("invalid stored value: {0}")]
    InvalidValue(String),

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A schema migration failed to apply.
    #[error("migration {name} failed: {message}")]
    Migration {
        /// Name of the migration that failed.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether retrying the same operation later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Timeout(_) | Self::Unavailable(_)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                Self::Timeout("timed out acquiring a pooled connection".to_owned())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connectivity(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_owned())
            }
            _ => Self::Postgres(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_classified_as_timeout() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn closed_pool_is_connectivity() {
        let err = DbError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Connectivity(_)));
    }

    #[test]
    fn row_not_found_stays_a_query_error() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Postgres(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn migration_error_names_the_migration() {
        let err = DbError::Migration {
            name: "0003_create_guilds".to_owned(),
            message: "syntax error".to_owned(),
        };
        assert!(err.to_string().contains("0003_create_guilds"));
    }
}
