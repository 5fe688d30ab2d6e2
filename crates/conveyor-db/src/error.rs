//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The caller's etag no longer matches the stored row.
    #[error("stale etag on {0}")]
    Stale(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for conveyor_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => conveyor_core::Error::NotFound(what),
            DbError::Duplicate(what) => conveyor_core::Error::AlreadyExists(what),
            DbError::Stale(what) => conveyor_core::Error::OptimisticLock(what),
            other => conveyor_core::Error::Transport(other.to_string()),
        }
    }
}
