//! Error type for KV store operations.

use thiserror::Error;

/// Result alias for KV store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors returned by a [`crate::KvStore`] implementation.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
