//! Error types for the store module.

use driftsync_core::CoreError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Object or payload serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Device or record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same primary key already exists.
    #[error("object {pk} already exists in {collection}")]
    Conflict { collection: String, pk: String },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A lock guarding in-memory state or the connection was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// A storage wrapper refused the write.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// A blocking task could not be joined.
    #[error("blocking task failed: {0}")]
    Task(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema violation (unknown collection, bad key, ...).
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
