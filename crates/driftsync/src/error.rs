//! Error types for driftsync.

use driftsync_core::{CoreError, ReconcileError};
use driftsync_store::StoreError;
use driftsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during driftsync operations.
#[derive(Debug, Error)]
pub enum DriftError {
    /// Schema violation.
    #[error("schema error: {0}")]
    Schema(#[from] CoreError),

    /// Folding an object's history failed.
    #[error("reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync protocol error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Logging is enabled but no device id is known.
    #[error("change logging is enabled but no device id is set")]
    MissingDeviceId,

    /// Continuous sync needs a user to act for.
    #[error("no user configured for continuous sync")]
    MissingUserId,

    /// A single entry is larger than an upload may be.
    #[error("entry of {entry_bytes} bytes exceeds the upload limit of {limit} bytes")]
    Capacity { entry_bytes: usize, limit: usize },

    /// A stored setting has an unexpected shape.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// The session gave up reconnecting.
    #[error("gave up after {attempts} reconnect attempts: {source}")]
    ReconnectsExhausted {
        attempts: u32,
        #[source]
        source: SyncError,
    },

    /// Internal state lock poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

/// Result type for driftsync operations.
pub type Result<T> = std::result::Result<T, DriftError>;
