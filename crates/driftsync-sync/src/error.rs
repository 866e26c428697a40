//! Error types for the sync module.

use thiserror::Error;

/// Errors in the chunk framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The message is not a well-formed `chunk:<index>:<count>:<content>`.
    #[error("malformed chunk header: {0}")]
    MalformedHeader(String),

    /// A chunk announced a different total than the first chunk did.
    #[error("chunk count changed mid-transfer: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },

    /// Chunks must arrive strictly in order.
    #[error("chunk out of order: expected index {expected}, got {got}")]
    OutOfOrder { expected: usize, got: usize },
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Chunk framing violated.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Peer sent a package the protocol does not allow here.
    #[error("unexpected package: expected {expected}, got {got}")]
    UnexpectedPackage { expected: String, got: String },

    /// Package could not be decoded.
    #[error("invalid package: {0}")]
    InvalidPackage(String),

    /// No chunk or confirmation arrived within the channel timeout.
    #[error("channel stalled: nothing received for {timeout_ms} ms")]
    Stalled { timeout_ms: u64 },

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The channel was destroyed.
    #[error("channel closed")]
    ChannelClosed,

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] driftsync_store::StoreError),

    /// Schema violation in transferred data.
    #[error("schema error: {0}")]
    Schema(#[from] driftsync_core::CoreError),

    /// A step was attempted on a cancelled diagnostic interruptable.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether reconnecting and resuming may get past this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Stalled { .. } | SyncError::TransportError(_) | SyncError::ChannelClosed
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::InvalidPackage(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
