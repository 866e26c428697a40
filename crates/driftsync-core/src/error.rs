//! Error types for driftsync core.

use thiserror::Error;

use crate::types::{ObjectKey, Timestamp};

/// Schema and data-model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("primary key {pk} does not match the key fields of {collection}")]
    InvalidPrimaryKey { collection: String, pk: String },

    #[error("object in {collection} is missing key field {field}")]
    MissingKeyField { collection: String, field: String },

    #[error("payload for {collection} addresses key field {field}")]
    KeyFieldInPayload { collection: String, field: String },
}

/// Errors raised while folding one object's history.
///
/// Fatal to integrating that object only.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A second creation of a live object, presumably a primary-key
    /// collision between devices.
    #[error("object {object} was created twice (at {first} and {second})")]
    DoubleCreate {
        object: ObjectKey,
        first: Timestamp,
        second: Timestamp,
    },

    /// A field edit recorded before the creation it depends on.
    #[error("field {field} of {object} was modified at {modified_on}, before its creation at {created_on}")]
    ModificationBeforeCreation {
        object: ObjectKey,
        field: String,
        modified_on: Timestamp,
        created_on: Timestamp,
    },

    /// Entries for more than one object were passed to a per-object call.
    #[error("entries for {expected} and {found} mixed in one reconciliation")]
    MixedObjects { expected: ObjectKey, found: ObjectKey },

    #[error(transparent)]
    Schema(#[from] CoreError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
