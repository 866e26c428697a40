//! # driftsync core
//!
//! Pure data model for driftsync: identifiers, log entries, the schema
//! registry and the reconciliation algorithm.
//!
//! This crate does no I/O. Storage, transport and orchestration live in the
//! sibling crates.
//!
//! ## Key Types
//!
//! - [`LogEntry`] - One causally-timestamped local mutation
//! - [`PrimaryKey`] - Scalar or compound key of an object
//! - [`SchemaRegistry`] - Which collections exist and how they are keyed
//! - [`ExecutableOperation`] - A final write handed to storage
//! - [`Reconciler`] - Folds an object's history into final writes

pub mod entry;
pub mod error;
pub mod operation;
pub mod reconcile;
pub mod schema;
pub mod types;

pub use entry::{LogChange, LogEntry, Operation, SharedEntryPayload};
pub use error::{CoreError, ReconcileError, Result};
pub use operation::{
    compare_values, matches_filter, Direction, ExecutableOperation, Filter, Object, SortOrder,
};
pub use reconcile::{reconcile_object, DoubleCreatePolicy, Reconciler};
pub use schema::{CollectionSchema, KeyFields, PrimaryKey, SchemaRegistry};
pub use types::{DeviceId, LogEntryId, ObjectKey, Timestamp, UserId};
