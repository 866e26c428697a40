//! # driftsync store
//!
//! Storage contracts for driftsync plus SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! - [`Storage`] - The application's object store as driftsync sees it
//! - [`ClientSyncLog`] - Per-device append-only log of entries
//! - [`SharedSyncLog`] - The relay all devices of a user push to and pull from
//! - [`SqliteStore`] / [`SqliteSharedLog`] - Persistent implementations
//! - [`MemoryStore`] / [`MemorySharedLog`] - In-memory implementations for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftsync_core::{CollectionSchema, SchemaRegistry};
//! use driftsync_store::{SqliteStore, Storage};
//!
//! async fn example() -> driftsync_store::Result<()> {
//!     let registry = SchemaRegistry::new().with(CollectionSchema::new("notes", "id"));
//!     let store = SqliteStore::open("app.db", registry)?;
//!     let count = store.count_objects("notes", &Default::default()).await?;
//!     println!("{} notes", count);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic batches**: [`Storage::execute_batch`] applies object writes,
//!   log appends and integration marks together or not at all
//! - **Idempotent receipt**: re-receiving an entry with a known id is a no-op
//! - **Seen records**: the relay never deletes entries, it records which
//!   device has received what

pub mod codec;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use codec::{decode_payload, encode_payload, generate_device_id};
pub use error::{Result, StoreError};
pub use memory::{MemorySharedLog, MemoryStore};
pub use sqlite::{SqliteSharedLog, SqliteStore};
pub use traits::{
    BatchOperation, ClientSyncLog, Device, SharedEntryUpload, SharedLogEntry, SharedSyncLog,
    Storage, StorageExt,
};
