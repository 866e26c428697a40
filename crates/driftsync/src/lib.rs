//! # driftsync
//!
//! Keeps independently writable local databases of one user eventually
//! consistent across devices, without a connected coordinator.
//!
//! ## Overview
//!
//! - **Change capture**: [`SyncLoggingMiddleware`] turns local writes into
//!   timestamped log entries, atomically with the write itself
//! - **Continuous sync**: [`ContinuousSync`] pushes entries to a relay, pulls
//!   the other devices' entries and folds them in with the reconciler
//! - **Initial sync**: [`InitialSync`] copies a full snapshot between two
//!   peers over a resumable, chunked channel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync::{ContinuousSync, ContinuousSyncConfig, LoggingContext, MemorySettingsStore};
//! use driftsync::core::{CollectionSchema, SchemaRegistry, UserId};
//! use driftsync::store::{MemorySharedLog, SqliteStore, Storage};
//!
//! async fn example() -> driftsync::Result<()> {
//!     let registry = SchemaRegistry::new().with(CollectionSchema::new("notes", "id"));
//!     let store = Arc::new(SqliteStore::open("app.db", registry)?);
//!     let relay = Arc::new(MemorySharedLog::new());
//!     let settings = Arc::new(MemorySettingsStore::new());
//!     let context = Arc::new(LoggingContext::system());
//!
//!     let sync = ContinuousSync::new(
//!         store,
//!         relay,
//!         settings,
//!         context,
//!         ContinuousSyncConfig::default(),
//!     );
//!     if !sync.setup().await? {
//!         sync.initialize_device(&UserId::new("alice")).await?;
//!     }
//!
//!     // Writes through the middleware are logged.
//!     let notes = sync.middleware();
//!     let note = serde_json::json!({"id": 1, "title": "hello"});
//!     notes.create_object("notes", note.as_object().cloned().unwrap_or_default()).await?;
//!
//!     let report = sync.sync().await?;
//!     println!("pushed {} entries", report.pushed);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `driftsync::core` - Data model and reconciler
//! - `driftsync::store` - Storage contracts, SQLite and in-memory backends
//! - `driftsync::sync` - Chunked channel and fast sync

pub mod clock;
pub mod config;
pub mod continuous;
pub mod error;
pub mod initial;
pub mod logging;
pub mod settings;

// Re-export component crates
pub use driftsync_core as core;
pub use driftsync_store as store;
pub use driftsync_sync as sync;

pub use clock::{Clock, LoggingContext, ManualClock, MonotonicClock, SystemClock};
pub use config::{ContinuousSyncConfig, DriftConfig, InitialSyncConfig};
pub use continuous::{plan_uploads, ContinuousSync, SyncEvent, SyncReport};
pub use error::{DriftError, Result};
pub use initial::{InitialSync, InitialSyncEvent, InitialSyncReport};
pub use logging::SyncLoggingMiddleware;
pub use settings::{MemorySettingsStore, SettingsStore, SyncSettings};
