//! # driftsync testkit
//!
//! Testing utilities for driftsync.
//!
//! ## Overview
//!
//! - **Fixtures**: a sample schema, seeded stores and fully wired devices
//!   sharing one relay
//! - **Generators**: proptest strategies for objects and single-object log
//!   histories
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use driftsync_testkit::fixtures::{note, DeviceFixture};
//! use driftsync::store::{MemorySharedLog, Storage};
//! use std::sync::Arc;
//!
//! # async fn example() -> driftsync::Result<()> {
//! let relay = Arc::new(MemorySharedLog::new());
//! let phone = DeviceFixture::new(relay.clone(), 1_000);
//! phone.register("alice").await?;
//! phone.sync.middleware().create_object("notes", note(1, "hello")).await?;
//! phone.sync.sync().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use driftsync_testkit::generators::object_history;
//!
//! proptest! {
//!     #[test]
//!     fn reconcile_never_panics(history in object_history("notes", 1, 12)) {
//!         let _ = driftsync::core::Reconciler::new(&registry).reconcile_object(&history);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{note, sample_registry, seeded_store, DeviceFixture};
