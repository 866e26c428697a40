//! # driftsync sync
//!
//! The fast-sync transfer protocol: a resumable, chunked, flow-controlled
//! exchange of a full object snapshot between two peers.
//!
//! ## Overview
//!
//! Layers, bottom up:
//!
//! - [`Interruptable`] - Cooperative pause/resume/cancel for long loops
//! - [`chunking`] - `chunk:<index>:<count>:<content>` framing
//! - [`Transport`] / [`Connector`] - Message stream between two peers
//! - [`SyncChannel`] - Confirmed package exchange with stall detection
//! - [`FastSyncSender`] / [`FastSyncReceiver`] - The snapshot transfer itself
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync_core::{CollectionSchema, SchemaRegistry};
//! use driftsync_store::MemoryStore;
//! use driftsync_sync::{
//!     pair, ChannelConfig, EventBus, FastSyncConfig, FastSyncReceiver, FastSyncSender,
//!     Interruptable, SyncChannel,
//! };
//!
//! async fn example() -> driftsync_sync::Result<()> {
//!     let registry = SchemaRegistry::new().with(CollectionSchema::new("notes", "id"));
//!     let source = Arc::new(MemoryStore::new(registry.clone()));
//!     let target = Arc::new(MemoryStore::new(registry));
//!
//!     let (a, b) = pair();
//!     let mut outbound = SyncChannel::new(a, ChannelConfig::default());
//!     let mut inbound = SyncChannel::new(b, ChannelConfig::default());
//!
//!     let mut sender: FastSyncSender<_> = FastSyncSender::new(
//!         source,
//!         FastSyncConfig::default(),
//!         Interruptable::new(),
//!         EventBus::default(),
//!     );
//!     let mut receiver: FastSyncReceiver<_> =
//!         FastSyncReceiver::new(target, Interruptable::new(), EventBus::default());
//!
//!     let send = tokio::spawn(async move { sender.execute(&mut outbound).await });
//!     receiver.execute(&mut inbound).await?;
//!     send.await.map_err(|e| driftsync_sync::SyncError::TransportError(e.to_string()))??;
//!     Ok(())
//! }
//! ```
//!
//! ## Package Flow
//!
//! ```text
//! Sender                               Receiver
//!   |-------- sync-info -------------->|
//!   |<------- confirm -----------------|
//!   |-------- batch ------------------>|   (repeated)
//!   |<------- confirm -----------------|
//!   |-------- finish ----------------->|
//!   |<------- confirm -----------------|
//! ```
//!
//! ## Design Notes
//!
//! - **One package in flight**: nothing is sent until the previous package
//!   is confirmed
//! - **Timeouts only at the channel**: a silent peer surfaces as
//!   [`SyncError::Stalled`], which is recoverable by reconnecting
//! - **Resumable**: sender and receiver keep their position across channels

pub mod channel;
pub mod chunking;
pub mod error;
pub mod events;
pub mod fast_sync;
pub mod interruptable;
pub mod transport;

pub use channel::{
    ChannelConfig, ChannelHooks, ObjectBatch, PeerState, SyncChannel, SyncInfo, SyncPackage,
};
pub use chunking::{calculate_chunk_count, get_chunk, Chunk, ChunkAssembler};
pub use error::{ChunkError, Result, SyncError};
pub use events::EventBus;
pub use fast_sync::{
    count_sync_objects, decide_role, sync_collections, FastSyncConfig, FastSyncEvent,
    FastSyncOutcome, FastSyncProgress, FastSyncReceiver, FastSyncSender, ObjectPreprocessor,
    ReceivedKey, SyncRole,
};
pub use interruptable::{Interruptable, RunState};
pub use transport::{
    memory::{pair, MemoryConnector, MemoryTransport},
    Connector, Transport,
};
