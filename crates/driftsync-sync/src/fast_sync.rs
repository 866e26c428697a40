//! Fast sync: stream a full object snapshot from one peer to another.
//!
//! The [`FastSyncSender`] announces totals with `sync-info`, streams every
//! object of the configured collections in primary-key order as `batch`
//! packages and ends with `finish`. The [`FastSyncReceiver`] inserts what it
//! receives as plain creates.
//!
//! Both sides keep their position between calls to `execute`, so after a
//! transport failure a session resumes on a fresh [`SyncChannel`]: the sender
//! re-sends the last unconfirmed package and the receiver ignores objects it
//! already holds.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use driftsync_core::{ExecutableOperation, Filter, Object, SchemaRegistry, SortOrder};
use driftsync_store::{BatchOperation, Storage, StorageExt};

use crate::channel::{ObjectBatch, PeerState, SyncChannel, SyncInfo, SyncPackage};
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::interruptable::Interruptable;
use crate::transport::Transport;

// ─────────────────────────────────────────────────────────────────────────────
// Shared types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FastSyncConfig {
    /// Collections to transfer. Empty means every registered collection.
    pub collections: Vec<String>,
    /// Objects per `batch` package.
    pub batch_size: usize,
}

impl Default for FastSyncConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FastSyncProgress {
    pub collection_count: usize,
    pub object_count: usize,
    pub total_objects_processed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FastSyncEvent {
    /// Totals are known.
    Prepared { info: SyncInfo },
    Progress { progress: FastSyncProgress },
    /// A `user-package` arrived from the peer.
    UserPackage { package: Value },
    Paused,
    Resumed,
}

/// How a call to `execute` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastSyncOutcome {
    Finished,
    Cancelled,
}

/// Drops or rewrites objects before the sender ships them.
pub trait ObjectPreprocessor: Send + Sync {
    fn process(&self, collection: &str, object: Object) -> Option<Object>;
}

/// Which end of a fast sync a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Sender,
    Receiver,
}

impl SyncRole {
    pub fn opposite(self) -> Self {
        match self {
            SyncRole::Sender => SyncRole::Receiver,
            SyncRole::Receiver => SyncRole::Sender,
        }
    }
}

/// The peer holding fewer objects receives. Ties keep `preassigned`.
pub fn decide_role(preassigned: SyncRole, local_objects: usize, remote_objects: usize) -> SyncRole {
    match local_objects.cmp(&remote_objects) {
        Ordering::Less => SyncRole::Receiver,
        Ordering::Greater => SyncRole::Sender,
        Ordering::Equal => preassigned,
    }
}

/// Resolve the configured collections against the registry.
pub fn sync_collections(registry: &SchemaRegistry, config: &FastSyncConfig) -> Result<Vec<String>> {
    if config.collections.is_empty() {
        return Ok(registry.collection_names());
    }
    for collection in &config.collections {
        registry.get(collection)?;
    }
    Ok(config.collections.clone())
}

/// Count the objects a sender would announce.
pub async fn count_sync_objects<S: Storage + ?Sized>(
    storage: &S,
    collections: &[String],
) -> Result<SyncInfo> {
    let mut object_count = 0;
    for collection in collections {
        object_count += storage.count_objects(collection, &Filter::new()).await?;
    }
    Ok(SyncInfo {
        collection_count: collections.len(),
        object_count,
    })
}

fn progress_of(info: Option<SyncInfo>, processed: usize) -> FastSyncProgress {
    let info = info.unwrap_or_default();
    FastSyncProgress {
        collection_count: info.collection_count,
        object_count: info.object_count,
        total_objects_processed: processed,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    Info,
    Batch { read: usize },
    Finish,
}

#[derive(Debug, Clone)]
struct Pending {
    package: SyncPackage,
    step: Step,
}

#[derive(Debug, Default)]
struct SenderCursor {
    collections: Vec<String>,
    info: Option<SyncInfo>,
    collection_index: usize,
    /// Objects of the current collection, loaded once per collection.
    loaded: Option<Vec<Object>>,
    offset: usize,
    processed: usize,
    /// Sent but not yet confirmed.
    pending: Option<Pending>,
    finished: bool,
}

pub struct FastSyncSender<S: Storage + ?Sized, E: Clone = FastSyncEvent> {
    storage: Arc<S>,
    config: FastSyncConfig,
    preprocessor: Option<Arc<dyn ObjectPreprocessor>>,
    interruptable: Interruptable,
    events: EventBus<E>,
    cursor: SenderCursor,
}

impl<S, E> FastSyncSender<S, E>
where
    S: Storage + ?Sized,
    E: From<FastSyncEvent> + Clone,
{
    pub fn new(
        storage: Arc<S>,
        config: FastSyncConfig,
        interruptable: Interruptable,
        events: EventBus<E>,
    ) -> Self {
        Self {
            storage,
            config,
            preprocessor: None,
            interruptable,
            events,
            cursor: SenderCursor::default(),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn ObjectPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn progress(&self) -> FastSyncProgress {
        progress_of(self.cursor.info, self.cursor.processed)
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.finished
    }

    /// Send until `finish` is confirmed or the interruptable stops the loop.
    ///
    /// On error the position is kept; call again with a fresh channel to
    /// resume.
    pub async fn execute<T: Transport>(
        &mut self,
        channel: &mut SyncChannel<T>,
    ) -> Result<FastSyncOutcome> {
        if self.cursor.finished {
            return Ok(FastSyncOutcome::Finished);
        }
        if let Some(pending) = &self.cursor.pending {
            tracing::info!(kind = pending.package.kind(), "resending unconfirmed package");
        }

        loop {
            if !self.gate(channel).await? {
                tracing::info!("fast sync sender cancelled");
                return Ok(FastSyncOutcome::Cancelled);
            }

            let pending = match self.cursor.pending.take() {
                Some(pending) => pending,
                None => self.prepare_next().await?,
            };
            let package = pending.package.clone();
            let step = pending.step;

            self.cursor.pending = Some(pending);
            channel.send_package(package).await?;
            self.cursor.pending = None;

            if self.commit(step) {
                return Ok(FastSyncOutcome::Finished);
            }
        }
    }

    /// Like [`Interruptable::gate`], but tells the peer about pauses so its
    /// stall timeout does not fire.
    async fn gate<T: Transport>(&mut self, channel: &mut SyncChannel<T>) -> Result<bool> {
        if !self.interruptable.is_paused() {
            return self.interruptable.gate().await;
        }

        channel
            .send_package(SyncPackage::StateChange {
                state: PeerState::Paused,
            })
            .await?;
        self.emit(FastSyncEvent::Paused);
        tracing::info!("fast sync sender paused");

        let proceed = self.interruptable.gate().await?;
        if proceed {
            channel
                .send_package(SyncPackage::StateChange {
                    state: PeerState::Running,
                })
                .await?;
            self.emit(FastSyncEvent::Resumed);
            tracing::info!("fast sync sender resumed");
        }
        Ok(proceed)
    }

    async fn prepare_next(&mut self) -> Result<Pending> {
        if self.cursor.info.is_none() {
            let collections = sync_collections(self.storage.registry(), &self.config)?;
            let info = count_sync_objects(&*self.storage, &collections).await?;
            tracing::info!(
                collections = info.collection_count,
                objects = info.object_count,
                "fast sync prepared"
            );
            self.cursor.collections = collections;
            self.cursor.info = Some(info);
            return Ok(Pending {
                package: SyncPackage::SyncInfo { info },
                step: Step::Info,
            });
        }

        let batch_size = self.config.batch_size.max(1);
        while self.cursor.collection_index < self.cursor.collections.len() {
            let collection = self.cursor.collections[self.cursor.collection_index].clone();

            if self.cursor.loaded.is_none() {
                let schema = self.storage.registry().get(&collection)?;
                let order = SortOrder::ascending(&schema.primary_key.names());
                let objects = self
                    .storage
                    .find_objects(&collection, &Filter::new(), Some(&order))
                    .await?;
                tracing::debug!(%collection, count = objects.len(), "loaded collection");
                self.cursor.loaded = Some(objects);
            }

            let loaded = self.cursor.loaded.as_deref().unwrap_or_default();
            let start = self.cursor.offset;
            if start >= loaded.len() {
                self.cursor.collection_index += 1;
                self.cursor.offset = 0;
                self.cursor.loaded = None;
                continue;
            }

            let end = (start + batch_size).min(loaded.len());
            let objects: Vec<Object> = loaded[start..end]
                .iter()
                .cloned()
                .filter_map(|object| match &self.preprocessor {
                    Some(preprocessor) => preprocessor.process(&collection, object),
                    None => Some(object),
                })
                .collect();
            let read = end - start;

            if objects.is_empty() {
                tracing::debug!(%collection, read, "every object in batch dropped");
                self.commit(Step::Batch { read });
                continue;
            }

            return Ok(Pending {
                package: SyncPackage::Batch {
                    batch: ObjectBatch {
                        collection,
                        objects,
                    },
                },
                step: Step::Batch { read },
            });
        }

        Ok(Pending {
            package: SyncPackage::Finish,
            step: Step::Finish,
        })
    }

    /// Advance past a confirmed step. Returns true once `finish` is through.
    fn commit(&mut self, step: Step) -> bool {
        match step {
            Step::Info => {
                let info = self.cursor.info.unwrap_or_default();
                self.emit(FastSyncEvent::Prepared { info });
                self.emit(FastSyncEvent::Progress {
                    progress: self.progress(),
                });
            }
            Step::Batch { read } => {
                self.cursor.offset += read;
                self.cursor.processed += read;
                tracing::debug!(processed = self.cursor.processed, "batch confirmed");
                self.emit(FastSyncEvent::Progress {
                    progress: self.progress(),
                });
            }
            Step::Finish => {
                self.cursor.finished = true;
                tracing::info!(processed = self.cursor.processed, "fast sync sender finished");
                return true;
            }
        }
        false
    }

    fn emit(&self, event: FastSyncEvent) {
        self.events.emit(E::from(event));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// `(collection, canonical primary key)` of an object seen by a receiver.
pub type ReceivedKey = (String, String);

pub struct FastSyncReceiver<S: Storage + ?Sized, E: Clone = FastSyncEvent> {
    storage: Arc<S>,
    interruptable: Interruptable,
    events: EventBus<E>,
    info: Option<SyncInfo>,
    processed: usize,
    received: HashSet<ReceivedKey>,
    finished: bool,
}

impl<S, E> FastSyncReceiver<S, E>
where
    S: Storage + ?Sized,
    E: From<FastSyncEvent> + Clone,
{
    pub fn new(storage: Arc<S>, interruptable: Interruptable, events: EventBus<E>) -> Self {
        Self {
            storage,
            interruptable,
            events,
            info: None,
            processed: 0,
            received: HashSet::new(),
            finished: false,
        }
    }

    pub fn progress(&self) -> FastSyncProgress {
        progress_of(self.info, self.processed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Every object received so far, whether it was inserted or already
    /// present locally.
    pub fn received_keys(&self) -> &HashSet<ReceivedKey> {
        &self.received
    }

    /// Receive until `finish` or until the interruptable stops the loop.
    pub async fn execute<T: Transport>(
        &mut self,
        channel: &mut SyncChannel<T>,
    ) -> Result<FastSyncOutcome> {
        if self.finished {
            return Ok(FastSyncOutcome::Finished);
        }

        loop {
            if !self.interruptable.gate().await? {
                tracing::info!("fast sync receiver cancelled");
                return Ok(FastSyncOutcome::Cancelled);
            }

            let package = tokio::select! {
                package = channel.receive_package() => package?,
                _ = self.interruptable.cancelled() => {
                    tracing::info!("fast sync receiver cancelled");
                    return Ok(FastSyncOutcome::Cancelled);
                }
            };

            match package {
                SyncPackage::SyncInfo { info } => self.on_info(info),
                SyncPackage::Batch { batch } => self.on_batch(batch).await?,
                SyncPackage::UserPackage { package } => {
                    if self.info.is_none() {
                        return Err(unexpected("sync-info", "user-package"));
                    }
                    self.events.emit(E::from(FastSyncEvent::UserPackage { package }));
                }
                SyncPackage::Finish => {
                    if self.info.is_none() {
                        return Err(unexpected("sync-info", "finish"));
                    }
                    self.finished = true;
                    tracing::info!(processed = self.processed, "fast sync receiver finished");
                    return Ok(FastSyncOutcome::Finished);
                }
                other => return Err(unexpected("batch", other.kind())),
            }
        }
    }

    fn on_info(&mut self, info: SyncInfo) {
        if self.info.is_some() {
            tracing::warn!("ignoring repeated sync-info");
            return;
        }
        tracing::info!(
            collections = info.collection_count,
            objects = info.object_count,
            "fast sync receiving"
        );
        self.info = Some(info);
        self.events.emit(E::from(FastSyncEvent::Prepared { info }));
        self.events.emit(E::from(FastSyncEvent::Progress {
            progress: self.progress(),
        }));
    }

    async fn on_batch(&mut self, batch: ObjectBatch) -> Result<()> {
        if self.info.is_none() {
            return Err(unexpected("sync-info", "batch"));
        }

        let ObjectBatch {
            collection,
            objects,
        } = batch;
        let schema = self.storage.registry().get(&collection)?.clone();

        let mut operations = Vec::new();
        let mut keys = Vec::new();
        for object in objects {
            let pk = schema.pk_of(&object)?;
            let key = (collection.clone(), pk.canonical());
            if self.received.contains(&key) || keys.contains(&key) {
                continue;
            }

            if self.storage.find_by_pk(&collection, &pk).await?.is_some() {
                tracing::debug!(%collection, pk = %key.1, "object already present");
            } else {
                operations.push(BatchOperation::Execute(ExecutableOperation::CreateObject {
                    collection: collection.clone(),
                    object,
                }));
            }
            keys.push(key);
        }

        if !operations.is_empty() {
            self.storage.execute_batch(operations).await?;
        }

        self.processed += keys.len();
        self.received.extend(keys);
        tracing::debug!(%collection, processed = self.processed, "batch stored");
        self.events.emit(E::from(FastSyncEvent::Progress {
            progress: self.progress(),
        }));
        Ok(())
    }
}

fn unexpected(expected: &str, got: &str) -> SyncError {
    SyncError::UnexpectedPackage {
        expected: expected.to_string(),
        got: got.to_string(),
    }
}
