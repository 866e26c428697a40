//! Storage traits: the abstract interfaces for objects and sync logs.
//!
//! [`Storage`] is the contract driftsync expects from the application's
//! database. [`ClientSyncLog`] is the per-device append-only log and
//! [`SharedSyncLog`] the relay every device of a user pushes to and pulls
//! from. Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use bytes::Bytes;
use driftsync_core::{
    DeviceId, ExecutableOperation, Filter, LogEntry, LogEntryId, Object, ObjectKey, PrimaryKey,
    SchemaRegistry, SortOrder, Timestamp, UserId,
};

use crate::error::Result;

/// One step of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Apply a write to the object store.
    Execute(ExecutableOperation),
    /// Append entries to the client sync log.
    AppendLogEntries(Vec<LogEntry>),
    /// Clear `needs_integration` on the given entries.
    MarkIntegrated(Vec<LogEntryId>),
}

/// The Storage trait: async interface to the application's object store.
///
/// Objects are JSON maps keyed by the primary key the collection declares in
/// [`registry`](Storage::registry). Filters are equality filters; the empty
/// filter matches every object of the collection.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Collections known to this store.
    fn registry(&self) -> &SchemaRegistry;

    /// Insert one object. Fails with `Conflict` when the key is taken.
    async fn create_object(&self, collection: &str, object: Object) -> Result<()>;

    /// Set `updates` on every object matching `filter`. Returns the number of
    /// objects touched.
    async fn update_objects(&self, collection: &str, filter: &Filter, updates: &Object)
        -> Result<usize>;

    /// Delete every object matching `filter`. Returns the number deleted.
    async fn delete_objects(&self, collection: &str, filter: &Filter) -> Result<usize>;

    /// Objects matching `filter`, in `order` (or primary-key order).
    async fn find_objects(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&SortOrder>,
    ) -> Result<Vec<Object>>;

    async fn count_objects(&self, collection: &str, filter: &Filter) -> Result<usize>;

    /// Run every step in one atomic unit: either all take effect or none do.
    async fn execute_batch(&self, batch: Vec<BatchOperation>) -> Result<()>;
}

/// Extension trait for common storage patterns.
pub trait StorageExt: Storage {
    /// Apply one [`ExecutableOperation`] outside a batch.
    fn apply(&self, op: &ExecutableOperation) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch a single object by primary key.
    fn find_by_pk(
        &self,
        collection: &str,
        pk: &PrimaryKey,
    ) -> impl std::future::Future<Output = Result<Option<Object>>> + Send;
}

impl<S: Storage + ?Sized> StorageExt for S {
    async fn apply(&self, op: &ExecutableOperation) -> Result<()> {
        match op {
            ExecutableOperation::CreateObject { collection, object } => {
                self.create_object(collection, object.clone()).await
            }
            ExecutableOperation::UpdateObjects {
                collection,
                filter,
                updates,
            } => self.update_objects(collection, filter, updates).await.map(|_| ()),
            ExecutableOperation::DeleteObjects { collection, filter } => {
                self.delete_objects(collection, filter).await.map(|_| ())
            }
        }
    }

    async fn find_by_pk(&self, collection: &str, pk: &PrimaryKey) -> Result<Option<Object>> {
        let filter = self.registry().get(collection)?.pk_filter(pk)?;
        let mut found = self.find_objects(collection, &filter, None).await?;
        Ok(found.pop())
    }
}

/// The client sync log: an append-only record of local and received entries.
///
/// Entries are immutable except for `shared_on` and `needs_integration`.
#[async_trait]
pub trait ClientSyncLog: Send + Sync {
    /// Append locally produced entries.
    async fn insert_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Entries with `created_on >= since`, ordered by `created_on`.
    async fn entries_created_after(&self, since: Timestamp) -> Result<Vec<LogEntry>>;

    /// Entries not yet pushed to the relay, ordered by `created_on`.
    async fn unshared_entries(&self) -> Result<Vec<LogEntry>>;

    /// Stamp `shared_on` on unshared entries with `created_on <= until`.
    async fn update_shared_until(&self, until: Timestamp, shared_on: Timestamp) -> Result<()>;

    /// Store entries pulled from the relay, marked as needing integration.
    ///
    /// Entries whose [`LogEntryId`] is already present are ignored. Returns
    /// the number actually inserted.
    async fn insert_received_entries(&self, entries: &[LogEntry], now: Timestamp)
        -> Result<usize>;

    async fn mark_as_integrated(&self, ids: &[LogEntryId]) -> Result<()>;

    /// The full history of the object owning the oldest entry still needing
    /// integration, ordered by `created_on`. `None` when nothing is pending.
    async fn next_object_to_integrate(&self) -> Result<Option<Vec<LogEntry>>> {
        self.next_object_to_integrate_except(&[]).await
    }

    /// Like [`next_object_to_integrate`](Self::next_object_to_integrate) but
    /// never returns one of the `skip` objects.
    async fn next_object_to_integrate_except(
        &self,
        skip: &[ObjectKey],
    ) -> Result<Option<Vec<LogEntry>>>;
}

/// A device registered with the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
    /// Entries created at or before this time have been pushed.
    pub shared_until: Timestamp,
}

/// An entry as the relay stores it. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLogEntry {
    pub user_id: UserId,
    /// The creating device.
    pub device_id: DeviceId,
    pub created_on: Timestamp,
    /// Relay receipt time.
    pub shared_on: Timestamp,
    /// Encoded [`SharedEntryPayload`](driftsync_core::SharedEntryPayload).
    pub data: Bytes,
}

impl SharedLogEntry {
    pub fn id(&self) -> LogEntryId {
        LogEntryId::new(self.device_id.clone(), self.created_on)
    }
}

/// An entry on its way to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEntryUpload {
    pub created_on: Timestamp,
    pub data: Bytes,
}

/// The relay log shared by all devices of a user.
///
/// Each call is atomic.
#[async_trait]
pub trait SharedSyncLog: Send + Sync {
    /// Register a new device and return its relay-assigned id.
    ///
    /// Entries already on the relay count as seen by the new device: it
    /// receives that history as a fast-sync snapshot.
    async fn create_device_id(&self, user_id: &UserId, shared_until: Timestamp)
        -> Result<DeviceId>;

    async fn device_info(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Store entries created by `device_id` and advance its `shared_until`.
    /// Returns the relay `shared_on` stamp given to the entries.
    async fn write_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entries: &[SharedEntryUpload],
    ) -> Result<Timestamp>;

    /// Entries of the user neither created nor yet seen by `device_id`,
    /// ordered by `created_on`.
    async fn unsynced_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<SharedLogEntry>>;

    /// Record that `device_id` received the given entries.
    async fn mark_as_seen(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entry_ids: &[LogEntryId],
    ) -> Result<()>;
}

/// Reject updates that would rewrite a key field.
pub(crate) fn check_updates(
    registry: &SchemaRegistry,
    collection: &str,
    updates: &Object,
) -> Result<()> {
    let schema = registry.get(collection)?;
    if let Some(field) = updates.keys().find(|f| schema.primary_key.contains(f)) {
        return Err(driftsync_core::CoreError::KeyFieldInPayload {
            collection: collection.to_string(),
            field: field.clone(),
        }
        .into());
    }
    Ok(())
}

/// Order entries by creation time, then by device for equal timestamps.
pub(crate) fn sort_entries(entries: &mut [LogEntry]) {
    entries.sort_by(|a, b| {
        a.created_on
            .cmp(&b.created_on)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
}
