//! In-memory implementations of the storage traits.
//!
//! Same semantics as SQLite, no persistence. Batches are made atomic by
//! applying them to a copy of the state and swapping it in on success.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use driftsync_core::{
    matches_filter, DeviceId, Filter, LogEntry, LogEntryId, Object, ObjectKey, SchemaRegistry,
    SortOrder, Timestamp, UserId, ExecutableOperation,
};

use crate::codec::{generate_device_id, now_millis};
use crate::error::{Result, StoreError};
use crate::traits::{
    check_updates, sort_entries, BatchOperation, ClientSyncLog, Device, SharedEntryUpload,
    SharedLogEntry, SharedSyncLog, Storage,
};

/// In-memory object store plus client sync log.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    registry: SchemaRegistry,
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Clone, Default)]
struct MemoryStoreInner {
    /// Objects per collection, keyed by canonical primary key.
    collections: HashMap<String, BTreeMap<String, Object>>,
    log: Vec<LogEntry>,
}

impl MemoryStoreInner {
    fn create(&mut self, registry: &SchemaRegistry, collection: &str, object: Object) -> Result<()> {
        let pk = registry.get(collection)?.pk_of(&object)?.canonical();
        let objects = self.collections.entry(collection.to_string()).or_default();
        if objects.contains_key(&pk) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                pk,
            });
        }
        objects.insert(pk, object);
        Ok(())
    }

    fn update(
        &mut self,
        registry: &SchemaRegistry,
        collection: &str,
        filter: &Filter,
        updates: &Object,
    ) -> Result<usize> {
        check_updates(registry, collection, updates)?;
        let Some(objects) = self.collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut touched = 0;
        for object in objects.values_mut().filter(|o| matches_filter(o, filter)) {
            for (field, value) in updates {
                object.insert(field.clone(), value.clone());
            }
            touched += 1;
        }
        Ok(touched)
    }

    fn delete(&mut self, registry: &SchemaRegistry, collection: &str, filter: &Filter) -> Result<usize> {
        registry.get(collection)?;
        let Some(objects) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = objects.len();
        objects.retain(|_, o| !matches_filter(o, filter));
        Ok(before - objects.len())
    }

    fn find(
        &self,
        registry: &SchemaRegistry,
        collection: &str,
        filter: &Filter,
        order: Option<&SortOrder>,
    ) -> Result<Vec<Object>> {
        registry.get(collection)?;
        let mut found: Vec<Object> = self
            .collections
            .get(collection)
            .map(|objects| {
                objects
                    .values()
                    .filter(|o| matches_filter(o, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = order {
            order.sort(&mut found);
        }
        Ok(found)
    }

    fn apply(&mut self, registry: &SchemaRegistry, op: BatchOperation) -> Result<()> {
        match op {
            BatchOperation::Execute(ExecutableOperation::CreateObject { collection, object }) => {
                self.create(registry, &collection, object)
            }
            BatchOperation::Execute(ExecutableOperation::UpdateObjects {
                collection,
                filter,
                updates,
            }) => self.update(registry, &collection, &filter, &updates).map(|_| ()),
            BatchOperation::Execute(ExecutableOperation::DeleteObjects { collection, filter }) => {
                self.delete(registry, &collection, &filter).map(|_| ())
            }
            BatchOperation::AppendLogEntries(entries) => {
                self.log.extend(entries);
                Ok(())
            }
            BatchOperation::MarkIntegrated(ids) => {
                self.mark_integrated(&ids);
                Ok(())
            }
        }
    }

    fn mark_integrated(&mut self, ids: &[LogEntryId]) {
        let ids: HashSet<&LogEntryId> = ids.iter().collect();
        for entry in self.log.iter_mut() {
            if ids.contains(&entry.id()) {
                entry.needs_integration = false;
            }
        }
    }

    fn sorted(&self, predicate: impl Fn(&LogEntry) -> bool) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self.log.iter().filter(|e| predicate(e)).cloned().collect();
        sort_entries(&mut entries);
        entries
    }
}

impl MemoryStore {
    /// Create a new empty store for the given collections.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry,
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

#[async_trait]
impl Storage for MemoryStore {
    fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    async fn create_object(&self, collection: &str, object: Object) -> Result<()> {
        self.write()?.create(&self.registry, collection, object)
    }

    async fn update_objects(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &Object,
    ) -> Result<usize> {
        self.write()?
            .update(&self.registry, collection, filter, updates)
    }

    async fn delete_objects(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.write()?.delete(&self.registry, collection, filter)
    }

    async fn find_objects(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&SortOrder>,
    ) -> Result<Vec<Object>> {
        self.read()?.find(&self.registry, collection, filter, order)
    }

    async fn count_objects(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self
            .read()?
            .find(&self.registry, collection, filter, None)?
            .len())
    }

    async fn execute_batch(&self, batch: Vec<BatchOperation>) -> Result<()> {
        let mut inner = self.write()?;
        let mut staged = inner.clone();
        for op in batch {
            staged.apply(&self.registry, op)?;
        }
        *inner = staged;
        Ok(())
    }
}

#[async_trait]
impl ClientSyncLog for MemoryStore {
    async fn insert_entries(&self, entries: &[LogEntry]) -> Result<()> {
        self.write()?.log.extend_from_slice(entries);
        Ok(())
    }

    async fn entries_created_after(&self, since: Timestamp) -> Result<Vec<LogEntry>> {
        Ok(self.read()?.sorted(|e| e.created_on >= since))
    }

    async fn unshared_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.read()?.sorted(|e| e.shared_on.is_none()))
    }

    async fn update_shared_until(&self, until: Timestamp, shared_on: Timestamp) -> Result<()> {
        let mut inner = self.write()?;
        for entry in inner
            .log
            .iter_mut()
            .filter(|e| e.shared_on.is_none() && e.created_on <= until)
        {
            entry.shared_on = Some(shared_on);
        }
        Ok(())
    }

    async fn insert_received_entries(&self, entries: &[LogEntry], now: Timestamp) -> Result<usize> {
        let mut inner = self.write()?;
        let mut known: HashSet<LogEntryId> = inner.log.iter().map(LogEntry::id).collect();

        let mut inserted = 0;
        for entry in entries {
            if !known.insert(entry.id()) {
                continue;
            }
            let mut entry = entry.clone();
            entry.shared_on = Some(now);
            entry.needs_integration = true;
            inner.log.push(entry);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn mark_as_integrated(&self, ids: &[LogEntryId]) -> Result<()> {
        self.write()?.mark_integrated(ids);
        Ok(())
    }

    async fn next_object_to_integrate_except(
        &self,
        skip: &[ObjectKey],
    ) -> Result<Option<Vec<LogEntry>>> {
        let inner = self.read()?;
        let pending = inner.sorted(|e| {
            e.needs_integration && !skip.iter().any(|k| e.is_for(&k.collection, &k.pk))
        });
        let Some(oldest) = pending.first() else {
            return Ok(None);
        };
        Ok(Some(
            inner.sorted(|e| e.is_for(&oldest.collection, &oldest.pk)),
        ))
    }
}

/// In-memory relay log.
pub struct MemorySharedLog {
    inner: RwLock<SharedInner>,
}

#[derive(Default)]
struct SharedInner {
    devices: HashMap<DeviceId, Device>,
    entries: Vec<SharedLogEntry>,
    /// (receiving device, entry id)
    seen: HashSet<(DeviceId, LogEntryId)>,
    last_shared_on: Timestamp,
}

impl SharedInner {
    fn device_mut(&mut self, user_id: &UserId, device_id: &DeviceId) -> Result<&mut Device> {
        self.devices
            .get_mut(device_id)
            .filter(|d| &d.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("device {} of user {}", device_id, user_id)))
    }
}

impl MemorySharedLog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SharedInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SharedInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SharedInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemorySharedLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedSyncLog for MemorySharedLog {
    async fn create_device_id(&self, user_id: &UserId, shared_until: Timestamp) -> Result<DeviceId> {
        let mut inner = self.write()?;
        let mut id = generate_device_id();
        while inner.devices.contains_key(&id) {
            id = generate_device_id();
        }
        inner.devices.insert(
            id.clone(),
            Device {
                id: id.clone(),
                user_id: user_id.clone(),
                shared_until,
            },
        );

        // History already on the relay reaches the new device through fast
        // sync, not through the log.
        let existing: Vec<LogEntryId> = inner
            .entries
            .iter()
            .filter(|e| &e.user_id == user_id)
            .map(SharedLogEntry::id)
            .collect();
        for entry_id in existing {
            inner.seen.insert((id.clone(), entry_id));
        }
        Ok(id)
    }

    async fn device_info(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self
            .read()?
            .devices
            .get(device_id)
            .filter(|d| &d.user_id == user_id)
            .cloned())
    }

    async fn write_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entries: &[SharedEntryUpload],
    ) -> Result<Timestamp> {
        let mut inner = self.write()?;
        inner.device_mut(user_id, device_id)?;

        let shared_on = now_millis().max(inner.last_shared_on + 1);
        inner.last_shared_on = shared_on;

        let mut shared_until = None;
        for upload in entries {
            let duplicate = inner
                .entries
                .iter()
                .any(|e| &e.device_id == device_id && e.created_on == upload.created_on);
            if !duplicate {
                inner.entries.push(SharedLogEntry {
                    user_id: user_id.clone(),
                    device_id: device_id.clone(),
                    created_on: upload.created_on,
                    shared_on,
                    data: upload.data.clone(),
                });
            }
            shared_until = shared_until.max(Some(upload.created_on));
        }

        if let Some(until) = shared_until {
            let device = inner.device_mut(user_id, device_id)?;
            device.shared_until = device.shared_until.max(until);
        }
        Ok(shared_on)
    }

    async fn unsynced_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<SharedLogEntry>> {
        let inner = self.read()?;
        let mut entries: Vec<SharedLogEntry> = inner
            .entries
            .iter()
            .filter(|e| {
                &e.user_id == user_id
                    && &e.device_id != device_id
                    && !inner.seen.contains(&(device_id.clone(), e.id()))
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.created_on
                .cmp(&b.created_on)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(entries)
    }

    async fn mark_as_seen(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entry_ids: &[LogEntryId],
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner.device_mut(user_id, device_id)?;
        for id in entry_ids {
            inner.seen.insert((device_id.clone(), id.clone()));
        }
        Ok(())
    }
}
