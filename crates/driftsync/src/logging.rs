//! Change capture: a [`Storage`] wrapper that logs every local write.
//!
//! Each logged write is committed together with its log entries in one
//! [`Storage::execute_batch`] call, so the object store and the client log
//! never disagree.
//!
//! | write                 | entries                                        |
//! |-----------------------|------------------------------------------------|
//! | create                | one `create` with the object minus its key     |
//! | update by key         | one `modify` per updated field                 |
//! | update by query       | one `modify` per object and changed field      |
//! | delete by key         | one `delete`                                   |
//! | delete by query       | one `delete` per affected object               |

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use driftsync_core::{
    CollectionSchema, DeviceId, ExecutableOperation, Filter, LogChange, LogEntry, Object,
    PrimaryKey, SchemaRegistry, SortOrder,
};
use driftsync_store::{BatchOperation, Storage, StoreError};

use crate::clock::LoggingContext;
use crate::error::{DriftError, Result};

pub struct SyncLoggingMiddleware<B: Storage + ?Sized> {
    backend: Arc<B>,
    context: Arc<LoggingContext>,
    /// `None` logs every collection.
    logged: Option<HashSet<String>>,
}

impl<B: Storage + ?Sized> SyncLoggingMiddleware<B> {
    pub fn new(backend: Arc<B>, context: Arc<LoggingContext>) -> Self {
        Self {
            backend,
            context,
            logged: None,
        }
    }

    /// Only log writes to these collections. An empty list logs everything.
    pub fn with_logged_collections<I, C>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let logged: HashSet<String> = collections.into_iter().map(Into::into).collect();
        self.logged = if logged.is_empty() { None } else { Some(logged) };
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn context(&self) -> &Arc<LoggingContext> {
        &self.context
    }

    pub fn is_logged(&self, collection: &str) -> bool {
        self.logged
            .as_ref()
            .map_or(true, |logged| logged.contains(collection))
    }

    /// Apply a write, logging it when logging is enabled for its collection.
    /// Returns the number of objects affected.
    pub async fn log_write(&self, op: ExecutableOperation) -> Result<usize> {
        let Some(device) = self.logging_device(op.collection())? else {
            return self.pass_through(op).await;
        };
        let schema = self.backend.registry().get(op.collection())?.clone();

        let (affected, entries) = match &op {
            ExecutableOperation::CreateObject { collection, object } => {
                let pk = schema.pk_of(object)?;
                let change = LogChange::Create {
                    value: schema.without_pk(object),
                };
                (1, vec![self.entry(collection, pk, change, &device).await?])
            }
            ExecutableOperation::UpdateObjects {
                collection,
                filter,
                updates,
            } => self.update_entries(&schema, collection, filter, updates, &device).await?,
            ExecutableOperation::DeleteObjects { collection, filter } => {
                self.delete_entries(&schema, collection, filter, &device).await?
            }
        };

        if affected == 0 {
            return Ok(0);
        }

        tracing::debug!(
            collection = op.collection(),
            entries = entries.len(),
            "logging local write"
        );
        self.backend
            .execute_batch(vec![
                BatchOperation::Execute(op),
                BatchOperation::AppendLogEntries(entries),
            ])
            .await?;
        Ok(affected)
    }

    /// The device to stamp entries with, or `None` when the write is not
    /// logged.
    fn logging_device(&self, collection: &str) -> Result<Option<DeviceId>> {
        if !self.context.is_enabled()? || !self.is_logged(collection) {
            return Ok(None);
        }
        self.context
            .device_id()?
            .map(Some)
            .ok_or(DriftError::MissingDeviceId)
    }

    async fn pass_through(&self, op: ExecutableOperation) -> Result<usize> {
        let affected = match op {
            ExecutableOperation::CreateObject { collection, object } => {
                self.backend.create_object(&collection, object).await?;
                1
            }
            ExecutableOperation::UpdateObjects {
                collection,
                filter,
                updates,
            } => self.backend.update_objects(&collection, &filter, &updates).await?,
            ExecutableOperation::DeleteObjects { collection, filter } => {
                self.backend.delete_objects(&collection, &filter).await?
            }
        };
        Ok(affected)
    }

    async fn update_entries(
        &self,
        schema: &CollectionSchema,
        collection: &str,
        filter: &Filter,
        updates: &Object,
        device: &DeviceId,
    ) -> Result<(usize, Vec<LogEntry>)> {
        let mut entries = Vec::new();

        if let Some(pk) = schema.pk_from_filter(filter) {
            let affected = self.backend.count_objects(collection, filter).await?;
            if affected > 0 {
                for (field, value) in updates {
                    let change = LogChange::Modify {
                        field: field.clone(),
                        value: value.clone(),
                    };
                    entries.push(self.entry(collection, pk.clone(), change, device).await?);
                }
            }
            return Ok((affected, entries));
        }

        let objects = self.backend.find_objects(collection, filter, None).await?;
        for object in &objects {
            let pk = schema.pk_of(object)?;
            for (field, value) in updates {
                if object.get(field) == Some(value) {
                    continue;
                }
                let change = LogChange::Modify {
                    field: field.clone(),
                    value: value.clone(),
                };
                entries.push(self.entry(collection, pk.clone(), change, device).await?);
            }
        }
        Ok((objects.len(), entries))
    }

    async fn delete_entries(
        &self,
        schema: &CollectionSchema,
        collection: &str,
        filter: &Filter,
        device: &DeviceId,
    ) -> Result<(usize, Vec<LogEntry>)> {
        if let Some(pk) = schema.pk_from_filter(filter) {
            let affected = self.backend.count_objects(collection, filter).await?;
            let entries = if affected > 0 {
                vec![self.entry(collection, pk, LogChange::Delete, device).await?]
            } else {
                Vec::new()
            };
            return Ok((affected, entries));
        }

        let objects = self.backend.find_objects(collection, filter, None).await?;
        let mut entries = Vec::with_capacity(objects.len());
        for object in &objects {
            let pk = schema.pk_of(object)?;
            entries.push(self.entry(collection, pk, LogChange::Delete, device).await?);
        }
        Ok((objects.len(), entries))
    }

    async fn entry(
        &self,
        collection: &str,
        pk: PrimaryKey,
        change: LogChange,
        device: &DeviceId,
    ) -> Result<LogEntry> {
        let created_on = self.context.clock().next().await;
        let entry = LogEntry::new(collection, pk, change, device.clone(), created_on);
        entry.validate(self.backend.registry())?;
        Ok(entry)
    }
}

fn into_store_error(error: DriftError) -> StoreError {
    match error {
        DriftError::Store(e) => e,
        DriftError::Schema(e) => StoreError::Core(e),
        other => StoreError::Rejected(other.to_string()),
    }
}

/// Reads and batches pass straight through. Batches are how sync applies
/// changes that are already logged elsewhere.
#[async_trait]
impl<B: Storage + ?Sized> Storage for SyncLoggingMiddleware<B> {
    fn registry(&self) -> &SchemaRegistry {
        self.backend.registry()
    }

    async fn create_object(&self, collection: &str, object: Object) -> driftsync_store::Result<()> {
        self.log_write(ExecutableOperation::CreateObject {
            collection: collection.to_string(),
            object,
        })
        .await
        .map(|_| ())
        .map_err(into_store_error)
    }

    async fn update_objects(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &Object,
    ) -> driftsync_store::Result<usize> {
        self.log_write(ExecutableOperation::UpdateObjects {
            collection: collection.to_string(),
            filter: filter.clone(),
            updates: updates.clone(),
        })
        .await
        .map_err(into_store_error)
    }

    async fn delete_objects(&self, collection: &str, filter: &Filter) -> driftsync_store::Result<usize> {
        self.log_write(ExecutableOperation::DeleteObjects {
            collection: collection.to_string(),
            filter: filter.clone(),
        })
        .await
        .map_err(into_store_error)
    }

    async fn find_objects(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&SortOrder>,
    ) -> driftsync_store::Result<Vec<Object>> {
        self.backend.find_objects(collection, filter, order).await
    }

    async fn count_objects(&self, collection: &str, filter: &Filter) -> driftsync_store::Result<usize> {
        self.backend.count_objects(collection, filter).await
    }

    async fn execute_batch(&self, batch: Vec<BatchOperation>) -> driftsync_store::Result<()> {
        self.backend.execute_batch(batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use driftsync_core::{CoreError, Operation};
    use driftsync_store::{ClientSyncLog, MemoryStore};
    use serde_json::{json, Value};

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, SyncLoggingMiddleware<MemoryStore>) {
        let registry = SchemaRegistry::new()
            .with(CollectionSchema::new("notes", "id"))
            .with(CollectionSchema::new("drafts", "id"));
        let store = Arc::new(MemoryStore::new(registry));
        let context = Arc::new(LoggingContext::new(Arc::new(ManualClock::new(1_000))));
        context.set_device_id(Some(DeviceId::new("dev-a"))).unwrap();
        context.enable().unwrap();
        let middleware =
            SyncLoggingMiddleware::new(store.clone(), context).with_logged_collections(["notes"]);
        (store, middleware)
    }

    async fn log(store: &MemoryStore) -> Vec<LogEntry> {
        store.entries_created_after(i64::MIN).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_logs_value_without_key() {
        let (store, middleware) = setup();
        middleware
            .create_object("notes", object(json!({"id": 1, "title": "a"})))
            .await
            .unwrap();

        let entries = log(&store).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pk, PrimaryKey::Single(json!(1)));
        assert_eq!(
            entries[0].change,
            LogChange::Create {
                value: object(json!({"title": "a"}))
            }
        );
        assert_eq!(entries[0].device_id, DeviceId::new("dev-a"));
        assert!(entries[0].shared_on.is_none());
    }

    #[tokio::test]
    async fn test_update_by_key_logs_every_field() {
        let (store, middleware) = setup();
        middleware
            .create_object("notes", object(json!({"id": 1, "title": "a", "done": false})))
            .await
            .unwrap();

        let touched = middleware
            .update_objects(
                "notes",
                &object(json!({"id": 1})),
                &object(json!({"title": "a", "done": true})),
            )
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let modifies: Vec<_> = log(&store)
            .await
            .into_iter()
            .filter(|e| e.operation() == Operation::Modify)
            .collect();
        assert_eq!(modifies.len(), 2);
        assert!(modifies[0].created_on < modifies[1].created_on);
    }

    #[tokio::test]
    async fn test_update_by_query_logs_only_changes() {
        let (store, middleware) = setup();
        for (id, color) in [(1, "red"), (2, "blue"), (3, "red")] {
            middleware
                .create_object("notes", object(json!({"id": id, "color": color, "list": "x"})))
                .await
                .unwrap();
        }

        let touched = middleware
            .update_objects(
                "notes",
                &object(json!({"list": "x"})),
                &object(json!({"color": "red"})),
            )
            .await
            .unwrap();
        assert_eq!(touched, 3);

        let modifies: Vec<_> = log(&store)
            .await
            .into_iter()
            .filter(|e| e.operation() == Operation::Modify)
            .collect();
        assert_eq!(modifies.len(), 1);
        assert_eq!(modifies[0].pk, PrimaryKey::Single(json!(2)));
    }

    #[tokio::test]
    async fn test_delete_by_query_logs_each_object() {
        let (store, middleware) = setup();
        for id in 1..=3 {
            middleware
                .create_object("notes", object(json!({"id": id, "archived": id != 2})))
                .await
                .unwrap();
        }

        let deleted = middleware
            .delete_objects("notes", &object(json!({"archived": true})))
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let deletes = log(&store)
            .await
            .into_iter()
            .filter(|e| e.operation() == Operation::Delete)
            .count();
        assert_eq!(deletes, 2);
        assert_eq!(store.count_objects("notes", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_logs_nothing() {
        let (store, middleware) = setup();
        let deleted = middleware
            .delete_objects("notes", &object(json!({"id": 9})))
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(log(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_collection_and_disabled_logging_pass_through() {
        let (store, middleware) = setup();
        middleware
            .create_object("drafts", object(json!({"id": 1})))
            .await
            .unwrap();
        middleware.context().disable().unwrap();
        middleware
            .create_object("notes", object(json!({"id": 1})))
            .await
            .unwrap();

        assert!(log(&store).await.is_empty());
        assert_eq!(store.count_objects("notes", &Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enabled_without_device_is_rejected() {
        let (store, middleware) = setup();
        middleware.context().set_device_id(None).unwrap();

        let result = middleware
            .log_write(ExecutableOperation::CreateObject {
                collection: "notes".into(),
                object: object(json!({"id": 1})),
            })
            .await;
        assert!(matches!(result, Err(DriftError::MissingDeviceId)));

        let result = middleware
            .create_object("notes", object(json!({"id": 1})))
            .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(store.count_objects("notes", &Filter::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_key_field_update_is_schema_error() {
        let (_store, middleware) = setup();
        middleware
            .create_object("notes", object(json!({"id": 1})))
            .await
            .unwrap();
        let result = middleware
            .update_objects("notes", &object(json!({"id": 1})), &object(json!({"id": 2})))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Core(CoreError::KeyFieldInPayload { .. }))
        ));
    }
}
