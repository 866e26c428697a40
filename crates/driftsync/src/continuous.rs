//! Continuous sync: push local entries to the relay, pull the other
//! devices' entries and fold them into local storage.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use driftsync_core::{
    DeviceId, ExecutableOperation, LogEntry, LogEntryId, ObjectKey, Reconciler,
    SharedEntryPayload, UserId,
};
use driftsync_store::{
    decode_payload, encode_payload, BatchOperation, ClientSyncLog, SharedEntryUpload,
    SharedLogEntry, SharedSyncLog, Storage, StorageExt,
};
use driftsync_sync::{EventBus, Interruptable};
use serde_json::Value;

use crate::clock::LoggingContext;
use crate::config::ContinuousSyncConfig;
use crate::error::{DriftError, Result};
use crate::logging::SyncLoggingMiddleware;
use crate::settings::{SettingsStore, SyncSettings, CONTINUOUS_SYNC_ENABLED, DEVICE_ID};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// One sync pass ended. `has_changes` is true when remote changes were
    /// applied locally.
    SyncFinished {
        has_changes: bool,
        error: Option<String>,
    },
    /// An object could not be integrated and was left pending.
    ObjectSkipped { object: ObjectKey, error: String },
}

/// Result of a sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Entries uploaded to the relay.
    pub pushed: usize,
    /// New entries received from the relay.
    pub pulled: usize,
    /// Objects whose pending entries were applied.
    pub integrated: usize,
    /// Objects left pending, with the reason.
    pub skipped: Vec<(ObjectKey, String)>,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        self.integrated > 0
    }
}

/// Split uploads into batches of at most `max_count` entries and
/// `max_bytes` encoded bytes.
///
/// A batch over the byte limit is halved until it fits. A single entry that
/// does not fit is [`DriftError::Capacity`].
pub fn plan_uploads(
    uploads: &[SharedEntryUpload],
    max_count: usize,
    max_bytes: usize,
) -> Result<Vec<&[SharedEntryUpload]>> {
    let bytes = |batch: &[SharedEntryUpload]| batch.iter().map(|u| u.data.len()).sum::<usize>();

    let mut batches = Vec::new();
    let mut rest = uploads;
    while !rest.is_empty() {
        let mut len = rest.len().min(max_count.max(1));
        while bytes(&rest[..len]) > max_bytes {
            if len == 1 {
                return Err(DriftError::Capacity {
                    entry_bytes: rest[0].data.len(),
                    limit: max_bytes,
                });
            }
            len /= 2;
        }
        batches.push(&rest[..len]);
        rest = &rest[len..];
    }
    Ok(batches)
}

pub struct ContinuousSync<S, R, K>
where
    S: Storage + ClientSyncLog,
    R: SharedSyncLog,
    K: SettingsStore,
{
    store: Arc<S>,
    relay: Arc<R>,
    settings: Arc<K>,
    context: Arc<LoggingContext>,
    config: ContinuousSyncConfig,
    user_id: RwLock<Option<UserId>>,
    events: EventBus<SyncEvent>,
}

impl<S, R, K> ContinuousSync<S, R, K>
where
    S: Storage + ClientSyncLog,
    R: SharedSyncLog,
    K: SettingsStore,
{
    pub fn new(
        store: Arc<S>,
        relay: Arc<R>,
        settings: Arc<K>,
        context: Arc<LoggingContext>,
        config: ContinuousSyncConfig,
    ) -> Self {
        let user_id = RwLock::new(config.user_id.clone());
        Self {
            store,
            relay,
            settings,
            context,
            config,
            user_id,
            events: EventBus::default(),
        }
    }

    pub fn events(&self) -> &EventBus<SyncEvent> {
        &self.events
    }

    pub fn context(&self) -> &Arc<LoggingContext> {
        &self.context
    }

    /// A change-capture wrapper over the same store and session.
    pub fn middleware(&self) -> SyncLoggingMiddleware<S> {
        SyncLoggingMiddleware::new(self.store.clone(), self.context.clone())
            .with_logged_collections(self.config.logged_collections.iter().cloned())
    }

    /// Restore the session from settings. Returns whether logging is now on.
    pub async fn setup(&self) -> Result<bool> {
        let enabled = self.settings.continuous_sync_enabled().await?;
        let device_id = self.settings.device_id().await?;

        let Some(device_id) = device_id else {
            tracing::debug!("no device id stored, continuous sync stays off");
            return Ok(false);
        };
        self.context.set_device_id(Some(device_id.clone()))?;

        // Never stamp below what this device already logged.
        if let Some(last) = self.store.entries_created_after(i64::MIN).await?.last() {
            self.context.clock().observe(last.created_on).await;
        }

        if enabled {
            self.context.enable()?;
            tracing::info!(device = %device_id, "continuous sync enabled");
        }
        Ok(enabled)
    }

    /// Register this installation with the relay and turn logging on.
    pub async fn initialize_device(&self, user_id: &UserId) -> Result<DeviceId> {
        let shared_until = self.context.clock().now();
        let device_id = self.relay.create_device_id(user_id, shared_until).await?;

        self.settings
            .store_setting(DEVICE_ID, Value::String(device_id.as_str().to_string()))
            .await?;
        self.settings
            .store_setting(CONTINUOUS_SYNC_ENABLED, Value::Bool(true))
            .await?;

        *self.user_id.write().map_err(|e| DriftError::Poisoned(e.to_string()))? =
            Some(user_id.clone());
        self.context.set_device_id(Some(device_id.clone()))?;
        self.context.enable()?;

        tracing::info!(user = %user_id, device = %device_id, "device initialized");
        Ok(device_id)
    }

    /// One push, pull and integrate pass. Always emits
    /// [`SyncEvent::SyncFinished`].
    pub async fn sync(&self) -> Result<SyncReport> {
        let result = self.sync_once().await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    integrated = report.integrated,
                    skipped = report.skipped.len(),
                    "sync finished"
                );
                self.events.emit(SyncEvent::SyncFinished {
                    has_changes: report.has_changes(),
                    error: None,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync failed");
                self.events.emit(SyncEvent::SyncFinished {
                    has_changes: false,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    /// Sync every `interval` until `interruptable` is cancelled. Failed
    /// passes are reported and the loop carries on.
    pub async fn run(&self, interval: Duration, interruptable: &Interruptable) -> Result<()> {
        while interruptable.gate().await? {
            if self.context.is_enabled()? {
                // Errors are already reported through the event bus.
                let _ = self.sync().await;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = interruptable.cancelled() => break,
            }
        }
        tracing::info!("continuous sync stopped");
        Ok(())
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let user_id = self
            .user_id
            .read()
            .map_err(|e| DriftError::Poisoned(e.to_string()))?
            .clone()
            .ok_or(DriftError::MissingUserId)?;
        let device_id = self
            .context
            .device_id()?
            .ok_or(DriftError::MissingDeviceId)?;

        let pushed = self.push(&user_id, &device_id).await?;
        let pulled = self.pull(&user_id, &device_id).await?;
        let (integrated, skipped) = self.integrate().await?;

        Ok(SyncReport {
            pushed,
            pulled,
            integrated,
            skipped,
        })
    }

    async fn push(&self, user_id: &UserId, device_id: &DeviceId) -> Result<usize> {
        let entries = self.store.unshared_entries().await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let uploads = entries
            .iter()
            .map(|entry| {
                Ok(SharedEntryUpload {
                    created_on: entry.created_on,
                    data: encode_payload(&SharedEntryPayload::from(entry))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let batches = plan_uploads(
            &uploads,
            self.config.max_upload_batch_size,
            self.config.max_upload_bytes,
        )?;

        for batch in batches {
            let shared_on = self.relay.write_entries(user_id, device_id, batch).await?;
            if let Some(last) = batch.last() {
                self.store.update_shared_until(last.created_on, shared_on).await?;
            }
            tracing::debug!(entries = batch.len(), "pushed batch");
        }
        Ok(uploads.len())
    }

    async fn pull(&self, user_id: &UserId, device_id: &DeviceId) -> Result<usize> {
        let shared = self.relay.unsynced_entries(user_id, device_id).await?;
        if shared.is_empty() {
            return Ok(0);
        }

        let mut entries = Vec::with_capacity(shared.len());
        let mut seen: Vec<LogEntryId> = Vec::with_capacity(shared.len());
        for item in &shared {
            seen.push(item.id());
            match self.decode(item) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        device = %item.device_id,
                        created_on = item.created_on,
                        error = %e,
                        "dropping invalid relay entry"
                    );
                }
            }
        }

        let inserted = self
            .store
            .insert_received_entries(&entries, self.context.clock().now())
            .await?;
        self.relay.mark_as_seen(user_id, device_id, &seen).await?;
        tracing::debug!(received = shared.len(), inserted, "pulled entries");
        Ok(inserted)
    }

    fn decode(&self, item: &SharedLogEntry) -> Result<LogEntry> {
        let entry = decode_payload(&item.data)?.into_entry(item.device_id.clone(), item.created_on);
        entry.validate(self.store.registry())?;
        Ok(entry)
    }

    /// Fold pending entries object by object, oldest pending first.
    async fn integrate(&self) -> Result<(usize, Vec<(ObjectKey, String)>)> {
        let reconciler =
            Reconciler::new(self.store.registry()).with_policy(self.config.double_create_policy);
        let mut skip: Vec<ObjectKey> = Vec::new();
        let mut skipped = Vec::new();
        let mut integrated = 0;

        while let Some(history) = self.store.next_object_to_integrate_except(&skip).await? {
            let Some(first) = history.first() else {
                break;
            };
            let object = first.object_key();
            let pending: Vec<LogEntryId> = history
                .iter()
                .filter(|e| e.needs_integration)
                .map(LogEntry::id)
                .collect();

            let applied = match reconciler.reconcile_object(&history) {
                Ok(operations) => self.apply(operations, pending).await,
                Err(e) => Err(DriftError::from(e)),
            };

            match applied {
                Ok(()) => integrated += 1,
                Err(e) => {
                    tracing::warn!(%object, error = %e, "skipping object");
                    self.events.emit(SyncEvent::ObjectSkipped {
                        object: object.clone(),
                        error: e.to_string(),
                    });
                    skipped.push((object.clone(), e.to_string()));
                    skip.push(object);
                }
            }
        }
        Ok((integrated, skipped))
    }

    /// Apply one object's operations and mark its entries integrated.
    async fn apply(
        &self,
        operations: Vec<ExecutableOperation>,
        pending: Vec<LogEntryId>,
    ) -> Result<()> {
        let operations = self.adopt_existing(operations).await?;
        let mut batch: Vec<BatchOperation> =
            operations.into_iter().map(BatchOperation::Execute).collect();
        batch.push(BatchOperation::MarkIntegrated(pending));
        self.store.execute_batch(batch).await?;
        Ok(())
    }

    /// A lone create for an object that is already stored, for example one
    /// copied in by fast sync, is applied as an update of its fields.
    async fn adopt_existing(
        &self,
        operations: Vec<ExecutableOperation>,
    ) -> Result<Vec<ExecutableOperation>> {
        let single_create = match operations.as_slice() {
            [ExecutableOperation::CreateObject { collection, object }] => {
                Some((collection.clone(), object.clone()))
            }
            _ => None,
        };
        let Some((collection, object)) = single_create else {
            return Ok(operations);
        };

        let schema = self.store.registry().get(&collection)?;
        let pk = schema.pk_of(&object)?;
        if self.store.find_by_pk(&collection, &pk).await?.is_none() {
            return Ok(operations);
        }

        tracing::debug!(%collection, pk = %pk.canonical(), "create of stored object applied as update");
        Ok(vec![ExecutableOperation::UpdateObjects {
            filter: schema.pk_filter(&pk)?,
            updates: schema.without_pk(&object),
            collection,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn upload(created_on: i64, size: usize) -> SharedEntryUpload {
        SharedEntryUpload {
            created_on,
            data: Bytes::from(vec![0u8; size]),
        }
    }

    #[test]
    fn test_plan_respects_count_limit() {
        let uploads: Vec<_> = (0..5).map(|i| upload(i, 10)).collect();
        let batches = plan_uploads(&uploads, 2, 1_000).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_plan_halves_oversized_batches() {
        let uploads: Vec<_> = (0..4).map(|i| upload(i, 40)).collect();
        let batches = plan_uploads(&uploads, 100, 100).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2]);
        assert_eq!(batches.concat(), uploads);
    }

    #[test]
    fn test_plan_rejects_entry_over_limit() {
        let uploads = vec![upload(1, 10), upload(2, 500)];
        assert!(matches!(
            plan_uploads(&uploads, 100, 100),
            Err(DriftError::Capacity {
                entry_bytes: 500,
                limit: 100
            })
        ));
    }

    #[test]
    fn test_report_has_changes_only_when_integrated() {
        let mut report = SyncReport {
            pushed: 3,
            ..Default::default()
        };
        assert!(!report.has_changes());
        report.integrated = 1;
        assert!(report.has_changes());
    }

    proptest::proptest! {
        #[test]
        fn planned_batches_cover_uploads_within_limits(
            sizes in proptest::collection::vec(1usize..64, 0..40),
            max_count in 1usize..10,
            max_bytes in 64usize..256,
        ) {
            let uploads: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| upload(i as i64, *size))
                .collect();
            let batches = plan_uploads(&uploads, max_count, max_bytes).unwrap();

            for batch in &batches {
                proptest::prop_assert!(!batch.is_empty());
                proptest::prop_assert!(batch.len() <= max_count);
                proptest::prop_assert!(batch.iter().map(|u| u.data.len()).sum::<usize>() <= max_bytes);
            }
            proptest::prop_assert_eq!(batches.concat(), uploads);
        }
    }
}
