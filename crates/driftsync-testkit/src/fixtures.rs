//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use driftsync::sync::{Connector, SyncRole};
use driftsync::{
    ContinuousSync, ContinuousSyncConfig, DriftConfig, InitialSync, InitialSyncConfig,
    LoggingContext, ManualClock, MemorySettingsStore,
};
use driftsync_core::{CollectionSchema, DeviceId, Object, SchemaRegistry, UserId};
use driftsync_store::{MemorySharedLog, MemoryStore, Storage};
use serde_json::{json, Value};

/// Two collections: `notes` keyed by `id`, `tags` keyed by `(note, name)`.
pub fn sample_registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(CollectionSchema::new("notes", "id"))
        .with(CollectionSchema::compound("tags", &["note", "name"]))
}

/// A `notes` object.
pub fn note(id: i64, title: &str) -> Object {
    object(json!({ "id": id, "title": title }))
}

/// A `tags` object.
pub fn tag(note: i64, name: &str) -> Object {
    object(json!({ "note": note, "name": name }))
}

/// Unwrap a JSON object literal.
pub fn object(value: Value) -> Object {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A memory store holding notes `1..=count`.
pub async fn seeded_store(count: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(sample_registry()));
    for id in 1..=count {
        store
            .create_object("notes", note(id, &format!("note {id}")))
            .await
            .expect("seed note");
    }
    store
}

/// One device: its own store, a manual clock and a continuous sync session
/// against a shared relay.
pub struct DeviceFixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub settings: Arc<MemorySettingsStore>,
    pub sync: ContinuousSync<MemoryStore, MemorySharedLog, MemorySettingsStore>,
    /// Used by [`DeviceFixture::initial_sync`].
    pub initial: InitialSyncConfig,
}

impl DeviceFixture {
    /// A device whose clock starts at `start`.
    pub fn new(relay: Arc<MemorySharedLog>, start: i64) -> Self {
        Self::with_config(relay, start, ContinuousSyncConfig::default())
    }

    pub fn with_config(
        relay: Arc<MemorySharedLog>,
        start: i64,
        config: ContinuousSyncConfig,
    ) -> Self {
        Self::from_config(
            relay,
            start,
            DriftConfig {
                continuous: config,
                ..Default::default()
            },
        )
    }

    pub fn from_config(relay: Arc<MemorySharedLog>, start: i64, config: DriftConfig) -> Self {
        let (config, initial) = config.into_parts();
        let store = Arc::new(MemoryStore::new(sample_registry()));
        let clock = Arc::new(ManualClock::new(start));
        let settings = Arc::new(MemorySettingsStore::new());
        let context = Arc::new(LoggingContext::new(clock.clone()));
        let sync = ContinuousSync::new(store.clone(), relay, settings.clone(), context, config);
        Self {
            store,
            clock,
            settings,
            sync,
            initial,
        }
    }

    /// An initial sync session over this device's store in `role`.
    pub fn initial_sync<C: Connector>(
        &self,
        connector: C,
        role: SyncRole,
    ) -> InitialSync<MemoryStore, C> {
        let config = InitialSyncConfig {
            role,
            ..self.initial.clone()
        };
        InitialSync::new(self.store.clone(), connector, config)
    }

    /// Register with the relay under `user` and enable logging.
    pub async fn register(&self, user: &str) -> driftsync::Result<DeviceId> {
        self.sync.initialize_device(&UserId::new(user)).await
    }

    /// All notes in this device's store, ordered by key.
    pub async fn notes(&self) -> Vec<Object> {
        self.store
            .find_objects("notes", &Object::new(), None)
            .await
            .expect("read notes")
    }
}
