//! Initial sync: bring a fresh device up to date with a full snapshot from
//! a peer, over a [`Connector`], surviving stalls by reconnecting.
//!
//! ## Session
//!
//! 1. Connect (`Connecting`, `Connected`).
//! 2. Optionally exchange object counts as `user-package`s; the peer with
//!    fewer objects receives (`RoleSwitch` when that changes the role). The
//!    pre-assigned sender speaks first.
//! 3. Run fast sync in the final role. On a stall or transport failure the
//!    channel is destroyed, a new one is connected (`Reconnected`) and the
//!    same sender or receiver resumes.
//! 4. In two-way mode the roles swap and the second sender skips every
//!    object it received in step 3, so both sides end with the union.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use driftsync_core::{Object, SchemaRegistry};
use driftsync_store::Storage;
use driftsync_sync::{
    count_sync_objects, decide_role, sync_collections, ChannelHooks, Connector, EventBus,
    FastSyncEvent, FastSyncOutcome, FastSyncProgress, FastSyncReceiver, FastSyncSender,
    Interruptable, ObjectPreprocessor, ReceivedKey, SyncChannel, SyncError, SyncInfo, SyncPackage,
    SyncRole,
};

use crate::config::InitialSyncConfig;
use crate::error::{DriftError, Result};

const OBJECT_COUNT: &str = "objectCount";

#[derive(Debug, Clone, PartialEq)]
pub enum InitialSyncEvent {
    Connecting,
    Connected,
    /// A fresh channel replaced a failed one.
    Reconnected { attempt: u32 },
    RoleSwitch { before: SyncRole, after: SyncRole },
    Prepared { info: SyncInfo },
    Progress { progress: FastSyncProgress },
    UserPackage { package: Value },
    Paused,
    Resumed,
    Finished { outcome: FastSyncOutcome },
}

impl From<FastSyncEvent> for InitialSyncEvent {
    fn from(event: FastSyncEvent) -> Self {
        match event {
            FastSyncEvent::Prepared { info } => InitialSyncEvent::Prepared { info },
            FastSyncEvent::Progress { progress } => InitialSyncEvent::Progress { progress },
            FastSyncEvent::UserPackage { package } => InitialSyncEvent::UserPackage { package },
            FastSyncEvent::Paused => InitialSyncEvent::Paused,
            FastSyncEvent::Resumed => InitialSyncEvent::Resumed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialSyncReport {
    pub outcome: FastSyncOutcome,
    /// Role of the first (or only) transfer.
    pub role: SyncRole,
    pub reconnects: u32,
}

/// Skips objects the peer sent us, by key.
struct ExcludeReceived {
    registry: SchemaRegistry,
    keys: HashSet<ReceivedKey>,
}

impl ObjectPreprocessor for ExcludeReceived {
    fn process(&self, collection: &str, object: Object) -> Option<Object> {
        let pk = match self.registry.get(collection).and_then(|s| s.pk_of(&object)) {
            Ok(pk) => pk,
            Err(_) => return Some(object),
        };
        if self.keys.contains(&(collection.to_string(), pk.canonical())) {
            None
        } else {
            Some(object)
        }
    }
}

enum Side<S: Storage + ?Sized> {
    Sender(FastSyncSender<S, InitialSyncEvent>),
    Receiver(FastSyncReceiver<S, InitialSyncEvent>),
}

impl<S: Storage + ?Sized> Side<S> {
    async fn execute<T: driftsync_sync::Transport>(
        &mut self,
        channel: &mut SyncChannel<T>,
    ) -> driftsync_sync::Result<FastSyncOutcome> {
        match self {
            Side::Sender(sender) => sender.execute(channel).await,
            Side::Receiver(receiver) => receiver.execute(channel).await,
        }
    }
}

pub struct InitialSync<S: Storage + ?Sized, C: Connector> {
    storage: Arc<S>,
    connector: C,
    config: InitialSyncConfig,
    hooks: Option<Arc<dyn ChannelHooks>>,
    interruptable: Interruptable,
    /// Abort handle of the live channel.
    channel_abort: Mutex<Option<Interruptable>>,
    events: EventBus<InitialSyncEvent>,
}

impl<S: Storage + ?Sized, C: Connector> InitialSync<S, C> {
    pub fn new(storage: Arc<S>, connector: C, config: InitialSyncConfig) -> Self {
        Self {
            storage,
            connector,
            config,
            hooks: None,
            interruptable: Interruptable::new(),
            channel_abort: Mutex::new(None),
            events: EventBus::default(),
        }
    }

    /// Install hooks on every channel this session opens.
    pub fn with_hooks(mut self, hooks: Arc<dyn ChannelHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn events(&self) -> &EventBus<InitialSyncEvent> {
        &self.events
    }

    pub fn pause(&self) {
        self.interruptable.pause();
    }

    pub fn resume(&self) {
        self.interruptable.resume();
    }

    /// Stop at the next step boundary.
    pub fn cancel(&self) {
        self.interruptable.cancel();
    }

    /// Stop immediately and tear down the channel without telling the peer.
    pub fn abort(&self) {
        self.interruptable.cancel();
        let guard = self
            .channel_abort
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = guard.as_ref() {
            handle.cancel();
        }
        tracing::info!("initial sync aborted");
    }

    /// Run the whole session.
    pub async fn run(&self) -> Result<InitialSyncReport> {
        self.events.emit(InitialSyncEvent::Connecting);
        let mut channel = self.open_channel().await?;
        self.events.emit(InitialSyncEvent::Connected);

        let result = self.session(&mut channel).await;
        channel.destroy().await;

        let report = result?;
        tracing::info!(outcome = ?report.outcome, role = ?report.role, "initial sync done");
        self.events.emit(InitialSyncEvent::Finished {
            outcome: report.outcome,
        });
        Ok(report)
    }

    async fn session(
        &self,
        channel: &mut SyncChannel<C::Transport>,
    ) -> Result<InitialSyncReport> {
        let mut role = self.config.role;
        if self.config.negotiate_roles {
            let before = role;
            role = self.negotiate(channel, before).await?;
            if role != before {
                tracing::info!(?before, after = ?role, "role switch");
                self.events.emit(InitialSyncEvent::RoleSwitch {
                    before,
                    after: role,
                });
            }
        }

        let mut reconnects = 0;
        let mut side = self.side(role, None);
        let mut outcome = self.transfer(channel, &mut side, &mut reconnects).await?;

        if self.config.two_way && outcome == FastSyncOutcome::Finished {
            let received = match &side {
                Side::Receiver(receiver) => Some(receiver.received_keys().clone()),
                Side::Sender(_) => None,
            };
            tracing::info!(role = ?role.opposite(), "starting reverse transfer");
            let mut reverse = self.side(role.opposite(), received);
            outcome = self.transfer(channel, &mut reverse, &mut reconnects).await?;
        }

        Ok(InitialSyncReport {
            outcome,
            role,
            reconnects,
        })
    }

    fn side(&self, role: SyncRole, exclude: Option<HashSet<ReceivedKey>>) -> Side<S> {
        match role {
            SyncRole::Sender => {
                let mut sender = FastSyncSender::new(
                    self.storage.clone(),
                    self.config.fast_sync.clone(),
                    self.interruptable.clone(),
                    self.events.clone(),
                );
                if let Some(keys) = exclude {
                    sender = sender.with_preprocessor(Arc::new(ExcludeReceived {
                        registry: self.storage.registry().clone(),
                        keys,
                    }));
                }
                Side::Sender(sender)
            }
            SyncRole::Receiver => Side::Receiver(FastSyncReceiver::new(
                self.storage.clone(),
                self.interruptable.clone(),
                self.events.clone(),
            )),
        }
    }

    /// Drive one side to completion, reconnecting on recoverable failures.
    async fn transfer(
        &self,
        channel: &mut SyncChannel<C::Transport>,
        side: &mut Side<S>,
        reconnects: &mut u32,
    ) -> Result<FastSyncOutcome> {
        loop {
            let error = match side.execute(channel).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            if self.interruptable.is_cancelled() {
                tracing::info!(error = %error, "transfer stopped after cancellation");
                return Ok(FastSyncOutcome::Cancelled);
            }
            if !error.is_recoverable() {
                return Err(error.into());
            }
            if *reconnects >= self.config.max_reconnects {
                return Err(DriftError::ReconnectsExhausted {
                    attempts: *reconnects,
                    source: error,
                });
            }

            *reconnects += 1;
            tracing::warn!(error = %error, attempt = *reconnects, "transfer interrupted, reconnecting");
            channel.destroy().await;
            *channel = self.open_channel().await?;
            self.events.emit(InitialSyncEvent::Reconnected {
                attempt: *reconnects,
            });
        }
    }

    async fn negotiate(
        &self,
        channel: &mut SyncChannel<C::Transport>,
        preassigned: SyncRole,
    ) -> Result<SyncRole> {
        let collections = sync_collections(self.storage.registry(), &self.config.fast_sync)?;
        let local = count_sync_objects(&*self.storage, &collections)
            .await?
            .object_count;
        let mut counts = serde_json::Map::new();
        counts.insert(OBJECT_COUNT.to_string(), json!(local));
        let announce = SyncPackage::UserPackage {
            package: Value::Object(counts),
        };

        let remote = match preassigned {
            SyncRole::Sender => {
                channel.send_package(announce).await?;
                read_object_count(channel.receive_package().await?)?
            }
            SyncRole::Receiver => {
                let remote = read_object_count(channel.receive_package().await?)?;
                channel.send_package(announce).await?;
                remote
            }
        };

        tracing::debug!(local, remote, "object counts exchanged");
        Ok(decide_role(preassigned, local, remote))
    }

    async fn open_channel(&self) -> Result<SyncChannel<C::Transport>> {
        let transport = self.connector.connect().await?;
        let mut channel = SyncChannel::new(transport, self.config.channel.clone());
        if let Some(hooks) = &self.hooks {
            channel = channel.with_hooks(hooks.clone());
        }

        let mut guard = self
            .channel_abort
            .lock()
            .map_err(|e| DriftError::Poisoned(e.to_string()))?;
        let handle = channel.abort_handle();
        if self.interruptable.is_cancelled() {
            handle.cancel();
        }
        *guard = Some(handle);
        Ok(channel)
    }
}

fn read_object_count(package: SyncPackage) -> std::result::Result<usize, SyncError> {
    match package {
        SyncPackage::UserPackage { package } => package
            .get(OBJECT_COUNT)
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| SyncError::InvalidPackage(format!("no {} in {}", OBJECT_COUNT, package))),
        other => Err(SyncError::UnexpectedPackage {
            expected: "user-package".into(),
            got: other.kind().into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::CollectionSchema;

    #[test]
    fn test_fast_sync_events_map_across() {
        assert_eq!(
            InitialSyncEvent::from(FastSyncEvent::Paused),
            InitialSyncEvent::Paused
        );
        let info = SyncInfo {
            collection_count: 1,
            object_count: 2,
        };
        assert_eq!(
            InitialSyncEvent::from(FastSyncEvent::Prepared { info }),
            InitialSyncEvent::Prepared { info }
        );
    }

    #[test]
    fn test_read_object_count() {
        let count = read_object_count(SyncPackage::UserPackage {
            package: json!({"objectCount": 7}),
        });
        assert_eq!(count.unwrap(), 7);

        assert!(matches!(
            read_object_count(SyncPackage::UserPackage { package: json!({}) }),
            Err(SyncError::InvalidPackage(_))
        ));
        assert!(matches!(
            read_object_count(SyncPackage::Finish),
            Err(SyncError::UnexpectedPackage { .. })
        ));
    }

    #[test]
    fn test_exclusion_by_key() {
        let registry = SchemaRegistry::new().with(CollectionSchema::new("notes", "id"));
        let mut keys = HashSet::new();
        keys.insert(("notes".to_string(), "1".to_string()));
        let exclude = ExcludeReceived { registry, keys };

        let seen = json!({"id": 1}).as_object().cloned().unwrap();
        let fresh = json!({"id": 2}).as_object().cloned().unwrap();
        assert!(exclude.process("notes", seen).is_none());
        assert!(exclude.process("notes", fresh).is_some());
    }
}
