//! The sync channel: confirmed, chunked package exchange over a transport.
//!
//! Every package except `confirm` is acknowledged by the receiver, and a
//! sender never has more than one unconfirmed package outstanding.
//!
//! ```text
//! Sender                               Receiver
//!   |-------- sync-info -------------->|
//!   |<------- confirm -----------------|
//!   |-------- batch ------------------>|
//!   |<------- confirm -----------------|
//!   |-------- state-change paused ---->|   (stall timeout suspended)
//!   |<------- confirm -----------------|
//!   |-------- state-change running --->|
//!   |<------- confirm -----------------|
//!   |-------- finish ----------------->|
//!   |<------- confirm -----------------|
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use driftsync_core::Object;

use crate::chunking::{receive_in_chunks, send_in_chunks};
use crate::error::{Result, SyncError};
use crate::interruptable::Interruptable;
use crate::transport::Transport;

/// Objects of one collection travelling together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectBatch {
    pub collection: String,
    pub objects: Vec<Object>,
}

/// Totals announced by the sender before any batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub collection_count: usize,
    pub object_count: usize,
}

/// Sender state announced with `state-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Paused,
    Running,
}

/// Package vocabulary of the channel. JSON on the wire, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncPackage {
    Batch { batch: ObjectBatch },
    SyncInfo { info: SyncInfo },
    UserPackage { package: Value },
    Finish,
    Confirm,
    StateChange { state: PeerState },
}

impl SyncPackage {
    /// Wire name of the package type.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncPackage::Batch { .. } => "batch",
            SyncPackage::SyncInfo { .. } => "sync-info",
            SyncPackage::UserPackage { .. } => "user-package",
            SyncPackage::Finish => "finish",
            SyncPackage::Confirm => "confirm",
            SyncPackage::StateChange { .. } => "state-change",
        }
    }
}

/// Configuration for a [`SyncChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound on each wait for the next chunk or confirmation. `None` waits
    /// forever.
    pub timeout: Option<Duration>,
    /// Maximum characters per chunk.
    pub chunk_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            chunk_size: 10_000,
        }
    }
}

/// Observe or delay traffic without changing its meaning.
#[async_trait]
pub trait ChannelHooks: Send + Sync {
    /// Runs before a package is written.
    async fn pre_send(&self, _package: &SyncPackage) {}

    /// Runs after a package has been decoded.
    async fn post_receive(&self, _package: &SyncPackage) {}
}

pub struct SyncChannel<T: Transport> {
    transport: T,
    config: ChannelConfig,
    hooks: Option<Arc<dyn ChannelHooks>>,
    interruptable: Interruptable,
    peer_paused: bool,
    destroyed: bool,
}

impl<T: Transport> SyncChannel<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            hooks: None,
            interruptable: Interruptable::new(),
            peer_paused: false,
            destroyed: false,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ChannelHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// A handle that aborts in-flight chunk loops when cancelled.
    pub fn abort_handle(&self) -> Interruptable {
        self.interruptable.clone()
    }

    /// Whether the peer last reported itself paused.
    pub fn is_peer_paused(&self) -> bool {
        self.peer_paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed || self.interruptable.is_cancelled()
    }

    /// Send a package and wait for its confirmation.
    pub async fn send_package(&mut self, package: SyncPackage) -> Result<()> {
        self.ensure_open()?;
        self.write(&package).await?;

        loop {
            match self.read().await? {
                SyncPackage::Confirm => return Ok(()),
                SyncPackage::StateChange { state } => self.peer_state_changed(state).await?,
                other => {
                    return Err(SyncError::UnexpectedPackage {
                        expected: "confirm".into(),
                        got: other.kind().into(),
                    })
                }
            }
        }
    }

    /// Receive the next package and confirm it.
    ///
    /// `state-change` packages are consumed here.
    pub async fn receive_package(&mut self) -> Result<SyncPackage> {
        self.ensure_open()?;

        loop {
            match self.read().await? {
                SyncPackage::Confirm => {
                    tracing::warn!("ignoring stray confirm");
                }
                SyncPackage::StateChange { state } => self.peer_state_changed(state).await?,
                package => {
                    self.write(&SyncPackage::Confirm).await?;
                    return Ok(package);
                }
            }
        }
    }

    /// Abort in-flight work and release the transport. Safe to repeat.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.interruptable.cancel();
        self.transport.destroy().await;
        tracing::debug!("sync channel destroyed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SyncError::ChannelClosed);
        }
        Ok(())
    }

    async fn peer_state_changed(&mut self, state: PeerState) -> Result<()> {
        self.peer_paused = state == PeerState::Paused;
        tracing::debug!(?state, "peer state changed");
        self.write(&SyncPackage::Confirm).await
    }

    async fn write(&mut self, package: &SyncPackage) -> Result<()> {
        if let Some(hooks) = &self.hooks {
            hooks.pre_send(package).await;
        }
        let payload = serde_json::to_string(package)?;
        tracing::debug!(kind = package.kind(), bytes = payload.len(), "sending package");

        let completed = send_in_chunks(
            &self.transport,
            &payload,
            self.config.chunk_size,
            &self.interruptable,
        )
        .await?;
        if !completed {
            return Err(SyncError::ChannelClosed);
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<SyncPackage> {
        let timeout = if self.peer_paused {
            None
        } else {
            self.config.timeout
        };

        let payload = receive_in_chunks(&self.transport, timeout, &self.interruptable)
            .await?
            .ok_or(SyncError::ChannelClosed)?;
        let package: SyncPackage = serde_json::from_str(&payload)?;

        if let Some(hooks) = &self.hooks {
            hooks.post_receive(&package).await;
        }
        tracing::debug!(kind = package.kind(), "received package");
        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{pair, MemoryTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channels(config: ChannelConfig) -> (SyncChannel<MemoryTransport>, SyncChannel<MemoryTransport>) {
        let (a, b) = pair();
        (
            SyncChannel::new(a, config.clone()),
            SyncChannel::new(b, config),
        )
    }

    #[test]
    fn test_package_wire_format() {
        let info = SyncPackage::SyncInfo {
            info: SyncInfo {
                collection_count: 2,
                object_count: 5,
            },
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({"type": "sync-info", "info": {"collectionCount": 2, "objectCount": 5}})
        );
        assert_eq!(
            serde_json::to_value(SyncPackage::StateChange { state: PeerState::Paused }).unwrap(),
            json!({"type": "state-change", "state": "paused"})
        );
        assert_eq!(
            serde_json::to_value(SyncPackage::Finish).unwrap(),
            json!({"type": "finish"})
        );
    }

    #[tokio::test]
    async fn test_send_waits_for_confirm() {
        let (mut sender, mut receiver) = channels(ChannelConfig {
            timeout: Some(Duration::from_secs(2)),
            chunk_size: 8,
        });

        let package = SyncPackage::UserPackage {
            package: json!({"objectCount": 12, "note": "long enough to need several chunks"}),
        };
        let expected = package.clone();

        let send = tokio::spawn(async move {
            sender.send_package(package).await.unwrap();
            sender.send_package(SyncPackage::Finish).await.unwrap();
        });

        assert_eq!(receiver.receive_package().await.unwrap(), expected);
        assert_eq!(receiver.receive_package().await.unwrap(), SyncPackage::Finish);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_confirm_stalls() {
        let (mut sender, _receiver) = channels(ChannelConfig {
            timeout: Some(Duration::from_millis(30)),
            chunk_size: 100,
        });
        let result = sender.send_package(SyncPackage::Finish).await;
        assert!(matches!(result, Err(SyncError::Stalled { .. })));
    }

    #[tokio::test]
    async fn test_peer_pause_suspends_timeout() {
        let (mut sender, mut receiver) = channels(ChannelConfig {
            timeout: Some(Duration::from_millis(50)),
            chunk_size: 100,
        });

        let send = tokio::spawn(async move {
            sender
                .send_package(SyncPackage::StateChange { state: PeerState::Paused })
                .await
                .unwrap();
            // Longer than the receiver's timeout.
            tokio::time::sleep(Duration::from_millis(150)).await;
            sender
                .send_package(SyncPackage::StateChange { state: PeerState::Running })
                .await
                .unwrap();
            sender.send_package(SyncPackage::Finish).await.unwrap();
        });

        assert_eq!(receiver.receive_package().await.unwrap(), SyncPackage::Finish);
        assert!(!receiver.is_peer_paused());
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_destroyed_channel_rejects_operations() {
        let (mut sender, _receiver) = channels(ChannelConfig::default());
        sender.destroy().await;
        sender.destroy().await;
        assert!(matches!(
            sender.send_package(SyncPackage::Finish).await,
            Err(SyncError::ChannelClosed)
        ));
        assert!(matches!(
            sender.receive_package().await,
            Err(SyncError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_abort_handle_interrupts_receive() {
        let (_sender, mut receiver) = channels(ChannelConfig {
            timeout: None,
            chunk_size: 100,
        });
        let abort = receiver.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            abort.cancel();
        });
        assert!(matches!(
            receiver.receive_package().await,
            Err(SyncError::ChannelClosed)
        ));
    }

    struct CountingHooks {
        sent: AtomicUsize,
        received: AtomicUsize,
    }

    #[async_trait]
    impl ChannelHooks for CountingHooks {
        async fn pre_send(&self, _package: &SyncPackage) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }

        async fn post_receive(&self, _package: &SyncPackage) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_hooks_see_packages_and_confirms() {
        let hooks = Arc::new(CountingHooks {
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
        });
        let (a, b) = pair();
        let mut sender = SyncChannel::new(a, ChannelConfig::default()).with_hooks(hooks.clone());
        let mut receiver = SyncChannel::new(b, ChannelConfig::default());

        let send = tokio::spawn(async move { sender.send_package(SyncPackage::Finish).await });
        receiver.receive_package().await.unwrap();
        send.await.unwrap().unwrap();

        // finish out, confirm in
        assert_eq!(hooks.sent.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.received.load(Ordering::SeqCst), 1);
    }
}
