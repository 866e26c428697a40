//! Configuration for the sync orchestrators.

use driftsync_core::{DoubleCreatePolicy, UserId};
use driftsync_sync::{ChannelConfig, FastSyncConfig, SyncRole};

/// Configuration for [`ContinuousSync`](crate::ContinuousSync).
#[derive(Debug, Clone)]
pub struct ContinuousSyncConfig {
    /// The user whose relay log is used. Required for `sync`.
    pub user_id: Option<UserId>,
    /// Maximum entries per upload.
    pub max_upload_batch_size: usize,
    /// Maximum encoded bytes per upload.
    pub max_upload_bytes: usize,
    pub double_create_policy: DoubleCreatePolicy,
    /// Collections whose changes are logged. Empty logs every registered
    /// collection.
    pub logged_collections: Vec<String>,
}

impl Default for ContinuousSyncConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            max_upload_batch_size: 100,
            max_upload_bytes: 256 * 1024,
            double_create_policy: DoubleCreatePolicy::Error,
            logged_collections: Vec::new(),
        }
    }
}

/// Configuration for [`InitialSync`](crate::InitialSync).
#[derive(Debug, Clone)]
pub struct InitialSyncConfig {
    pub channel: ChannelConfig,
    pub fast_sync: FastSyncConfig,
    /// Reconnect attempts after a stall or transport failure.
    pub max_reconnects: u32,
    /// Exchange object counts first and let the emptier side receive.
    pub negotiate_roles: bool,
    /// After the first transfer, swap roles so both sides end with the union.
    pub two_way: bool,
    /// Role used when negotiation is off or the counts tie.
    pub role: SyncRole,
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            fast_sync: FastSyncConfig::default(),
            max_reconnects: 3,
            negotiate_roles: false,
            two_way: false,
            role: SyncRole::Sender,
        }
    }
}

/// Top-level configuration bundle.
#[derive(Debug, Clone, Default)]
pub struct DriftConfig {
    pub continuous: ContinuousSyncConfig,
    pub initial: InitialSyncConfig,
}

impl DriftConfig {
    /// Split into the configurations of the two orchestrators.
    pub fn into_parts(self) -> (ContinuousSyncConfig, InitialSyncConfig) {
        (self.continuous, self.initial)
    }
}
