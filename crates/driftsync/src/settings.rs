//! Settings persistence: the continuous-sync toggle and the device id.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use driftsync_core::DeviceId;

use crate::error::{DriftError, Result};

pub const CONTINUOUS_SYNC_ENABLED: &str = "continuousSyncEnabled";
pub const DEVICE_ID: &str = "deviceId";

/// Key-value settings owned by the application.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn retrieve_setting(&self, key: &str) -> Result<Option<Value>>;

    async fn store_setting(&self, key: &str, value: Value) -> Result<()>;
}

/// Typed accessors for the settings driftsync uses.
pub trait SyncSettings: SettingsStore {
    fn continuous_sync_enabled(&self) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn device_id(&self) -> impl std::future::Future<Output = Result<Option<DeviceId>>> + Send;
}

impl<S: SettingsStore + ?Sized> SyncSettings for S {
    async fn continuous_sync_enabled(&self) -> Result<bool> {
        match self.retrieve_setting(CONTINUOUS_SYNC_ENABLED).await? {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(enabled)) => Ok(enabled),
            Some(other) => Err(DriftError::InvalidSetting {
                key: CONTINUOUS_SYNC_ENABLED.into(),
                reason: format!("expected a boolean, found {}", other),
            }),
        }
    }

    async fn device_id(&self) -> Result<Option<DeviceId>> {
        match self.retrieve_setting(DEVICE_ID).await? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(id)) => Ok(Some(DeviceId::new(id))),
            Some(other) => Err(DriftError::InvalidSetting {
                key: DEVICE_ID.into(),
                reason: format!("expected a string, found {}", other),
            }),
        }
    }
}

/// In-memory settings.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn retrieve_setting(&self, key: &str) -> Result<Option<Value>> {
        let values = self
            .values
            .read()
            .map_err(|e| DriftError::Poisoned(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    async fn store_setting(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .map_err(|e| DriftError::Poisoned(e.to_string()))?
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_typed_settings() {
        let settings = MemorySettingsStore::new();
        assert!(!settings.continuous_sync_enabled().await.unwrap());
        assert_eq!(settings.device_id().await.unwrap(), None);

        settings
            .store_setting(CONTINUOUS_SYNC_ENABLED, json!(true))
            .await
            .unwrap();
        settings.store_setting(DEVICE_ID, json!("abc")).await.unwrap();

        assert!(settings.continuous_sync_enabled().await.unwrap());
        assert_eq!(settings.device_id().await.unwrap(), Some(DeviceId::new("abc")));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_reported() {
        let settings = MemorySettingsStore::new();
        settings.store_setting(DEVICE_ID, json!(42)).await.unwrap();
        assert!(matches!(
            settings.device_id().await,
            Err(DriftError::InvalidSetting { .. })
        ));
    }
}
