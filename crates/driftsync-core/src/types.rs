//! Strong type definitions for driftsync.
//!
//! Identifiers are newtypes so a user id can never be passed where a device
//! id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::PrimaryKey;

/// Logical/wall timestamp in Unix milliseconds.
///
/// Values produced by a single device are strictly increasing.
pub type Timestamp = i64;

/// Opaque device identifier, assigned by the relay.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the user owning a set of devices.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a log entry: the creating device plus its creation time.
///
/// Unique because a device never hands out the same timestamp twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryId {
    pub device_id: DeviceId,
    pub created_on: Timestamp,
}

impl LogEntryId {
    pub fn new(device_id: DeviceId, created_on: Timestamp) -> Self {
        Self {
            device_id,
            created_on,
        }
    }
}

/// A logical object: a collection plus the object's primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectKey {
    pub collection: String,
    pub pk: PrimaryKey,
}

impl ObjectKey {
    pub fn new(collection: impl Into<String>, pk: PrimaryKey) -> Self {
        Self {
            collection: collection.into(),
            pk,
        }
    }

    /// Canonical string form, usable as a hash key.
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.collection, self.pk.canonical())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.collection, self.pk.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new("abc123");
        assert_eq!(format!("{}", id), "abc123");
        assert_eq!(format!("{:?}", id), "DeviceId(abc123)");
    }

    #[test]
    fn test_device_id_serializes_transparently() {
        let id = DeviceId::new("dev-1");
        assert_eq!(serde_json::to_value(&id).unwrap(), json!("dev-1"));
    }

    #[test]
    fn test_object_key_canonical_distinguishes_collections() {
        let a = ObjectKey::new("notes", PrimaryKey::Single(json!(1)));
        let b = ObjectKey::new("tags", PrimaryKey::Single(json!(1)));
        assert_ne!(a.canonical(), b.canonical());
    }
}
