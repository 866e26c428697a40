//! Log entries: causally-timestamped facts about local mutations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{CoreError, Result};
use crate::operation::Object;
use crate::schema::{PrimaryKey, SchemaRegistry};
use crate::types::{DeviceId, LogEntryId, ObjectKey, Timestamp};

/// Kind of mutation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Modify => "modify",
            Operation::Delete => "delete",
        })
    }
}

/// The effect of one entry. `field` exists only for modifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum LogChange {
    /// Object created; `value` is the object minus its primary key.
    Create { value: Object },
    /// One field set to a new value.
    Modify { field: String, value: Value },
    Delete,
}

impl LogChange {
    pub fn operation(&self) -> Operation {
        match self {
            LogChange::Create { .. } => Operation::Create,
            LogChange::Modify { .. } => Operation::Modify,
            LogChange::Delete => Operation::Delete,
        }
    }
}

/// One entry of the client sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub collection: String,
    pub pk: PrimaryKey,
    pub change: LogChange,
    pub device_id: DeviceId,
    pub created_on: Timestamp,
    /// When the entry reached the relay (or, for received entries, when it
    /// was pulled). `None` until then.
    pub shared_on: Option<Timestamp>,
    /// Received from the relay and not yet folded into local storage.
    pub needs_integration: bool,
}

impl LogEntry {
    /// A fresh, local, unshared entry.
    pub fn new(
        collection: impl Into<String>,
        pk: PrimaryKey,
        change: LogChange,
        device_id: DeviceId,
        created_on: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            pk,
            change,
            device_id,
            created_on,
            shared_on: None,
            needs_integration: false,
        }
    }

    pub fn operation(&self) -> Operation {
        self.change.operation()
    }

    pub fn id(&self) -> LogEntryId {
        LogEntryId::new(self.device_id.clone(), self.created_on)
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.collection.clone(), self.pk.clone())
    }

    /// Whether this entry belongs to the given object.
    pub fn is_for(&self, collection: &str, pk: &PrimaryKey) -> bool {
        self.collection == collection && &self.pk == pk
    }

    /// Validate the entry against the schema registry.
    ///
    /// The collection must be known, the key must have the declared arity and
    /// the payload must never address a key field.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        let schema = registry.get(&self.collection)?;
        schema.validate_pk(&self.pk)?;

        match &self.change {
            LogChange::Create { value } => {
                if let Some(field) = value.keys().find(|f| schema.primary_key.contains(f)) {
                    return Err(CoreError::KeyFieldInPayload {
                        collection: self.collection.clone(),
                        field: field.clone(),
                    });
                }
            }
            LogChange::Modify { field, .. } => {
                if schema.primary_key.contains(field) {
                    return Err(CoreError::KeyFieldInPayload {
                        collection: self.collection.clone(),
                        field: field.clone(),
                    });
                }
            }
            LogChange::Delete => {}
        }
        Ok(())
    }
}

/// The wire payload of an entry as stored on the relay.
///
/// Device id and timestamps travel as relay columns, so only the
/// object-level part is serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedEntryPayload {
    pub collection: String,
    pub pk: PrimaryKey,
    pub change: LogChange,
}

impl From<&LogEntry> for SharedEntryPayload {
    fn from(entry: &LogEntry) -> Self {
        Self {
            collection: entry.collection.clone(),
            pk: entry.pk.clone(),
            change: entry.change.clone(),
        }
    }
}

impl SharedEntryPayload {
    /// Rebuild a log entry around this payload.
    pub fn into_entry(self, device_id: DeviceId, created_on: Timestamp) -> LogEntry {
        LogEntry::new(self.collection, self.pk, self.change, device_id, created_on)
    }
}
