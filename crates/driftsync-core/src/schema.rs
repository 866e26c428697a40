//! Schema registry: which collections exist and how their objects are keyed.
//!
//! Every collection declares either a single primary-key field or an ordered
//! list of fields (compound key). The registry converts between stored
//! objects, [`PrimaryKey`] values and pk-equality filters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::operation::{Filter, Object};

/// Primary key of an object.
///
/// Compound keys keep the declared field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Compound(Vec<Value>),
    Single(Value),
}

impl PrimaryKey {
    /// Canonical JSON text of the key.
    pub fn canonical(&self) -> String {
        match self {
            PrimaryKey::Single(value) => value.to_string(),
            PrimaryKey::Compound(values) => Value::Array(values.clone()).to_string(),
        }
    }
}

impl From<Value> for PrimaryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(values) => PrimaryKey::Compound(values),
            other => PrimaryKey::Single(other),
        }
    }
}

/// Declared key field(s) of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyFields {
    Single(String),
    Compound(Vec<String>),
}

impl KeyFields {
    /// Field names in declared order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            KeyFields::Single(name) => vec![name.as_str()],
            KeyFields::Compound(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Whether `field` is part of the key.
    pub fn contains(&self, field: &str) -> bool {
        self.names().contains(&field)
    }
}

/// Description of a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub primary_key: KeyFields,
}

impl CollectionSchema {
    /// Collection keyed by one field.
    pub fn new(name: impl Into<String>, pk_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: KeyFields::Single(pk_field.into()),
        }
    }

    /// Collection keyed by an ordered list of fields.
    pub fn compound(name: impl Into<String>, pk_fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: KeyFields::Compound(pk_fields.iter().map(|f| f.to_string()).collect()),
        }
    }

    /// Extract the primary key of a stored object.
    pub fn pk_of(&self, object: &Object) -> Result<PrimaryKey> {
        let lookup = |field: &str| {
            object
                .get(field)
                .cloned()
                .ok_or_else(|| CoreError::MissingKeyField {
                    collection: self.name.clone(),
                    field: field.to_string(),
                })
        };

        match &self.primary_key {
            KeyFields::Single(field) => Ok(PrimaryKey::Single(lookup(field)?)),
            KeyFields::Compound(fields) => Ok(PrimaryKey::Compound(
                fields
                    .iter()
                    .map(|f| lookup(f))
                    .collect::<Result<Vec<_>>>()?,
            )),
        }
    }

    /// Check that a key has the arity the collection declares.
    pub fn validate_pk(&self, pk: &PrimaryKey) -> Result<()> {
        match (&self.primary_key, pk) {
            (KeyFields::Single(_), PrimaryKey::Single(_)) => Ok(()),
            (KeyFields::Compound(fields), PrimaryKey::Compound(values))
                if fields.len() == values.len() =>
            {
                Ok(())
            }
            _ => Err(CoreError::InvalidPrimaryKey {
                collection: self.name.clone(),
                pk: pk.canonical(),
            }),
        }
    }

    /// Express a key as an equality filter over the declared key fields.
    pub fn pk_filter(&self, pk: &PrimaryKey) -> Result<Filter> {
        self.validate_pk(pk)?;

        let mut filter = Filter::new();
        match (&self.primary_key, pk) {
            (KeyFields::Single(field), PrimaryKey::Single(value)) => {
                filter.insert(field.clone(), value.clone());
            }
            (KeyFields::Compound(fields), PrimaryKey::Compound(values)) => {
                for (field, value) in fields.iter().zip(values) {
                    filter.insert(field.clone(), value.clone());
                }
            }
            // Arity was checked by validate_pk.
            _ => {}
        }
        Ok(filter)
    }

    /// If the filter selects exactly one object by its key, return that key.
    pub fn pk_from_filter(&self, filter: &Filter) -> Option<PrimaryKey> {
        let names = self.primary_key.names();
        if filter.len() != names.len() {
            return None;
        }

        let values = names
            .iter()
            .map(|name| filter.get(*name).cloned())
            .collect::<Option<Vec<_>>>()?;

        match &self.primary_key {
            KeyFields::Single(_) => values.into_iter().next().map(PrimaryKey::Single),
            KeyFields::Compound(_) => Some(PrimaryKey::Compound(values)),
        }
    }

    /// Copy of the object with the key fields removed.
    pub fn without_pk(&self, object: &Object) -> Object {
        object
            .iter()
            .filter(|(field, _)| !self.primary_key.contains(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }

    /// Rebuild a full object from its key and its remaining fields.
    pub fn with_pk(&self, pk: &PrimaryKey, fields: Object) -> Result<Object> {
        let mut object = self.pk_filter(pk)?;
        object.extend(fields);
        Ok(object)
    }
}

/// Registry of all collections known to a storage backend.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    collections: BTreeMap<String, CollectionSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a collection.
    pub fn register(&mut self, schema: CollectionSchema) {
        self.collections.insert(schema.name.clone(), schema);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, schema: CollectionSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, collection: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(collection)
            .ok_or_else(|| CoreError::UnknownCollection(collection.to_string()))
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    /// Collection names in sorted order.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }
}
