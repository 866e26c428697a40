//! Storage operations and object filters.
//!
//! [`ExecutableOperation`] is the closed set of writes the engine ever asks a
//! storage backend to perform. Backends dispatch on it with a `match`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored object: a JSON map of field name to value.
pub type Object = Map<String, Value>;

/// Equality filter. An object matches when every filter entry equals the
/// object's field of the same name. The empty filter matches everything.
pub type Filter = Map<String, Value>;

/// Whether `object` satisfies `filter`.
pub fn matches_filter(object: &Object, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| object.get(field) == Some(expected))
}

/// A final write produced by reconciliation or issued by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum ExecutableOperation {
    CreateObject {
        collection: String,
        object: Object,
    },
    UpdateObjects {
        collection: String,
        filter: Filter,
        updates: Object,
    },
    DeleteObjects {
        collection: String,
        filter: Filter,
    },
}

impl ExecutableOperation {
    /// The collection this operation touches.
    pub fn collection(&self) -> &str {
        match self {
            ExecutableOperation::CreateObject { collection, .. }
            | ExecutableOperation::UpdateObjects { collection, .. }
            | ExecutableOperation::DeleteObjects { collection, .. } => collection,
        }
    }
}

/// Sort direction for [`SortOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordering for `find_objects`: a list of fields compared in turn.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortOrder(pub Vec<(String, Direction)>);

impl SortOrder {
    pub fn ascending(fields: &[&str]) -> Self {
        Self(
            fields
                .iter()
                .map(|f| (f.to_string(), Direction::Asc))
                .collect(),
        )
    }

    /// Sort objects in place.
    pub fn sort(&self, objects: &mut [Object]) {
        objects.sort_by(|a, b| self.compare(a, b));
    }

    fn compare(&self, a: &Object, b: &Object) -> Ordering {
        for (field, direction) in &self.0 {
            let ordering = compare_values(a.get(field), b.get(field));
            let ordering = match direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Total order over optional JSON values: missing < null < bool < number <
/// string < anything else (compared by text).
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => match rank(a).cmp(&rank(b)) {
            Ordering::Equal => a
                .map(Value::to_string)
                .cmp(&b.map(Value::to_string)),
            other => other,
        },
    }
}
