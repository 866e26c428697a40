//! Reconciliation: fold one object's log history into final writes.
//!
//! Entries are folded in `created_on` order into an [`ObjectState`]
//! accumulator. Entries that no longer need integration count as already
//! applied to local storage: their fields carry a `synced_on` stamp and they
//! decide whether the object currently exists locally.
//!
//! ## Output
//!
//! | final state                         | operations                       |
//! |-------------------------------------|----------------------------------|
//! | created, not deleted                | `CreateObject` with folded fields |
//! | deleted, exists locally             | one `DeleteObjects`              |
//! | created and deleted (never applied) | nothing                          |
//! | pure field edits                    | `UpdateObjects` per unsynced field |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::entry::{LogChange, LogEntry};
use crate::error::ReconcileError;
use crate::operation::{ExecutableOperation, Object};
use crate::schema::SchemaRegistry;
use crate::types::{ObjectKey, Timestamp};

/// What to do when a live object is created a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoubleCreatePolicy {
    /// Fail reconciliation of the object (presumed primary-key collision).
    #[default]
    Error,
    /// Layer the second creation's fields on top of the first as edits.
    Merge,
}

/// Latest known value of one field.
#[derive(Debug, Clone, PartialEq)]
struct FieldState {
    value: Value,
    created_on: Timestamp,
    /// Set when the write producing this value was already applied locally.
    synced_on: Option<Timestamp>,
}

/// Accumulator for one object.
#[derive(Debug, Default)]
struct ObjectState {
    /// Timestamp of the current incarnation's creation.
    created_on: Option<Timestamp>,
    should_be_created: bool,
    should_be_deleted: bool,
    /// Whether the object exists in local storage given only applied entries.
    exists_locally: bool,
    fields: BTreeMap<String, FieldState>,
}

impl ObjectState {
    fn for_first_entry(entry: &LogEntry) -> Self {
        // Histories that do not start with a creation describe an object that
        // already existed locally (for example one copied in by fast sync).
        let exists_locally = match entry.change {
            LogChange::Create { .. } => !entry.needs_integration,
            _ => true,
        };
        Self {
            exists_locally,
            ..Self::default()
        }
    }

    fn is_live_creation(&self) -> bool {
        self.created_on.is_some() && !self.should_be_deleted
    }

    fn upsert_field(&mut self, field: String, value: Value, created_on: Timestamp, synced_on: Option<Timestamp>) {
        match self.fields.get(&field) {
            Some(existing) if existing.created_on >= created_on => {}
            _ => {
                self.fields.insert(
                    field,
                    FieldState {
                        value,
                        created_on,
                        synced_on,
                    },
                );
            }
        }
    }
}

fn synced_on(entry: &LogEntry) -> Option<Timestamp> {
    if entry.needs_integration {
        None
    } else {
        Some(entry.shared_on.unwrap_or(entry.created_on))
    }
}

/// Folds log histories into [`ExecutableOperation`]s.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    registry: &'a SchemaRegistry,
    policy: DoubleCreatePolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            policy: DoubleCreatePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DoubleCreatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reconcile the complete history of a single object.
    ///
    /// Input order does not matter beyond `created_on`: entries are sorted
    /// (stably) before folding.
    pub fn reconcile_object(
        &self,
        entries: &[LogEntry],
    ) -> Result<Vec<ExecutableOperation>, ReconcileError> {
        let Some(first) = entries.first() else {
            return Ok(Vec::new());
        };
        let object = first.object_key();
        if let Some(other) = entries.iter().find(|e| !e.is_for(&object.collection, &object.pk)) {
            return Err(ReconcileError::MixedObjects {
                expected: object,
                found: other.object_key(),
            });
        }

        let mut ordered: Vec<&LogEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| e.created_on);

        let mut state = ObjectState::for_first_entry(ordered[0]);
        for entry in ordered {
            self.fold(&mut state, entry, &object)?;
        }

        self.into_operations(state, &object)
    }

    /// Reconcile entries for any number of objects.
    ///
    /// Objects are processed in order of first appearance.
    pub fn reconcile_log(
        &self,
        entries: &[LogEntry],
    ) -> Result<Vec<ExecutableOperation>, ReconcileError> {
        let mut groups: Vec<(ObjectKey, Vec<LogEntry>)> = Vec::new();
        for entry in entries {
            match groups
                .iter_mut()
                .find(|(key, _)| entry.is_for(&key.collection, &key.pk))
            {
                Some((_, group)) => group.push(entry.clone()),
                None => groups.push((entry.object_key(), vec![entry.clone()])),
            }
        }

        let mut operations = Vec::new();
        for (_, group) in groups {
            operations.extend(self.reconcile_object(&group)?);
        }
        Ok(operations)
    }

    fn fold(
        &self,
        state: &mut ObjectState,
        entry: &LogEntry,
        object: &ObjectKey,
    ) -> Result<(), ReconcileError> {
        let synced = synced_on(entry);

        match &entry.change {
            LogChange::Create { value } => {
                if state.is_live_creation() {
                    let first = state.created_on.unwrap_or(entry.created_on);
                    match self.policy {
                        DoubleCreatePolicy::Error => {
                            return Err(ReconcileError::DoubleCreate {
                                object: object.clone(),
                                first,
                                second: entry.created_on,
                            });
                        }
                        DoubleCreatePolicy::Merge => {
                            for (field, value) in value {
                                state.upsert_field(field.clone(), value.clone(), entry.created_on, synced);
                            }
                            return Ok(());
                        }
                    }
                }

                // Only a creation still pending integration can be preceded
                // by edits it would lose.
                if !state.should_be_deleted && entry.needs_integration {
                    if let Some((field, edit)) = state.fields.iter().next() {
                        return Err(ReconcileError::ModificationBeforeCreation {
                            object: object.clone(),
                            field: field.clone(),
                            modified_on: edit.created_on,
                            created_on: entry.created_on,
                        });
                    }
                }

                // Fresh creation or recreation after a delete.
                state.created_on = Some(entry.created_on);
                state.should_be_deleted = false;
                state.should_be_created = entry.needs_integration;
                state.fields = value
                    .iter()
                    .map(|(field, value)| {
                        (
                            field.clone(),
                            FieldState {
                                value: value.clone(),
                                created_on: entry.created_on,
                                synced_on: synced,
                            },
                        )
                    })
                    .collect();
                if !entry.needs_integration {
                    state.exists_locally = true;
                }
            }
            LogChange::Modify { field, value } => {
                if state.should_be_deleted {
                    // Edits to a deleted object are superseded by the deletion.
                    return Ok(());
                }
                if let Some(created_on) = state.created_on {
                    if state.should_be_created && entry.created_on < created_on {
                        return Err(ReconcileError::ModificationBeforeCreation {
                            object: object.clone(),
                            field: field.clone(),
                            modified_on: entry.created_on,
                            created_on,
                        });
                    }
                }
                state.upsert_field(field.clone(), value.clone(), entry.created_on, synced);
            }
            LogChange::Delete => {
                state.should_be_deleted = true;
                state.should_be_created = false;
                state.fields.clear();
                if !entry.needs_integration {
                    state.exists_locally = false;
                }
            }
        }
        Ok(())
    }

    fn into_operations(
        &self,
        state: ObjectState,
        object: &ObjectKey,
    ) -> Result<Vec<ExecutableOperation>, ReconcileError> {
        let schema = self.registry.get(&object.collection)?;
        let filter = schema.pk_filter(&object.pk)?;
        let collection = object.collection.clone();

        if state.should_be_deleted {
            if !state.exists_locally {
                return Ok(Vec::new());
            }
            return Ok(vec![ExecutableOperation::DeleteObjects { collection, filter }]);
        }

        if state.should_be_created {
            let fields: Object = state
                .fields
                .into_iter()
                .map(|(field, s)| (field, s.value))
                .collect();
            let created = ExecutableOperation::CreateObject {
                collection: collection.clone(),
                object: schema.with_pk(&object.pk, fields)?,
            };

            // A pending delete-then-recreate of an object that is still
            // present locally replaces it.
            if state.exists_locally {
                return Ok(vec![
                    ExecutableOperation::DeleteObjects { collection, filter },
                    created,
                ]);
            }
            return Ok(vec![created]);
        }

        Ok(state
            .fields
            .into_iter()
            .filter(|(_, s)| s.synced_on.is_none())
            .map(|(field, s)| {
                let mut updates = Object::new();
                updates.insert(field, s.value);
                ExecutableOperation::UpdateObjects {
                    collection: collection.clone(),
                    filter: filter.clone(),
                    updates,
                }
            })
            .collect())
    }
}

/// Convenience wrapper for [`Reconciler::reconcile_object`].
pub fn reconcile_object(
    entries: &[LogEntry],
    registry: &SchemaRegistry,
    policy: DoubleCreatePolicy,
) -> Result<Vec<ExecutableOperation>, ReconcileError> {
    Reconciler::new(registry)
        .with_policy(policy)
        .reconcile_object(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, PrimaryKey};
    use crate::types::DeviceId;
    use proptest::prelude::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(CollectionSchema::new("notes", "id"))
            .with(CollectionSchema::compound("tags", &["name", "url"]))
    }

    fn object(value: Value) -> Object {
        value.as_object().cloned().unwrap()
    }

    fn entry(created_on: Timestamp, change: LogChange, needs_integration: bool) -> LogEntry {
        let mut entry = LogEntry::new(
            "notes",
            PrimaryKey::Single(json!(1)),
            change,
            DeviceId::new("remote"),
            created_on,
        );
        entry.needs_integration = needs_integration;
        if !needs_integration {
            entry.shared_on = Some(created_on);
        }
        entry
    }

    fn create(t: Timestamp, value: Value, pending: bool) -> LogEntry {
        entry(t, LogChange::Create { value: object(value) }, pending)
    }

    fn modify(t: Timestamp, field: &str, value: Value, pending: bool) -> LogEntry {
        entry(
            t,
            LogChange::Modify {
                field: field.into(),
                value,
            },
            pending,
        )
    }

    fn delete(t: Timestamp, pending: bool) -> LogEntry {
        entry(t, LogChange::Delete, pending)
    }

    fn run(entries: &[LogEntry]) -> Result<Vec<ExecutableOperation>, ReconcileError> {
        let registry = registry();
        Reconciler::new(&registry).reconcile_object(entries)
    }

    #[test]
    fn test_pending_modify_after_applied_create_is_update() {
        let ops = run(&[
            create(1, json!({"title": "first"}), false),
            modify(2, "title", json!("second"), true),
        ])
        .unwrap();

        assert_eq!(
            ops,
            vec![ExecutableOperation::UpdateObjects {
                collection: "notes".into(),
                filter: object(json!({"id": 1})),
                updates: object(json!({"title": "second"})),
            }]
        );
    }

    #[test]
    fn test_pending_create_and_modify_fold_into_create() {
        let ops = run(&[
            create(1, json!({"title": "first"}), true),
            modify(2, "title", json!("second"), true),
        ])
        .unwrap();

        assert_eq!(
            ops,
            vec![ExecutableOperation::CreateObject {
                collection: "notes".into(),
                object: object(json!({"id": 1, "title": "second"})),
            }]
        );
    }

    #[test]
    fn test_create_then_delete_cancels_out() {
        let ops = run(&[create(1, json!({"title": "x"}), true), delete(2, true)]).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_repeated_deletes_collapse() {
        let ops = run(&[delete(3, true), delete(4, true), delete(5, true)]).unwrap();
        assert_eq!(
            ops,
            vec![ExecutableOperation::DeleteObjects {
                collection: "notes".into(),
                filter: object(json!({"id": 1})),
            }]
        );
    }

    #[test]
    fn test_applied_create_pending_delete_deletes() {
        let ops = run(&[create(1, json!({"title": "x"}), false), delete(2, true)]).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], ExecutableOperation::DeleteObjects { .. }));
    }

    #[test]
    fn test_already_applied_delete_produces_nothing() {
        let ops = run(&[create(1, json!({"title": "x"}), false), delete(2, false)]).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_last_writer_wins_per_field() {
        let ops = run(&[
            modify(5, "title", json!("newest"), true),
            modify(3, "title", json!("older"), true),
            modify(4, "body", json!("text"), true),
        ])
        .unwrap();

        let updates: Vec<_> = ops
            .iter()
            .map(|op| match op {
                ExecutableOperation::UpdateObjects { updates, .. } => Value::Object(updates.clone()),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(updates, vec![json!({"body": "text"}), json!({"title": "newest"})]);
    }

    #[test]
    fn test_synced_fields_are_skipped() {
        let ops = run(&[
            modify(1, "title", json!("a"), false),
            modify(2, "body", json!("b"), true),
        ])
        .unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_double_create_errors_by_default() {
        let result = run(&[
            create(1, json!({"title": "a"}), true),
            create(2, json!({"title": "b"}), true),
        ]);
        assert!(matches!(
            result,
            Err(ReconcileError::DoubleCreate { first: 1, second: 2, .. })
        ));
    }

    #[test]
    fn test_double_create_merge_policy() {
        let registry = registry();
        let ops = Reconciler::new(&registry)
            .with_policy(DoubleCreatePolicy::Merge)
            .reconcile_object(&[
                create(1, json!({"title": "a", "body": "x"}), true),
                create(2, json!({"title": "b"}), true),
            ])
            .unwrap();

        assert_eq!(
            ops,
            vec![ExecutableOperation::CreateObject {
                collection: "notes".into(),
                object: object(json!({"id": 1, "title": "b", "body": "x"})),
            }]
        );
    }

    #[test]
    fn test_recreate_after_delete() {
        let ops = run(&[
            create(1, json!({"title": "a"}), true),
            delete(2, true),
            create(3, json!({"title": "again"}), true),
        ])
        .unwrap();
        assert_eq!(
            ops,
            vec![ExecutableOperation::CreateObject {
                collection: "notes".into(),
                object: object(json!({"id": 1, "title": "again"})),
            }]
        );
    }

    #[test]
    fn test_recreate_of_locally_present_object_replaces_it() {
        let ops = run(&[
            create(1, json!({"title": "a"}), false),
            delete(2, true),
            create(3, json!({"title": "again"}), true),
        ])
        .unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], ExecutableOperation::DeleteObjects { .. }));
        assert!(matches!(ops[1], ExecutableOperation::CreateObject { .. }));
    }

    #[test]
    fn test_modification_before_creation_is_fatal() {
        let result = run(&[
            modify(1, "title", json!("early"), true),
            create(2, json!({"title": "a"}), true),
        ]);
        assert!(matches!(
            result,
            Err(ReconcileError::ModificationBeforeCreation {
                modified_on: 1,
                created_on: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_applied_creation_after_applied_edit_is_not_a_conflict() {
        let ops = run(&[
            modify(1, "title", json!("early"), false),
            create(2, json!({"title": "a"}), false),
            modify(3, "title", json!("late"), true),
        ])
        .unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            ExecutableOperation::UpdateObjects { updates, .. } => {
                assert_eq!(updates.get("title"), Some(&json!("late")));
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_compound_key_filter() {
        let registry = registry();
        let mut e = create(1, json!({"color": "red"}), true);
        e.collection = "tags".into();
        e.pk = PrimaryKey::Compound(vec![json!("work"), json!("a.com")]);
        let mut d = delete(2, true);
        d.collection = "tags".into();
        d.pk = e.pk.clone();

        let mut c = create(3, json!({"color": "blue"}), true);
        c.collection = "tags".into();
        c.pk = e.pk.clone();

        let ops = Reconciler::new(&registry).reconcile_object(&[e, d, c]).unwrap();
        assert_eq!(
            ops,
            vec![ExecutableOperation::CreateObject {
                collection: "tags".into(),
                object: object(json!({"name": "work", "url": "a.com", "color": "blue"})),
            }]
        );
    }

    #[test]
    fn test_mixed_objects_rejected() {
        let mut other = modify(2, "title", json!("x"), true);
        other.pk = PrimaryKey::Single(json!(2));
        let result = run(&[modify(1, "title", json!("y"), true), other]);
        assert!(matches!(result, Err(ReconcileError::MixedObjects { .. })));
    }

    #[test]
    fn test_reconcile_log_groups_by_object() {
        let registry = registry();
        let mut second = create(2, json!({"title": "b"}), true);
        second.pk = PrimaryKey::Single(json!(2));

        let ops = Reconciler::new(&registry)
            .reconcile_log(&[create(1, json!({"title": "a"}), true), second, delete(3, true)])
            .unwrap();

        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            ExecutableOperation::CreateObject { object, .. } if object["id"] == json!(2)
        ));
    }

    fn history() -> impl Strategy<Value = Vec<LogEntry>> {
        let step = prop_oneof![
            (0..3u8).prop_map(|v| LogChange::Modify {
                field: "title".into(),
                value: json!(v),
            }),
            (0..3u8).prop_map(|v| LogChange::Modify {
                field: "body".into(),
                value: json!(v),
            }),
            Just(LogChange::Delete),
        ];
        (
            prop::collection::vec((step, any::<bool>()), 0..8),
            any::<bool>(),
        )
            .prop_map(|(steps, starts_with_create)| {
                let mut entries = Vec::new();
                let mut t = 1;
                if starts_with_create {
                    entries.push(create(t, json!({"title": "init"}), true));
                    t += 1;
                }
                for (change, pending) in steps {
                    entries.push(entry(t, change, pending));
                    t += 1;
                }
                entries
            })
    }

    proptest! {
        #[test]
        fn test_order_insensitive(entries in history(), seed in any::<u64>()) {
            let registry = registry();
            let reconciler = Reconciler::new(&registry);
            let expected = reconciler.reconcile_object(&entries).ok();

            let mut shuffled = entries.clone();
            // Deterministic Fisher-Yates driven by the seed.
            let mut state = seed | 1;
            for i in (1..shuffled.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            prop_assert_eq!(reconciler.reconcile_object(&shuffled).ok(), expected);
        }
    }
}
