//! Proptest generators for property-based testing.

use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{json, Value};

use driftsync_core::{DeviceId, LogChange, LogEntry, Object, PrimaryKey};

/// Field names used by generated objects. `id` is never among them.
pub const FIELDS: &[&str] = &["title", "body", "pinned", "rank"];

/// Generate a JSON scalar.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000i64..1_000).prop_map(|n| json!(n)),
        "[a-z ]{0,12}".prop_map(Value::String),
    ]
}

/// Generate a field name.
pub fn field() -> impl Strategy<Value = String> {
    prop::sample::select(FIELDS).prop_map(String::from)
}

/// Generate an object body (no primary key).
pub fn body() -> impl Strategy<Value = Object> {
    prop::collection::btree_map(field(), scalar(), 0..=FIELDS.len())
        .prop_map(|fields| fields.into_iter().collect())
}

/// Generate a device id from a small pool so histories interleave devices.
pub fn device_id() -> impl Strategy<Value = DeviceId> {
    (0u8..3).prop_map(|n| DeviceId::new(format!("device-{n}")))
}

/// Generate a log change.
pub fn change() -> impl Strategy<Value = LogChange> {
    prop_oneof![
        1 => body().prop_map(|value| LogChange::Create { value }),
        4 => (field(), scalar()).prop_map(|(field, value)| LogChange::Modify { field, value }),
        1 => Just(LogChange::Delete),
    ]
}

/// Generate the history of one object: up to `max_len` entries with
/// distinct, increasing timestamps. The first entry is always a create.
pub fn object_history(
    collection: &'static str,
    pk: i64,
    max_len: usize,
) -> impl Strategy<Value = Vec<LogEntry>> {
    let rest = prop::collection::vec((change(), device_id(), 1i64..50), 0..max_len.max(1));
    (body(), device_id(), rest).prop_map(move |(first, device, rest)| {
        let pk = PrimaryKey::Single(json!(pk));
        let mut stamp = 1_000;
        let mut entries = vec![LogEntry::new(
            collection,
            pk.clone(),
            LogChange::Create { value: first },
            device,
            stamp,
        )];
        for (change, device, gap) in rest {
            stamp += gap;
            entries.push(LogEntry::new(collection, pk.clone(), change, device, stamp));
        }
        entries
    })
}

/// Shuffle entries with a fixed seed, for order-independence checks.
pub fn shuffled(entries: &[LogEntry], seed: u64) -> Vec<LogEntry> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = entries.to_vec();
    for i in (1..out.len()).rev() {
        let j = rng.gen_range(0..=i);
        out.swap(i, j);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::Reconciler;

    use crate::fixtures::sample_registry;

    proptest! {
        #[test]
        fn histories_start_with_create(history in object_history("notes", 7, 10)) {
            prop_assert!(matches!(history[0].change, LogChange::Create { .. }), "first history entry must be a Create");
            prop_assert!(history.windows(2).all(|w| w[0].created_on < w[1].created_on));
        }

        #[test]
        fn reconcile_ignores_input_order(history in object_history("notes", 7, 10), seed: u64) {
            let registry = sample_registry();
            let reconciler = Reconciler::new(&registry);
            let ordered = reconciler.reconcile_object(&history);
            let mixed = reconciler.reconcile_object(&shuffled(&history, seed));
            prop_assert_eq!(ordered.is_ok(), mixed.is_ok());
            if let (Ok(a), Ok(b)) = (ordered, mixed) {
                prop_assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn shuffle_is_deterministic() {
        let entries: Vec<LogEntry> = (0..8)
            .map(|n| {
                LogEntry::new(
                    "notes",
                    PrimaryKey::Single(json!(n)),
                    LogChange::Delete,
                    DeviceId::new("d"),
                    n,
                )
            })
            .collect();
        assert_eq!(shuffled(&entries, 3), shuffled(&entries, 3));
        assert_eq!(shuffled(&entries, 3).len(), 8);
    }
}
