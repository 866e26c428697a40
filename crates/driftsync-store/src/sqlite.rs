//! SQLite implementations of the storage traits.
//!
//! rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`. Objects are stored as JSON text keyed by
//! `(collection, canonical pk)`; log entries keep their change as CBOR.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use driftsync_core::{
    matches_filter, DeviceId, ExecutableOperation, Filter, LogEntry, LogEntryId, Object,
    ObjectKey, PrimaryKey, SchemaRegistry, SortOrder, Timestamp, UserId,
};

use crate::codec::{decode_change, encode_change, generate_device_id, now_millis};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    check_updates, BatchOperation, ClientSyncLog, Device, SharedEntryUpload, SharedLogEntry,
    SharedSyncLog, Storage,
};

type SharedConn = Arc<Mutex<Connection>>;

fn open_conn(path: Option<&Path>) -> Result<SharedConn> {
    let mut conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    migration::migrate(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn lock(conn: &SharedConn) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| StoreError::Poisoned(format!("connection mutex: {}", e)))
}

/// Run `f` against the connection on the blocking pool.
async fn blocking<F, T>(conn: &SharedConn, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = lock(&conn)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {}", e)))?
}

// ─────────────────────────────────────────────────────────────────────────────
// Object store
// ─────────────────────────────────────────────────────────────────────────────

fn load_objects(conn: &Connection, collection: &str) -> Result<Vec<(String, Object)>> {
    let rows = conn
        .prepare("SELECT pk, data FROM objects WHERE collection = ?1 ORDER BY pk")?
        .query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(pk, data)| match serde_json::from_str::<Value>(&data)? {
            Value::Object(object) => Ok((pk, object)),
            other => Err(StoreError::InvalidData(format!(
                "object {} in {} is not a map: {}",
                pk, collection, other
            ))),
        })
        .collect()
}

fn create_in(conn: &Connection, registry: &SchemaRegistry, collection: &str, object: &Object) -> Result<()> {
    let pk = registry.get(collection)?.pk_of(object)?.canonical();

    let existing: Option<String> = conn
        .query_row(
            "SELECT pk FROM objects WHERE collection = ?1 AND pk = ?2",
            params![collection, pk],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(StoreError::Conflict {
            collection: collection.to_string(),
            pk,
        });
    }

    conn.execute(
        "INSERT INTO objects (collection, pk, data) VALUES (?1, ?2, ?3)",
        params![collection, pk, serde_json::to_string(object)?],
    )?;
    Ok(())
}

fn update_in(
    conn: &Connection,
    registry: &SchemaRegistry,
    collection: &str,
    filter: &Filter,
    updates: &Object,
) -> Result<usize> {
    check_updates(registry, collection, updates)?;

    let mut touched = 0;
    for (pk, mut object) in load_objects(conn, collection)? {
        if !matches_filter(&object, filter) {
            continue;
        }
        for (field, value) in updates {
            object.insert(field.clone(), value.clone());
        }
        conn.execute(
            "UPDATE objects SET data = ?3 WHERE collection = ?1 AND pk = ?2",
            params![collection, pk, serde_json::to_string(&object)?],
        )?;
        touched += 1;
    }
    Ok(touched)
}

fn delete_in(conn: &Connection, registry: &SchemaRegistry, collection: &str, filter: &Filter) -> Result<usize> {
    registry.get(collection)?;

    let mut deleted = 0;
    for (pk, object) in load_objects(conn, collection)? {
        if matches_filter(&object, filter) {
            conn.execute(
                "DELETE FROM objects WHERE collection = ?1 AND pk = ?2",
                params![collection, pk],
            )?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

fn find_in(
    conn: &Connection,
    registry: &SchemaRegistry,
    collection: &str,
    filter: &Filter,
    order: Option<&SortOrder>,
) -> Result<Vec<Object>> {
    registry.get(collection)?;

    let mut found: Vec<Object> = load_objects(conn, collection)?
        .into_iter()
        .map(|(_, object)| object)
        .filter(|object| matches_filter(object, filter))
        .collect();
    if let Some(order) = order {
        order.sort(&mut found);
    }
    Ok(found)
}

// ─────────────────────────────────────────────────────────────────────────────
// Client log rows
// ─────────────────────────────────────────────────────────────────────────────

const LOG_COLUMNS: &str =
    "device_id, created_on, collection, pk, change, shared_on, needs_integration";

struct LogRow {
    device_id: String,
    created_on: i64,
    collection: String,
    pk: String,
    change: Vec<u8>,
    shared_on: Option<i64>,
    needs_integration: bool,
}

impl LogRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            device_id: row.get(0)?,
            created_on: row.get(1)?,
            collection: row.get(2)?,
            pk: row.get(3)?,
            change: row.get(4)?,
            shared_on: row.get(5)?,
            needs_integration: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        let pk = PrimaryKey::from(serde_json::from_str::<Value>(&self.pk)?);
        Ok(LogEntry {
            collection: self.collection,
            pk,
            change: decode_change(&self.change)?,
            device_id: DeviceId::new(self.device_id),
            created_on: self.created_on,
            shared_on: self.shared_on,
            needs_integration: self.needs_integration,
        })
    }
}

fn query_entries(conn: &Connection, condition: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<LogEntry>> {
    let sql = format!(
        "SELECT {} FROM client_log WHERE {} ORDER BY created_on, device_id",
        LOG_COLUMNS, condition
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, LogRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(LogRow::into_entry).collect()
}

fn insert_entry(conn: &Connection, entry: &LogEntry, or_ignore: bool) -> Result<usize> {
    let sql = format!(
        "INSERT {} INTO client_log ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        if or_ignore { "OR IGNORE" } else { "" },
        LOG_COLUMNS
    );
    Ok(conn.execute(
        &sql,
        params![
            entry.device_id.as_str(),
            entry.created_on,
            entry.collection,
            entry.pk.canonical(),
            encode_change(&entry.change)?,
            entry.shared_on,
            entry.needs_integration,
        ],
    )?)
}

fn mark_integrated_in(conn: &Connection, ids: &[LogEntryId]) -> Result<()> {
    let mut stmt = conn.prepare(
        "UPDATE client_log SET needs_integration = 0 WHERE device_id = ?1 AND created_on = ?2",
    )?;
    for id in ids {
        stmt.execute(params![id.device_id.as_str(), id.created_on])?;
    }
    Ok(())
}

/// SQLite-backed object store plus client sync log.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking to avoid
/// blocking the async runtime.
pub struct SqliteStore {
    conn: SharedConn,
    registry: Arc<SchemaRegistry>,
}

impl SqliteStore {
    /// Open a database at the given path, creating and migrating it if needed.
    pub fn open(path: impl AsRef<Path>, registry: SchemaRegistry) -> Result<Self> {
        Ok(Self {
            conn: open_conn(Some(path.as_ref()))?,
            registry: Arc::new(registry),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory(registry: SchemaRegistry) -> Result<Self> {
        Ok(Self {
            conn: open_conn(None)?,
            registry: Arc::new(registry),
        })
    }

    async fn with_registry<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &SchemaRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        blocking(&self.conn, move |conn| f(conn, &registry)).await
    }
}

#[async_trait]
impl Storage for SqliteStore {
    fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    async fn create_object(&self, collection: &str, object: Object) -> Result<()> {
        let collection = collection.to_string();
        self.with_registry(move |conn, registry| create_in(conn, registry, &collection, &object))
            .await
    }

    async fn update_objects(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &Object,
    ) -> Result<usize> {
        let (collection, filter, updates) = (collection.to_string(), filter.clone(), updates.clone());
        self.with_registry(move |conn, registry| {
            let tx = conn.transaction()?;
            let touched = update_in(&tx, registry, &collection, &filter, &updates)?;
            tx.commit()?;
            Ok(touched)
        })
        .await
    }

    async fn delete_objects(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let (collection, filter) = (collection.to_string(), filter.clone());
        self.with_registry(move |conn, registry| {
            let tx = conn.transaction()?;
            let deleted = delete_in(&tx, registry, &collection, &filter)?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn find_objects(
        &self,
        collection: &str,
        filter: &Filter,
        order: Option<&SortOrder>,
    ) -> Result<Vec<Object>> {
        let (collection, filter, order) = (collection.to_string(), filter.clone(), order.cloned());
        self.with_registry(move |conn, registry| {
            find_in(conn, registry, &collection, &filter, order.as_ref())
        })
        .await
    }

    async fn count_objects(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self.find_objects(collection, filter, None).await?.len())
    }

    async fn execute_batch(&self, batch: Vec<BatchOperation>) -> Result<()> {
        self.with_registry(move |conn, registry| {
            let tx = conn.transaction()?;
            for op in &batch {
                match op {
                    BatchOperation::Execute(ExecutableOperation::CreateObject { collection, object }) => {
                        create_in(&tx, registry, collection, object)?;
                    }
                    BatchOperation::Execute(ExecutableOperation::UpdateObjects {
                        collection,
                        filter,
                        updates,
                    }) => {
                        update_in(&tx, registry, collection, filter, updates)?;
                    }
                    BatchOperation::Execute(ExecutableOperation::DeleteObjects { collection, filter }) => {
                        delete_in(&tx, registry, collection, filter)?;
                    }
                    BatchOperation::AppendLogEntries(entries) => {
                        for entry in entries {
                            insert_entry(&tx, entry, false)?;
                        }
                    }
                    BatchOperation::MarkIntegrated(ids) => mark_integrated_in(&tx, ids)?,
                }
            }
            // Dropping the transaction on an early return rolls it back.
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ClientSyncLog for SqliteStore {
    async fn insert_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let entries = entries.to_vec();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            for entry in &entries {
                insert_entry(&tx, entry, false)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn entries_created_after(&self, since: Timestamp) -> Result<Vec<LogEntry>> {
        blocking(&self.conn, move |conn| {
            query_entries(conn, "created_on >= ?1", &[&since])
        })
        .await
    }

    async fn unshared_entries(&self) -> Result<Vec<LogEntry>> {
        blocking(&self.conn, |conn| query_entries(conn, "shared_on IS NULL", &[])).await
    }

    async fn update_shared_until(&self, until: Timestamp, shared_on: Timestamp) -> Result<()> {
        blocking(&self.conn, move |conn| {
            conn.execute(
                "UPDATE client_log SET shared_on = ?2 WHERE shared_on IS NULL AND created_on <= ?1",
                params![until, shared_on],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_received_entries(&self, entries: &[LogEntry], now: Timestamp) -> Result<usize> {
        let entries = entries.to_vec();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for mut entry in entries {
                entry.shared_on = Some(now);
                entry.needs_integration = true;
                inserted += insert_entry(&tx, &entry, true)?;
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn mark_as_integrated(&self, ids: &[LogEntryId]) -> Result<()> {
        let ids = ids.to_vec();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            mark_integrated_in(&tx, &ids)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn next_object_to_integrate_except(
        &self,
        skip: &[ObjectKey],
    ) -> Result<Option<Vec<LogEntry>>> {
        let skip: Vec<(String, String)> = skip
            .iter()
            .map(|k| (k.collection.clone(), k.pk.canonical()))
            .collect();

        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT collection, pk FROM client_log WHERE needs_integration = 1
                 ORDER BY created_on, device_id",
            )?;
            let mut rows = stmt.query([])?;

            let mut next = None;
            while let Some(row) = rows.next()? {
                let key: (String, String) = (row.get(0)?, row.get(1)?);
                if !skip.contains(&key) {
                    next = Some(key);
                    break;
                }
            }
            drop(rows);

            match next {
                Some((collection, pk)) => Ok(Some(query_entries(
                    conn,
                    "collection = ?1 AND pk = ?2",
                    &[&collection, &pk],
                )?)),
                None => Ok(None),
            }
        })
        .await
    }
}

/// SQLite-backed relay log.
pub struct SqliteSharedLog {
    conn: SharedConn,
}

impl SqliteSharedLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: open_conn(Some(path.as_ref()))?,
        })
    }

    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            conn: open_conn(None)?,
        })
    }
}

fn device_exists(conn: &Connection, user_id: &str, device_id: &str) -> Result<()> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM devices WHERE id = ?1 AND user_id = ?2",
            params![device_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    found
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(format!("device {} of user {}", device_id, user_id)))
}

#[async_trait]
impl SharedSyncLog for SqliteSharedLog {
    async fn create_device_id(&self, user_id: &UserId, shared_until: Timestamp) -> Result<DeviceId> {
        let user_id = user_id.as_str().to_string();
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let id = loop {
                let id = generate_device_id();
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO devices (id, user_id, shared_until) VALUES (?1, ?2, ?3)",
                    params![id.as_str(), user_id, shared_until],
                )?;
                if inserted == 1 {
                    break id;
                }
            };
            // History already on the relay reaches the new device through
            // fast sync, not through the log.
            tx.execute(
                "INSERT OR IGNORE INTO seen_entries (receiver_id, creator_id, created_on)
                 SELECT ?1, device_id, created_on FROM shared_entries WHERE user_id = ?2",
                params![id.as_str(), user_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn device_info(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        let (user, device) = (user_id.clone(), device_id.clone());
        blocking(&self.conn, move |conn| {
            let shared_until: Option<i64> = conn
                .query_row(
                    "SELECT shared_until FROM devices WHERE id = ?1 AND user_id = ?2",
                    params![device.as_str(), user.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(shared_until.map(|shared_until| Device {
                id: device,
                user_id: user,
                shared_until,
            }))
        })
        .await
    }

    async fn write_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entries: &[SharedEntryUpload],
    ) -> Result<Timestamp> {
        let (user, device, entries) = (user_id.clone(), device_id.clone(), entries.to_vec());
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            device_exists(&tx, user.as_str(), device.as_str())?;

            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(shared_on), 0) FROM shared_entries",
                [],
                |row| row.get(0),
            )?;
            let shared_on = now_millis().max(last + 1);

            for upload in &entries {
                tx.execute(
                    "INSERT OR IGNORE INTO shared_entries (user_id, device_id, created_on, shared_on, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        user.as_str(),
                        device.as_str(),
                        upload.created_on,
                        shared_on,
                        upload.data.as_ref()
                    ],
                )?;
            }

            if let Some(until) = entries.iter().map(|e| e.created_on).max() {
                tx.execute(
                    "UPDATE devices SET shared_until = MAX(shared_until, ?2) WHERE id = ?1",
                    params![device.as_str(), until],
                )?;
            }
            tx.commit()?;
            Ok(shared_on)
        })
        .await
    }

    async fn unsynced_entries(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<SharedLogEntry>> {
        let (user, device) = (user_id.clone(), device_id.clone());
        blocking(&self.conn, move |conn| {
            let rows = conn
                .prepare(
                    "SELECT e.device_id, e.created_on, e.shared_on, e.data
                     FROM shared_entries e
                     WHERE e.user_id = ?1 AND e.device_id != ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM seen_entries s
                           WHERE s.receiver_id = ?2
                             AND s.creator_id = e.device_id
                             AND s.created_on = e.created_on)
                     ORDER BY e.created_on, e.device_id",
                )?
                .query_map(params![user.as_str(), device.as_str()], |row| {
                    Ok(SharedLogEntry {
                        user_id: user.clone(),
                        device_id: DeviceId::new(row.get::<_, String>(0)?),
                        created_on: row.get(1)?,
                        shared_on: row.get(2)?,
                        data: Bytes::from(row.get::<_, Vec<u8>>(3)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn mark_as_seen(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        entry_ids: &[LogEntryId],
    ) -> Result<()> {
        let (user, device, ids) = (user_id.clone(), device_id.clone(), entry_ids.to_vec());
        blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            device_exists(&tx, user.as_str(), device.as_str())?;
            for id in &ids {
                tx.execute(
                    "INSERT OR IGNORE INTO seen_entries (receiver_id, creator_id, created_on)
                     VALUES (?1, ?2, ?3)",
                    params![device.as_str(), id.device_id.as_str(), id.created_on],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
