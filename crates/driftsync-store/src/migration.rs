//! Database schema migrations for SQLite.
//!
//! Versioned: each migration moves the schema from version N to N+1 and all
//! pending migrations run in one transaction.

use rusqlite::Connection;

use crate::codec::now_millis;
use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated sqlite schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: object store and client sync log.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Application objects, one row per (collection, primary key)
        CREATE TABLE objects (
            collection TEXT NOT NULL,
            pk TEXT NOT NULL,                 -- canonical JSON of the primary key
            data TEXT NOT NULL,               -- full object as JSON
            PRIMARY KEY (collection, pk)
        );

        -- Client sync log
        CREATE TABLE client_log (
            device_id TEXT NOT NULL,
            created_on INTEGER NOT NULL,
            collection TEXT NOT NULL,
            pk TEXT NOT NULL,                 -- canonical JSON of the primary key
            change BLOB NOT NULL,             -- CBOR LogChange
            shared_on INTEGER,                -- NULL until pushed / pulled
            needs_integration INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (device_id, created_on)
        );

        CREATE INDEX idx_client_log_created ON client_log(created_on);
        CREATE INDEX idx_client_log_object ON client_log(collection, pk);
        CREATE INDEX idx_client_log_pending ON client_log(needs_integration, created_on);
        "#,
    )?;

    Ok(())
}

/// Migration v2: relay tables for the shared sync log.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE devices (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            shared_until INTEGER NOT NULL
        );

        CREATE TABLE shared_entries (
            user_id TEXT NOT NULL,
            device_id TEXT NOT NULL,          -- creator
            created_on INTEGER NOT NULL,
            shared_on INTEGER NOT NULL,       -- relay receipt time
            data BLOB NOT NULL,               -- CBOR SharedEntryPayload
            PRIMARY KEY (device_id, created_on)
        );

        -- "receiver has seen the entry created by creator at created_on"
        CREATE TABLE seen_entries (
            receiver_id TEXT NOT NULL,
            creator_id TEXT NOT NULL,
            created_on INTEGER NOT NULL,
            PRIMARY KEY (receiver_id, creator_id, created_on)
        );

        CREATE INDEX idx_shared_entries_user ON shared_entries(user_id, created_on);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "objects",
            "client_log",
            "devices",
            "shared_entries",
            "seen_entries",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
