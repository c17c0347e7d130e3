pub mod fs_entry;
pub mod objects;
pub mod snapshots;

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::Result;

/// The local cache store: one SQLite database holding the files cache, the
/// object cache with its relation edges, the snapshot registry, and a small
/// settings table for key material and engine state.
///
/// WAL journaling plus immediate write transactions keep scans and backups
/// crash-consistent; streaming cursors keep memory flat on large tables.
pub struct CacheDb {
    conn: Connection,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS fs_entry (
    id          INTEGER PRIMARY KEY,
    parent_id   INTEGER REFERENCES fs_entry(id) ON DELETE CASCADE,
    name        BLOB NOT NULL,
    obj_id      BLOB,
    st_mode     INTEGER,
    st_mtime_ns INTEGER,
    st_size     INTEGER,
    new_flag    INTEGER NOT NULL DEFAULT 1,
    UNIQUE(parent_id, name)
);
CREATE INDEX IF NOT EXISTS fs_entry_new ON fs_entry(new_flag) WHERE new_flag = 1;
CREATE INDEX IF NOT EXISTS fs_entry_parent ON fs_entry(parent_id);

CREATE TABLE IF NOT EXISTS root (
    backup_set_name TEXT PRIMARY KEY,
    root_entry_id   INTEGER NOT NULL REFERENCES fs_entry(id),
    root_path       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS object (
    obj_id         BLOB PRIMARY KEY,
    kind           TEXT NOT NULL,
    payload_len    INTEGER NOT NULL,
    compressed_len INTEGER NOT NULL,
    uploaded_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS object_relation (
    parent_oid BLOB NOT NULL REFERENCES object(obj_id) ON DELETE CASCADE,
    child_oid  BLOB NOT NULL,
    PRIMARY KEY(parent_oid, child_oid)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS object_relation_child ON object_relation(child_oid);

CREATE TABLE IF NOT EXISTS snapshot (
    name       TEXT PRIMARY KEY,
    root_oid   BLOB NOT NULL,
    root_path  TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

impl CacheDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory cache for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub(crate) fn raw(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction. The write lock is taken
    /// up front so a read-then-write sequence cannot fail its upgrade.
    pub(crate) fn immediate_tx<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put_setting(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings(key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}
