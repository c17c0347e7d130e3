use std::path::PathBuf;

use rusqlite::{params, OptionalExtension};

use cairn_types::object_id::ObjectId;

use crate::cache::CacheDb;
use crate::error::{CairnError, Result};
use crate::platform;

/// One row of the files cache. `obj_id = NULL` means dirty: the next backup
/// must re-derive this entry. Null stat columns mean the entry was inserted
/// by a scan pass but not yet stat'd.
#[derive(Debug, Clone)]
pub struct FsEntryRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub name: Vec<u8>,
    pub obj_id: Option<ObjectId>,
    pub st_mode: Option<u32>,
    pub st_mtime_ns: Option<i64>,
    pub st_size: Option<u64>,
    pub new_flag: bool,
}

impl FsEntryRow {
    pub fn stat_matches(&self, mode: u32, mtime_ns: i64, size: u64) -> bool {
        self.st_mode == Some(mode)
            && self.st_mtime_ns == Some(mtime_ns)
            && self.st_size == Some(size)
    }

    pub fn is_dir(&self) -> bool {
        self.st_mode.map(platform::mode_is_dir).unwrap_or(false)
    }

    pub fn is_file(&self) -> bool {
        self.st_mode.map(platform::mode_is_file).unwrap_or(false)
    }
}

/// A backup-set root: the anchor row of one tracked subtree.
#[derive(Debug, Clone)]
pub struct RootRow {
    pub backup_set: String,
    pub entry_id: i64,
    pub path: PathBuf,
}

pub(crate) fn oid_from_blob(blob: Option<Vec<u8>>) -> rusqlite::Result<Option<ObjectId>> {
    match blob {
        None => Ok(None),
        Some(bytes) => ObjectId::from_slice(&bytes).map(Some).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Blob,
                "object id blob has wrong length".into(),
            )
        }),
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<FsEntryRow> {
    Ok(FsEntryRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        obj_id: oid_from_blob(row.get(3)?)?,
        st_mode: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        st_mtime_ns: row.get(5)?,
        st_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        new_flag: row.get::<_, i64>(7)? != 0,
    })
}

const ENTRY_COLUMNS: &str =
    "id, parent_id, name, obj_id, st_mode, st_mtime_ns, st_size, new_flag";

impl CacheDb {
    /// Register a new backup-set root. The root entry starts with the
    /// `new_flag` set and null stat columns; the first scan bootstraps it.
    pub fn fs_add_root(&self, backup_set: &str, path: &std::path::Path) -> Result<i64> {
        if self.fs_root(backup_set)?.is_some() {
            return Err(CairnError::Config(format!(
                "backup set '{backup_set}' already has a root"
            )));
        }
        let path_bytes = platform::os_to_bytes(path.as_os_str());
        self.immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO fs_entry(parent_id, name, new_flag) VALUES (NULL, ?1, 1)",
                params![path_bytes],
            )?;
            let entry_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO root(backup_set_name, root_entry_id, root_path) \
                 VALUES (?1, ?2, ?3)",
                params![backup_set, entry_id, path.to_string_lossy()],
            )?;
            Ok(entry_id)
        })
    }

    pub fn fs_root(&self, backup_set: &str) -> Result<Option<RootRow>> {
        let row = self
            .raw()
            .query_row(
                "SELECT backup_set_name, root_entry_id, root_path FROM root \
                 WHERE backup_set_name = ?1",
                [backup_set],
                |row| {
                    Ok(RootRow {
                        backup_set: row.get(0)?,
                        entry_id: row.get(1)?,
                        path: PathBuf::from(row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn fs_roots(&self) -> Result<Vec<RootRow>> {
        let mut stmt = self.raw().prepare(
            "SELECT backup_set_name, root_entry_id, root_path FROM root \
             ORDER BY backup_set_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RootRow {
                backup_set: row.get(0)?,
                entry_id: row.get(1)?,
                path: PathBuf::from(row.get::<_, String>(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn fs_get(&self, id: i64) -> Result<Option<FsEntryRow>> {
        let row = self
            .raw()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM fs_entry WHERE id = ?1"),
                [id],
                row_to_entry,
            )
            .optional()?;
        Ok(row)
    }

    /// Reconstruct the absolute path of an entry by walking parent links.
    /// The root entry's name is its absolute path.
    pub fn fs_path(&self, id: i64) -> Result<PathBuf> {
        let mut names: Vec<Vec<u8>> = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let (parent_id, name): (Option<i64>, Vec<u8>) = self
                .raw()
                .query_row(
                    "SELECT parent_id, name FROM fs_entry WHERE id = ?1",
                    [cur],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| {
                    CairnError::CacheCorruption(format!("fs_entry {cur} vanished mid-walk"))
                })?;
            names.push(name);
            cursor = parent_id;
        }
        let mut path = PathBuf::from(platform::bytes_to_os(names.last().expect("nonempty")));
        for name in names.iter().rev().skip(1) {
            path.push(platform::bytes_to_os(name));
        }
        Ok(path)
    }

    pub fn fs_children(&self, parent_id: i64) -> Result<Vec<FsEntryRow>> {
        let mut stmt = self.raw().prepare_cached(&format!(
            "SELECT {ENTRY_COLUMNS} FROM fs_entry WHERE parent_id = ?1"
        ))?;
        let rows = stmt.query_map([parent_id], row_to_entry)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert a child discovered by a directory listing. New entries carry
    /// the `new_flag` and null stat columns; the next pass stats them.
    pub fn fs_insert_child(&self, parent_id: i64, name: &[u8]) -> Result<()> {
        self.raw().execute(
            "INSERT OR IGNORE INTO fs_entry(parent_id, name, new_flag) VALUES (?1, ?2, 1)",
            params![parent_id, name],
        )?;
        Ok(())
    }

    /// Refresh the stat tuple and mark the entry dirty.
    pub fn fs_update_stat(&self, id: i64, mode: u32, mtime_ns: i64, size: u64) -> Result<()> {
        self.raw().execute(
            "UPDATE fs_entry SET st_mode = ?2, st_mtime_ns = ?3, st_size = ?4, \
             obj_id = NULL, new_flag = 0 WHERE id = ?1",
            params![id, mode as i64, mtime_ns, size as i64],
        )?;
        Ok(())
    }

    /// Refresh the stat tuple without touching the cached OID. The walker
    /// re-reads stat right before serializing an inode and stores what it
    /// serialized, so a steady filesystem yields a clean next scan.
    pub fn fs_refresh_stat(&self, id: i64, mode: u32, mtime_ns: i64, size: u64) -> Result<()> {
        self.raw().execute(
            "UPDATE fs_entry SET st_mode = ?2, st_mtime_ns = ?3, st_size = ?4 WHERE id = ?1",
            params![id, mode as i64, mtime_ns, size as i64],
        )?;
        Ok(())
    }

    pub fn fs_clear_new(&self, id: i64) -> Result<()> {
        self.raw()
            .execute("UPDATE fs_entry SET new_flag = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Record the OID of the last successful backup of this entry.
    pub fn fs_set_obj(&self, id: i64, oid: &ObjectId) -> Result<()> {
        self.raw().execute(
            "UPDATE fs_entry SET obj_id = ?2 WHERE id = ?1",
            params![id, oid.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    pub fn fs_clear_obj(&self, id: i64) -> Result<()> {
        self.raw()
            .execute("UPDATE fs_entry SET obj_id = NULL WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Delete an entry and, through cascading foreign keys, its whole
    /// subtree.
    pub fn fs_delete_recursive(&self, id: i64) -> Result<()> {
        self.raw()
            .execute("DELETE FROM fs_entry WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Delete all children of an entry (used when a directory turned into
    /// something else).
    pub fn fs_delete_children(&self, id: i64) -> Result<()> {
        self.raw()
            .execute("DELETE FROM fs_entry WHERE parent_id = ?1", [id])?;
        Ok(())
    }

    /// Null the cached OID of an entry and every ancestor up to the root.
    /// A changed child invalidates its parents' serialized trees.
    pub fn fs_invalidate_ancestors(&self, id: i64) -> Result<()> {
        self.raw().execute(
            "WITH RECURSIVE ancestors(id) AS (
               SELECT id FROM fs_entry WHERE id = ?1
               UNION ALL
               SELECT fs_entry.parent_id FROM fs_entry
               INNER JOIN ancestors ON fs_entry.id = ancestors.id
               WHERE fs_entry.parent_id IS NOT NULL
             ) UPDATE fs_entry SET obj_id = NULL WHERE id IN ancestors",
            [id],
        )?;
        Ok(())
    }

    /// Invalidation sweep over the whole table: every ancestor of every
    /// dirty entry becomes dirty. Fixed point by CTE recursion.
    pub fn fs_sweep_invalidate(&self) -> Result<usize> {
        let changed = self.raw().execute(
            "WITH RECURSIVE dirty_ancestors(id) AS (
               SELECT parent_id FROM fs_entry
               WHERE obj_id IS NULL AND parent_id IS NOT NULL
               UNION
               SELECT fs_entry.parent_id FROM fs_entry
               INNER JOIN dirty_ancestors ON fs_entry.id = dirty_ancestors.id
               WHERE fs_entry.parent_id IS NOT NULL
             ) UPDATE fs_entry SET obj_id = NULL
               WHERE id IN dirty_ancestors AND obj_id IS NOT NULL",
            [],
        )?;
        Ok(changed)
    }

    pub fn fs_has_new(&self) -> Result<bool> {
        let n: i64 = self.raw().query_row(
            "SELECT EXISTS(SELECT 1 FROM fs_entry WHERE new_flag = 1)",
            [],
            |row| row.get(0),
        )?;
        Ok(n != 0)
    }

    pub fn fs_entry_count(&self) -> Result<u64> {
        let n: i64 = self
            .raw()
            .query_row("SELECT COUNT(*) FROM fs_entry", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
