use rusqlite::{params, OptionalExtension};

use cairn_types::object_id::ObjectId;

use crate::cache::fs_entry::oid_from_blob;
use crate::cache::CacheDb;
use crate::error::{CairnError, Result};

/// One row of the local snapshot registry, mirrored to the repository
/// under `snapshots/<name>`.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub name: String,
    pub root_oid: ObjectId,
    pub root_path: String,
    pub created_at: i64,
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        name: row.get(0)?,
        root_oid: oid_from_blob(Some(row.get(1)?))?.expect("non-null root oid"),
        root_path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl CacheDb {
    pub fn snap_create(
        &self,
        name: &str,
        root_oid: &ObjectId,
        root_path: &str,
        created_at: i64,
    ) -> Result<()> {
        let inserted = self.raw().execute(
            "INSERT OR IGNORE INTO snapshot(name, root_oid, root_path, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![name, root_oid.as_bytes().as_slice(), root_path, created_at],
        )?;
        if inserted == 0 {
            return Err(CairnError::SnapshotAlreadyExists(name.to_string()));
        }
        Ok(())
    }

    pub fn snap_get(&self, name: &str) -> Result<Option<SnapshotRow>> {
        let row = self
            .raw()
            .query_row(
                "SELECT name, root_oid, root_path, created_at FROM snapshot WHERE name = ?1",
                [name],
                row_to_snapshot,
            )
            .optional()?;
        Ok(row)
    }

    pub fn snap_list(&self) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.raw().prepare(
            "SELECT name, root_oid, root_path, created_at FROM snapshot \
             ORDER BY created_at, name",
        )?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove a snapshot row. Returns `false` when no such snapshot exists.
    pub fn snap_remove(&self, name: &str) -> Result<bool> {
        let removed = self
            .raw()
            .execute("DELETE FROM snapshot WHERE name = ?1", [name])?;
        Ok(removed > 0)
    }

    /// Root OIDs of all live snapshots: the reachability roots for GC.
    pub fn snap_roots(&self) -> Result<Vec<ObjectId>> {
        let mut stmt = self.raw().prepare("SELECT root_oid FROM snapshot")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut roots = Vec::new();
        for blob in rows {
            let blob = blob?;
            roots.push(ObjectId::from_slice(&blob).ok_or_else(|| {
                CairnError::CacheCorruption("snapshot row with malformed root oid".into())
            })?);
        }
        Ok(roots)
    }
}
