use rusqlite::{params, OptionalExtension};

use cairn_types::object_id::ObjectId;

use crate::cache::fs_entry::oid_from_blob;
use crate::cache::CacheDb;
use crate::error::{CairnError, Result};
use crate::object::ObjectKind;

/// One row of the object cache. Presence means the object is believed to
/// exist in the repository.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub oid: ObjectId,
    pub kind: ObjectKind,
    pub payload_len: u64,
    pub compressed_len: u64,
    pub uploaded_at: i64,
}

impl CacheDb {
    /// Answer "does the repository already have this object?" without a
    /// network call.
    pub fn obj_exists(&self, oid: &ObjectId) -> Result<bool> {
        let mut stmt = self
            .raw()
            .prepare_cached("SELECT 1 FROM object WHERE obj_id = ?1 LIMIT 1")?;
        let found = stmt
            .query_row([oid.as_bytes().as_slice()], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(found)
    }

    /// Record a successfully uploaded object and its outgoing edges in one
    /// transaction. Idempotent: re-recording an object is a no-op.
    ///
    /// Callers must only invoke this after the upload of the object and of
    /// every child completed, which keeps the local DAG free of dangling
    /// edges.
    pub fn obj_record(
        &self,
        oid: &ObjectId,
        kind: ObjectKind,
        payload_len: u64,
        compressed_len: u64,
        uploaded_at: i64,
        children: &[ObjectId],
    ) -> Result<()> {
        self.immediate_tx(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO object(obj_id, kind, payload_len, compressed_len, uploaded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    oid.as_bytes().as_slice(),
                    kind.as_str(),
                    payload_len as i64,
                    compressed_len as i64,
                    uploaded_at
                ],
            )?;
            let mut edge = tx.prepare_cached(
                "INSERT OR IGNORE INTO object_relation(parent_oid, child_oid) VALUES (?1, ?2)",
            )?;
            for child in children {
                edge.execute(params![
                    oid.as_bytes().as_slice(),
                    child.as_bytes().as_slice()
                ])?;
            }
            Ok(())
        })
    }

    pub fn obj_get(&self, oid: &ObjectId) -> Result<Option<ObjectRow>> {
        let row = self
            .raw()
            .query_row(
                "SELECT obj_id, kind, payload_len, compressed_len, uploaded_at \
                 FROM object WHERE obj_id = ?1",
                [oid.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((blob, kind, payload_len, compressed_len, uploaded_at)) => {
                let oid = oid_from_blob(Some(blob))?.expect("non-null pk");
                Ok(Some(ObjectRow {
                    oid,
                    kind: ObjectKind::parse(&kind)?,
                    payload_len: payload_len as u64,
                    compressed_len: compressed_len as u64,
                    uploaded_at,
                }))
            }
        }
    }

    /// Stream every OID in the object cache through `visit` without
    /// materializing the table. The GC sweep depends on this staying
    /// memory-flat.
    pub fn obj_for_each(&self, mut visit: impl FnMut(ObjectId) -> Result<()>) -> Result<()> {
        let mut stmt = self.raw().prepare("SELECT obj_id FROM object")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            let oid = ObjectId::from_slice(&blob).ok_or_else(|| {
                CairnError::CacheCorruption("object row with malformed id".into())
            })?;
            visit(oid)?;
        }
        Ok(())
    }

    pub fn obj_children(&self, oid: &ObjectId) -> Result<Vec<ObjectId>> {
        let mut stmt = self
            .raw()
            .prepare_cached("SELECT child_oid FROM object_relation WHERE parent_oid = ?1")?;
        let rows = stmt.query_map([oid.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut children = Vec::new();
        for blob in rows {
            let blob = blob?;
            children.push(ObjectId::from_slice(&blob).ok_or_else(|| {
                CairnError::CacheCorruption("relation edge with malformed child id".into())
            })?);
        }
        Ok(children)
    }

    pub fn obj_parents(&self, oid: &ObjectId) -> Result<Vec<ObjectId>> {
        let mut stmt = self
            .raw()
            .prepare_cached("SELECT parent_oid FROM object_relation WHERE child_oid = ?1")?;
        let rows = stmt.query_map([oid.as_bytes().as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut parents = Vec::new();
        for blob in rows {
            let blob = blob?;
            parents.push(ObjectId::from_slice(&blob).ok_or_else(|| {
                CairnError::CacheCorruption("relation edge with malformed parent id".into())
            })?);
        }
        Ok(parents)
    }

    /// Remove the object row and every edge incident to it.
    pub fn obj_delete(&self, oid: &ObjectId) -> Result<()> {
        self.immediate_tx(|tx| {
            // Outgoing edges cascade with the row; incoming edges are
            // removed explicitly.
            tx.execute(
                "DELETE FROM object_relation WHERE child_oid = ?1",
                [oid.as_bytes().as_slice()],
            )?;
            tx.execute(
                "DELETE FROM object WHERE obj_id = ?1",
                [oid.as_bytes().as_slice()],
            )?;
            Ok(())
        })
    }

    pub fn obj_count(&self) -> Result<u64> {
        let n: i64 = self
            .raw()
            .query_row("SELECT COUNT(*) FROM object", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
