//! Post-order backup walker: turns dirty files-cache entries into uploaded
//! objects.
//!
//! The traversal uses an explicit work stack instead of recursion, so tree
//! depth cannot overflow the call stack and every suspension point sits in
//! one loop. An entry whose cached OID is set short-circuits its whole
//! subtree. Chunk payloads are MAC'd and dedup-checked on the walker
//! thread; compression, sealing, and uploads for distinct new OIDs fan out
//! over a bounded worker pool. An object is recorded in the cache only
//! after its put returned, and a tree or inode is serialized only after
//! all its children's uploads completed, which keeps a crashed backup
//! resumable and the local DAG free of dangling edges.

use std::fs::File;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cairn_types::object_id::ObjectId;

use crate::cache::fs_entry::FsEntryRow;
use crate::cache::CacheDb;
use crate::cancel::CancelToken;
use crate::chunker::FixedChunker;
use crate::compress::Compression;
use crate::config::ChunkerConfig;
use crate::crypto::CryptoProvider;
use crate::error::{is_soft_io_error, is_vanished_io_error, CairnError, Result};
use crate::object::codec;
use crate::object::{ChunkRef, InodeObject, ObjectKind, TreeEntry, TreeObject};
use crate::platform;
use crate::storage::{object_key, StorageBackend};

/// Accumulated over one backup and embedded in the snapshot metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub files: u64,
    pub dirs: u64,
    pub blobs_uploaded: u64,
    pub inodes_uploaded: u64,
    pub trees_uploaded: u64,
    /// Objects skipped because the cache already knew them.
    pub objects_deduped: u64,
    pub bytes_read: u64,
    pub bytes_uploaded: u64,
    /// Entries skipped on soft filesystem errors (reduced coverage).
    pub soft_errors: u64,
}

impl BackupStats {
    pub fn objects_uploaded(&self) -> u64 {
        self.blobs_uploaded + self.inodes_uploaded + self.trees_uploaded
    }
}

pub(crate) struct BackupContext<'a> {
    pub storage: &'a dyn StorageBackend,
    pub crypto: &'a dyn CryptoProvider,
    pub cache: &'a CacheDb,
    pub compression: Compression,
    pub chunker: ChunkerConfig,
    pub pool: Option<rayon::ThreadPool>,
    pub cancel: &'a CancelToken,
}

/// Build the blob upload pool. `max_threads == 1` means sequential.
pub(crate) fn build_upload_pool(max_threads: usize) -> Result<Option<rayon::ThreadPool>> {
    if max_threads <= 1 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build()
        .map(Some)
        .map_err(|e| CairnError::Config(format!("failed to create upload pool: {e}")))
}

enum Visit {
    Enter(i64),
    Exit(i64),
}

/// Walk the subtree rooted at `root_id` in post-order and return the root's
/// OID. On return every visited entry either carries its OID or was
/// skipped as a soft error.
pub(crate) fn backup_tree(
    ctx: &BackupContext<'_>,
    root_id: i64,
    stats: &mut BackupStats,
) -> Result<ObjectId> {
    let root_path = ctx.cache.fs_path(root_id)?;
    let mut stack = vec![Visit::Enter(root_id)];

    while let Some(visit) = stack.pop() {
        ctx.cancel.check()?;
        match visit {
            Visit::Enter(id) => {
                let Some(entry) = ctx.cache.fs_get(id)? else {
                    continue;
                };
                // Cached OID means the whole subtree is already uploaded.
                if entry.obj_id.is_some() {
                    continue;
                }
                if entry.is_dir() {
                    stack.push(Visit::Exit(id));
                    for child in ctx.cache.fs_children(id)? {
                        if child.obj_id.is_none() {
                            stack.push(Visit::Enter(child.id));
                        }
                    }
                } else if entry.is_file() {
                    backup_file(ctx, id, &entry, stats)?;
                } else {
                    warn!(id, "entry has no usable stat data, skipping");
                    stats.soft_errors += 1;
                }
            }
            Visit::Exit(id) => backup_dir(ctx, id, stats)?,
        }
    }

    let root = ctx
        .cache
        .fs_get(root_id)?
        .and_then(|entry| entry.obj_id)
        .ok_or_else(|| CairnError::Fs {
            path: root_path,
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "backup set root could not be backed up",
            ),
        })?;
    Ok(root)
}

/// Upload pressure limits for one blob batch dispatch.
const MAX_BATCH_CHUNKS: usize = 64;
const MAX_BATCH_BYTES: u64 = 64 * 1024 * 1024;

fn backup_file(
    ctx: &BackupContext<'_>,
    id: i64,
    entry: &FsEntryRow,
    stats: &mut BackupStats,
) -> Result<()> {
    let path = ctx.cache.fs_path(id)?;

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if is_vanished_io_error(&e) => {
            info!(path = %path.display(), "file disappeared before backup, dropping entry");
            drop_entry(ctx, id, entry)?;
            stats.soft_errors += 1;
            return Ok(());
        }
        Err(e) if is_soft_io_error(&e) => {
            warn!(path = %path.display(), error = %e, "cannot open file, skipping");
            stats.soft_errors += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let read_stat = platform::summarize_metadata(&file.metadata()?);
    if !read_stat.is_file {
        info!(path = %path.display(), "no longer a regular file, dropping entry");
        drop_entry(ctx, id, entry)?;
        stats.soft_errors += 1;
        return Ok(());
    }

    let mut chunk_refs: Vec<ChunkRef> = Vec::new();
    let mut batch: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut batch_bytes = 0u64;

    for item in FixedChunker::new(file, read_stat.size, &ctx.chunker) {
        ctx.cancel.check()?;
        let (offset, data) = match item {
            Ok(chunk) => chunk,
            Err(e) if is_soft_io_error(&e) => {
                warn!(path = %path.display(), error = %e, "read failed mid-file, skipping");
                stats.soft_errors += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        batch_bytes += data.len() as u64;
        batch.push((offset, data));
        if batch.len() >= MAX_BATCH_CHUNKS || batch_bytes >= MAX_BATCH_BYTES {
            flush_blob_batch(ctx, &mut batch, &mut chunk_refs, stats)?;
            batch_bytes = 0;
        }
    }
    flush_blob_batch(ctx, &mut batch, &mut chunk_refs, stats)?;

    // Scan and backup are decoupled, so re-read the stat immediately
    // before serialization; the inode must not carry metadata staler than
    // its contents.
    let fresh = match std::fs::symlink_metadata(&path) {
        Ok(md) => platform::summarize_metadata(&md),
        Err(e) if is_vanished_io_error(&e) => {
            info!(path = %path.display(), "file disappeared during backup, dropping entry");
            drop_entry(ctx, id, entry)?;
            stats.soft_errors += 1;
            return Ok(());
        }
        Err(e) if is_soft_io_error(&e) => {
            warn!(path = %path.display(), error = %e, "re-stat failed, using read-time stat");
            read_stat
        }
        Err(e) => return Err(e.into()),
    };
    if !fresh.is_file {
        info!(path = %path.display(), "no longer a regular file, dropping entry");
        drop_entry(ctx, id, entry)?;
        stats.soft_errors += 1;
        return Ok(());
    }

    let inode = InodeObject {
        size: fresh.size,
        inode: fresh.inode,
        uid: fresh.uid,
        gid: fresh.gid,
        mode: fresh.mode,
        ctime_ns: fresh.ctime_ns,
        mtime_ns: fresh.mtime_ns,
        chunks: chunk_refs,
    };
    let payload = codec::encode_inode(&inode)?;
    let oid = ctx.crypto.object_id(&payload);

    if ctx.cache.obj_exists(&oid)? {
        stats.objects_deduped += 1;
    } else {
        let packed = codec::pack_payload(&payload, ctx.compression, ctx.crypto)?;
        ctx.storage.put(&object_key(&oid), &packed)?;
        let children: Vec<ObjectId> = inode.chunks.iter().map(|c| c.blob).collect();
        ctx.cache.obj_record(
            &oid,
            ObjectKind::Inode,
            payload.len() as u64,
            packed.len() as u64,
            now_ts(),
            &children,
        )?;
        stats.inodes_uploaded += 1;
        stats.bytes_uploaded += packed.len() as u64;
    }

    ctx.cache
        .fs_refresh_stat(id, fresh.mode, fresh.mtime_ns, fresh.size)?;
    ctx.cache.fs_set_obj(id, &oid)?;
    stats.files += 1;
    debug!(path = %path.display(), oid = %oid, "file backed up");
    Ok(())
}

/// MAC, dedup-check, then compress+seal+upload a batch of chunks. The MAC
/// and the cache lookup stay on the walker thread; only distinct new OIDs
/// hit the pool.
fn flush_blob_batch(
    ctx: &BackupContext<'_>,
    batch: &mut Vec<(u64, Vec<u8>)>,
    chunk_refs: &mut Vec<ChunkRef>,
    stats: &mut BackupStats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let taken = std::mem::take(batch);

    let mut to_upload: Vec<(ObjectId, Vec<u8>)> = Vec::new();
    for (offset, data) in taken {
        stats.bytes_read += data.len() as u64;
        let payload = codec::encode_blob(&data)?;
        let oid = ctx.crypto.object_id(&payload);
        chunk_refs.push(ChunkRef { offset, blob: oid });
        if ctx.cache.obj_exists(&oid)? || to_upload.iter().any(|(pending, _)| *pending == oid) {
            stats.objects_deduped += 1;
        } else {
            to_upload.push((oid, payload));
        }
    }
    if to_upload.is_empty() {
        return Ok(());
    }

    let compression = ctx.compression;
    let crypto = ctx.crypto;
    let storage = ctx.storage;
    let seal_and_put = |entry: &(ObjectId, Vec<u8>)| -> Result<(ObjectId, u64, u64)> {
        let (oid, payload) = entry;
        let packed = codec::pack_payload(payload, compression, crypto)?;
        storage.put(&object_key(oid), &packed)?;
        Ok((*oid, payload.len() as u64, packed.len() as u64))
    };

    let results: Vec<Result<(ObjectId, u64, u64)>> = match &ctx.pool {
        Some(pool) => pool.install(|| to_upload.par_iter().map(seal_and_put).collect()),
        None => to_upload.iter().map(seal_and_put).collect(),
    };

    // Record every put that completed before surfacing a failure, so an
    // aborted backup resumes off the cache instead of re-uploading.
    let now = now_ts();
    let mut first_err = None;
    for result in results {
        match result {
            Ok((oid, payload_len, stored_len)) => {
                ctx.cache
                    .obj_record(&oid, ObjectKind::Blob, payload_len, stored_len, now, &[])?;
                stats.blobs_uploaded += 1;
                stats.bytes_uploaded += stored_len;
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn backup_dir(ctx: &BackupContext<'_>, id: i64, stats: &mut BackupStats) -> Result<()> {
    let Some(entry) = ctx.cache.fs_get(id)? else {
        return Ok(());
    };
    if entry.obj_id.is_some() {
        return Ok(());
    }
    let path = ctx.cache.fs_path(id)?;

    let fresh = match std::fs::symlink_metadata(&path) {
        Ok(md) => platform::summarize_metadata(&md),
        Err(e) if is_vanished_io_error(&e) => {
            info!(path = %path.display(), "directory disappeared during backup, dropping entry");
            drop_entry(ctx, id, &entry)?;
            stats.soft_errors += 1;
            return Ok(());
        }
        Err(e) if is_soft_io_error(&e) => {
            warn!(path = %path.display(), error = %e, "re-stat failed, skipping directory");
            stats.soft_errors += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    if !fresh.is_dir {
        info!(path = %path.display(), "no longer a directory, dropping entry");
        drop_entry(ctx, id, &entry)?;
        stats.soft_errors += 1;
        return Ok(());
    }

    // Children were visited before this frame; anything still without an
    // OID soft-failed and is omitted, completing the backup with reduced
    // coverage.
    let mut entries: Vec<TreeEntry> = Vec::new();
    let mut child_oids: Vec<ObjectId> = Vec::new();
    for child in ctx.cache.fs_children(id)? {
        match child.obj_id {
            Some(oid) => {
                child_oids.push(oid);
                entries.push(TreeEntry {
                    name: child.name,
                    child: oid,
                });
            }
            None => {
                warn!(
                    parent = %path.display(),
                    name = %String::from_utf8_lossy(&child.name),
                    "child was not backed up, omitting from tree"
                );
                stats.soft_errors += 1;
            }
        }
    }

    let tree = TreeObject {
        uid: fresh.uid,
        gid: fresh.gid,
        mode: fresh.mode,
        entries,
    };
    let payload = codec::encode_tree(&tree)?;
    let oid = ctx.crypto.object_id(&payload);

    if ctx.cache.obj_exists(&oid)? {
        stats.objects_deduped += 1;
    } else {
        let packed = codec::pack_payload(&payload, ctx.compression, ctx.crypto)?;
        ctx.storage.put(&object_key(&oid), &packed)?;
        ctx.cache.obj_record(
            &oid,
            ObjectKind::Tree,
            payload.len() as u64,
            packed.len() as u64,
            now_ts(),
            &child_oids,
        )?;
        stats.trees_uploaded += 1;
        stats.bytes_uploaded += packed.len() as u64;
    }

    ctx.cache
        .fs_refresh_stat(id, fresh.mode, fresh.mtime_ns, fresh.size)?;
    ctx.cache.fs_set_obj(id, &oid)?;
    stats.dirs += 1;
    debug!(path = %path.display(), oid = %oid, "directory backed up");
    Ok(())
}

/// Remove an entry the walker found gone or unusable. The next scan would
/// do the same; doing it now keeps the parent tree honest.
fn drop_entry(ctx: &BackupContext<'_>, id: i64, entry: &FsEntryRow) -> Result<()> {
    if let Some(parent_id) = entry.parent_id {
        ctx.cache.fs_invalidate_ancestors(parent_id)?;
    }
    ctx.cache.fs_delete_recursive(id)?;
    Ok(())
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Guard against path components that would escape the snapshot key space.
pub(crate) fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(CairnError::Config("snapshot name must be 1-255 bytes".into()));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(CairnError::Config(format!(
            "snapshot name '{name}' contains path separators"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_validation() {
        assert!(validate_snapshot_name("nightly-2024-01-01").is_ok());
        assert!(validate_snapshot_name("").is_err());
        assert!(validate_snapshot_name("a/b").is_err());
        assert!(validate_snapshot_name("..").is_err());
    }

    #[test]
    fn upload_pool_sequential_below_two_threads() {
        assert!(build_upload_pool(0).unwrap().is_none());
        assert!(build_upload_pool(1).unwrap().is_none());
        assert!(build_upload_pool(2).unwrap().is_some());
    }
}
