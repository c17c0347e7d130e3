//! Materialize a snapshot's DAG back onto the filesystem.
//!
//! The restore path is the inverse of backup: fetch, open, decompress,
//! decode, walk. Every fetched payload is verified against its OID before
//! use, so a tampered or corrupted repository surfaces as an error rather
//! than silently wrong contents. This is the one flow that reads object
//! payloads from the repository, and it requires the unlocked private key.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cairn_types::object_id::ObjectId;

use crate::cancel::CancelToken;
use crate::crypto::CryptoProvider;
use crate::error::{CairnError, Result};
use crate::object::codec;
use crate::object::{InodeObject, ObjectPayload, TreeObject};
use crate::platform;
use crate::storage::{object_key, StorageBackend};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes_written: u64,
}

/// Fetch one object and verify its content address.
pub(crate) fn fetch_object(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoProvider,
    oid: &ObjectId,
) -> Result<ObjectPayload> {
    let wire = storage.get(&object_key(oid))?;
    let plain = codec::unpack_payload(&wire, crypto)?;
    let actual = crypto.object_id(&plain);
    if actual != *oid {
        return Err(CairnError::CorruptObject(format!(
            "object {oid} payload does not match its id"
        )));
    }
    codec::decode(&plain)
}

/// Restore the tree rooted at `root_oid` into `target`, which must not yet
/// exist. Permissions are applied best-effort (ownership needs root and is
/// skipped).
pub fn restore_tree(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoProvider,
    root_oid: &ObjectId,
    target: &Path,
    cancel: &CancelToken,
) -> Result<RestoreStats> {
    if !crypto.can_open() {
        return Err(CairnError::KeyLocked);
    }
    if target.exists() {
        return Err(CairnError::Config(format!(
            "restore target '{}' already exists",
            target.display()
        )));
    }

    let mut stats = RestoreStats::default();
    match fetch_object(storage, crypto, root_oid)? {
        ObjectPayload::Tree(tree) => {
            restore_dir(storage, crypto, &tree, target.to_path_buf(), cancel, &mut stats)?
        }
        ObjectPayload::Inode(inode) => {
            restore_file(storage, crypto, &inode, target, cancel, &mut stats)?
        }
        ObjectPayload::Blob(_) => {
            return Err(CairnError::CorruptObject(
                "snapshot root is a bare blob".into(),
            ));
        }
    }
    Ok(stats)
}

/// Iterative pre-order restore of a directory subtree. Directories are
/// created before their children; modes are applied after contents so a
/// read-only directory does not block its own population.
fn restore_dir(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoProvider,
    root: &TreeObject,
    root_target: PathBuf,
    cancel: &CancelToken,
    stats: &mut RestoreStats,
) -> Result<()> {
    let mut stack: Vec<(TreeObject, PathBuf)> = vec![(root.clone(), root_target)];
    let mut mode_fixups: Vec<(PathBuf, u32)> = Vec::new();

    while let Some((tree, target)) = stack.pop() {
        cancel.check()?;
        fs::create_dir_all(&target)?;
        mode_fixups.push((target.clone(), tree.mode));
        stats.dirs += 1;

        for entry in &tree.entries {
            cancel.check()?;
            let child_path = target.join(platform::bytes_to_os(&entry.name));
            match fetch_object(storage, crypto, &entry.child)? {
                ObjectPayload::Tree(subtree) => stack.push((subtree, child_path)),
                ObjectPayload::Inode(inode) => {
                    restore_file(storage, crypto, &inode, &child_path, cancel, stats)?;
                }
                ObjectPayload::Blob(_) => {
                    return Err(CairnError::CorruptObject(format!(
                        "tree entry '{}' references a bare blob",
                        String::from_utf8_lossy(&entry.name)
                    )));
                }
            }
        }
    }

    // Deepest-first so parent modes land after children exist.
    for (path, mode) in mode_fixups.into_iter().rev() {
        if let Err(e) = platform::apply_mode(&path, mode) {
            warn!(path = %path.display(), error = %e, "failed to apply directory mode");
        }
    }
    Ok(())
}

fn restore_file(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoProvider,
    inode: &InodeObject,
    target: &Path,
    cancel: &CancelToken,
    stats: &mut RestoreStats,
) -> Result<()> {
    let mut file = fs::File::create(target)?;
    for chunk in &inode.chunks {
        cancel.check()?;
        let data = match fetch_object(storage, crypto, &chunk.blob)? {
            ObjectPayload::Blob(data) => data,
            other => {
                return Err(CairnError::CorruptObject(format!(
                    "inode chunk references a {} object",
                    other.kind().as_str()
                )));
            }
        };
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&data)?;
        stats.bytes_written += data.len() as u64;
    }
    file.flush()?;
    drop(file);

    if let Err(e) = platform::apply_mode(target, inode.mode) {
        warn!(path = %target.display(), error = %e, "failed to apply file mode");
    }
    stats.files += 1;
    debug!(path = %target.display(), size = inode.size, "file restored");
    Ok(())
}
