//! Multi-pass filesystem change detection against the files cache.
//!
//! The scanner never walks the filesystem tree recursively. Each pass
//! streams a batch of rows from the cache in arbitrary order, stats each
//! path once, and reconciles changed directories with one listdir. Entries
//! discovered along the way are inserted with the `new_flag` set and
//! picked up by the next pass, so passes are bounded by the depth of newly
//! discovered subtrees; a steady-state scan finishes in one pass.
//!
//! All mutations of a scan happen in a single immediate transaction.
//! SQLite gives no isolation between a streaming SELECT and writes on the
//! same connection, so a pass must tolerate re-seeing modified rows and
//! must never assume its own inserts become visible mid-iteration.

use std::collections::HashSet;

use rusqlite::{Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::cache::CacheDb;
use crate::cancel::CancelToken;
use crate::error::{is_soft_io_error, is_vanished_io_error, Result};
use crate::platform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Entries stat'd during this scan.
    pub scanned: u64,
    /// Entries newly inserted from directory listings.
    pub added: u64,
    /// Entries deleted because their path vanished or changed type.
    pub removed: u64,
    /// Entries whose stat tuple changed (marked dirty).
    pub dirtied: u64,
    /// Entries skipped on soft filesystem errors.
    pub errors: u64,
}

/// Scan every backup set for changes. Returns once no row with the
/// `new_flag` remains.
pub fn scan(cache: &CacheDb, cancel: &CancelToken) -> Result<ScanStats> {
    let mut stats = ScanStats::default();

    let tx = Transaction::new_unchecked(cache.raw(), TransactionBehavior::Immediate)?;

    // First pass: all existing (already stat'd) entries. Root entries that
    // were just added still carry the new flag and bootstrap in the
    // new-entry passes below.
    {
        let mut stmt = cache
            .raw()
            .prepare("SELECT id FROM fs_entry WHERE new_flag = 0")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cancel.check()?;
            scan_entry(cache, row.get(0)?, &mut stats)?;
        }
    }

    // Keep scanning new entries until none remain. Rows inserted during a
    // pass are not assumed visible to the open cursor; they are handled by
    // the next pass.
    while cache.fs_has_new()? {
        let mut pass_count = 0u64;
        let mut stmt = cache
            .raw()
            .prepare("SELECT id FROM fs_entry WHERE new_flag = 1")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cancel.check()?;
            scan_entry(cache, row.get(0)?, &mut stats)?;
            pass_count += 1;
        }
        // scan_entry always clears or deletes the row it visits, so an
        // empty pass with the flag still set would mean a logic bug; bail
        // instead of looping forever.
        if pass_count == 0 {
            break;
        }
    }

    // A changed child invalidates every ancestor's serialized tree.
    let invalidated = cache.fs_sweep_invalidate()?;
    debug!(invalidated, "ancestor invalidation sweep done");

    tx.commit()?;
    Ok(stats)
}

fn scan_entry(cache: &CacheDb, id: i64, stats: &mut ScanStats) -> Result<()> {
    // The row may have been deleted by a recursive delete earlier in this
    // pass, or re-yielded by the cursor after an update.
    let Some(entry) = cache.fs_get(id)? else {
        return Ok(());
    };
    let path = cache.fs_path(id)?;

    let metadata = match std::fs::symlink_metadata(&path) {
        Ok(md) => md,
        Err(e) if is_vanished_io_error(&e) => {
            info!(path = %path.display(), "entry vanished, deleting");
            if let Some(parent_id) = entry.parent_id {
                cache.fs_invalidate_ancestors(parent_id)?;
            }
            cache.fs_delete_recursive(id)?;
            stats.removed += 1;
            return Ok(());
        }
        Err(e) if is_soft_io_error(&e) => {
            warn!(path = %path.display(), error = %e, "stat failed, skipping entry");
            cache.fs_clear_new(id)?;
            stats.errors += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    stats.scanned += 1;

    let st = platform::summarize_metadata(&metadata);

    if !st.is_dir && !st.is_file {
        // Sockets, FIFOs, devices, symlinks: outside the object model.
        debug!(path = %path.display(), mode = st.mode, "unsupported file type, dropping entry");
        if let Some(parent_id) = entry.parent_id {
            cache.fs_invalidate_ancestors(parent_id)?;
        }
        cache.fs_delete_recursive(id)?;
        stats.removed += 1;
        return Ok(());
    }

    // A directory that became a file orphans its children. The reverse
    // (file became directory) has no children to clean up.
    if entry.is_dir() && !st.is_dir {
        info!(path = %path.display(), "no longer a directory");
        cache.fs_delete_children(id)?;
    }

    if !entry.new_flag && entry.stat_matches(st.mode, st.mtime_ns, st.size) {
        return Ok(());
    }

    let mtime_changed = entry.st_mtime_ns != Some(st.mtime_ns);
    let was_dir = entry.is_dir();

    cache.fs_update_stat(id, st.mode, st.mtime_ns, st.size)?;
    stats.dirtied += 1;

    // Re-list a directory when its mtime moved, when the entry is fresh,
    // or when it just became a directory. Entry-name churn inside a
    // directory always bumps its mtime, so an unchanged mtime means the
    // child set is intact.
    if st.is_dir && (mtime_changed || entry.new_flag || !was_dir) {
        reconcile_children(cache, id, &path, stats)?;
    }

    debug!(path = %path.display(), "entry updated");
    Ok(())
}

/// Compare a directory listing against the cached children: insert names
/// that appeared, recursively delete names that vanished.
fn reconcile_children(
    cache: &CacheDb,
    id: i64,
    path: &std::path::Path,
    stats: &mut ScanStats,
) -> Result<()> {
    let listing = match std::fs::read_dir(path) {
        Ok(rd) => rd,
        Err(e) if is_soft_io_error(&e) => {
            warn!(path = %path.display(), error = %e, "listdir failed, keeping cached children");
            stats.errors += 1;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut present: HashSet<Vec<u8>> = HashSet::new();
    for dirent in listing {
        let dirent = dirent?;
        present.insert(platform::os_to_bytes(&dirent.file_name()));
    }

    let known = cache.fs_children(id)?;
    let known_names: HashSet<&[u8]> = known.iter().map(|c| c.name.as_slice()).collect();

    for name in &present {
        if !known_names.contains(name.as_slice()) {
            cache.fs_insert_child(id, name)?;
            stats.added += 1;
            info!(
                parent = %path.display(),
                name = %String::from_utf8_lossy(name),
                "new path"
            );
        }
    }

    for child in &known {
        if !present.contains(&child.name) {
            info!(
                parent = %path.display(),
                name = %String::from_utf8_lossy(&child.name),
                "deleted from directory"
            );
            cache.fs_delete_recursive(child.id)?;
            stats.removed += 1;
        }
    }

    Ok(())
}
