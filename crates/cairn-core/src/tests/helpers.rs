use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::repo::Repository;

/// A temp directory to back up, with helpers to mutate it between scans.
pub(crate) struct SourceTree {
    pub dir: tempfile::TempDir,
}

impl SourceTree {
    pub(crate) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub(crate) fn write(&self, rel: &str, contents: &[u8]) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }

    pub(crate) fn mkdir(&self, rel: &str) -> PathBuf {
        let path = self.path(rel);
        std::fs::create_dir_all(&path).expect("mkdir");
        path
    }

    pub(crate) fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.is_dir() {
            std::fs::remove_dir_all(&path).expect("rmdir");
        } else {
            std::fs::remove_file(&path).expect("rm");
        }
    }

    pub(crate) fn rename(&self, from: &str, to: &str) {
        std::fs::rename(self.path(from), self.path(to)).expect("rename");
    }
}

pub(crate) const SET: &str = "default";

/// Register the source tree and run the initial scan.
pub(crate) fn setup(repo: &Repository, source: &SourceTree) {
    repo.add_root(SET, source.root()).expect("add root");
    repo.scan(&CancelToken::new()).expect("initial scan");
}

/// Scan then back up under the given snapshot name.
pub(crate) fn scan_and_backup(
    repo: &Repository,
    name: &str,
) -> crate::backup::BackupStats {
    let cancel = CancelToken::new();
    repo.scan(&cancel).expect("scan");
    repo.backup(SET, name, &cancel).expect("backup")
}

/// Count object-cache rows of each kind: (blobs, inodes, trees).
pub(crate) fn object_kind_counts(repo: &Repository) -> (u64, u64, u64) {
    use crate::object::ObjectKind;
    let mut blobs = 0;
    let mut inodes = 0;
    let mut trees = 0;
    let mut oids = Vec::new();
    repo.cache()
        .obj_for_each(|oid| {
            oids.push(oid);
            Ok(())
        })
        .expect("iterate objects");
    for oid in oids {
        match repo.cache().obj_get(&oid).expect("row").expect("present").kind {
            ObjectKind::Blob => blobs += 1,
            ObjectKind::Inode => inodes += 1,
            ObjectKind::Tree => trees += 1,
        }
    }
    (blobs, inodes, trees)
}
