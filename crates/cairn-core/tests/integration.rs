use std::collections::BTreeMap;
use std::path::Path;

use cairn_core::cache::CacheDb;
use cairn_core::cancel::CancelToken;
use cairn_core::config::{ChunkerConfig, CompressionAlgorithm, EngineConfig};
use cairn_core::error::CairnError;
use cairn_core::object::ObjectKind;
use cairn_core::repo::Repository;
use cairn_core::restore;
use cairn_core::snapshot::SnapshotMeta;
use cairn_core::storage::local_backend::LocalBackend;
use cairn_core::storage::retry::{RetryBackend, RetryPolicy};
use cairn_core::storage::StorageBackend;

const PASSPHRASE: &str = "integration-passphrase";
const SET: &str = "default";

fn engine_config() -> EngineConfig {
    EngineConfig {
        chunker: ChunkerConfig {
            chunk_size: 8,
            min_chunkable: 16,
        },
        compression: CompressionAlgorithm::Zstd,
        zstd_level: 3,
        upload_threads: 4,
    }
}

fn local_storage(repo_dir: &Path) -> Box<dyn StorageBackend> {
    Box::new(RetryBackend::new(
        LocalBackend::new(repo_dir).unwrap(),
        RetryPolicy::default(),
    ))
}

fn init_repo(repo_dir: &Path, cache_path: &Path) -> Repository {
    let cache = CacheDb::open(cache_path).unwrap();
    Repository::init(local_storage(repo_dir), cache, Some(PASSPHRASE), engine_config()).unwrap()
}

fn open_repo(repo_dir: &Path, cache_path: &Path) -> Repository {
    let cache = CacheDb::open(cache_path).unwrap();
    Repository::open(local_storage(repo_dir), cache).unwrap()
}

fn scan_and_backup(repo: &Repository, name: &str) -> cairn_core::backup::BackupStats {
    let cancel = CancelToken::new();
    repo.scan(&cancel).unwrap();
    repo.backup(SET, name, &cancel).unwrap()
}

fn object_kind_counts(repo: &Repository) -> (u64, u64, u64) {
    let mut blobs = 0;
    let mut inodes = 0;
    let mut trees = 0;
    let mut oids = Vec::new();
    repo.cache()
        .obj_for_each(|oid| {
            oids.push(oid);
            Ok(())
        })
        .unwrap();
    for oid in oids {
        match repo.cache().obj_get(&oid).unwrap().unwrap().kind {
            ObjectKind::Blob => blobs += 1,
            ObjectKind::Inode => inodes += 1,
            ObjectKind::Tree => trees += 1,
        }
    }
    (blobs, inodes, trees)
}

fn snapshot_of_dir(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            if entry.file_type().unwrap().is_dir() {
                out.insert(rel, None);
                stack.push(path);
            } else {
                out.insert(rel, Some(std::fs::read(&path).unwrap()));
            }
        }
    }
    out
}

#[test]
fn full_backup_lifecycle_over_local_repository() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_dir = tmp.path().join("repo");
    let cache_path = tmp.path().join("cache.db");
    let source_dir = tmp.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::create_dir_all(source_dir.join("a")).unwrap();
    std::fs::write(source_dir.join("a/b.txt"), b"foo").unwrap();
    std::fs::write(source_dir.join("c.txt"), b"bar").unwrap();

    let repo = init_repo(&repo_dir, &cache_path);
    repo.add_root(SET, &source_dir).unwrap();

    // Fresh backup: 2 blobs, 2 inodes, 2 trees, 1 snapshot record.
    let s1 = scan_and_backup(&repo, "s1");
    assert_eq!(s1.blobs_uploaded, 2);
    assert_eq!(s1.inodes_uploaded, 2);
    assert_eq!(s1.trees_uploaded, 2);
    assert_eq!(object_kind_counts(&repo), (2, 2, 2));
    assert!(repo.storage().exists("snapshots/s1").unwrap());

    // No changes: zero new objects.
    let rerun = scan_and_backup(&repo, "s1-rerun");
    assert_eq!(rerun.objects_uploaded(), 0);

    // Append one byte to one leaf: blob + inode + root tree.
    std::fs::write(source_dir.join("c.txt"), b"bar!").unwrap();
    let s2 = scan_and_backup(&repo, "s2");
    assert_eq!(s2.blobs_uploaded, 1);
    assert_eq!(s2.inodes_uploaded, 1);
    assert_eq!(s2.trees_uploaded, 1);

    // Rename: content dedups, the root tree changes.
    std::fs::rename(source_dir.join("c.txt"), source_dir.join("d.txt")).unwrap();
    let s3 = scan_and_backup(&repo, "s3");
    assert_eq!(s3.blobs_uploaded, 0);
    assert_eq!(s3.trees_uploaded, 1);

    // Reopen from disk: local key material and caches persist.
    drop(repo);
    let mut repo = open_repo(&repo_dir, &cache_path);
    assert_eq!(repo.snapshots().unwrap().len(), 4);

    // Prune the oldest snapshots and collect.
    repo.remove_snapshot("s1").unwrap();
    repo.remove_snapshot("s1-rerun").unwrap();
    let total_before = repo.cache().obj_count().unwrap();
    let gc = repo.collect_garbage(&CancelToken::new()).unwrap();
    assert!(gc.examined == total_before);
    let remaining = repo.cache().obj_count().unwrap();
    assert_eq!(remaining + gc.deleted, total_before);

    // Everything still reachable from s2/s3 must be present in storage.
    let mut live = repo.cache().snap_roots().unwrap();
    let mut checked = 0;
    while let Some(oid) = live.pop() {
        assert!(repo.cache().obj_exists(&oid).unwrap());
        assert!(repo
            .storage()
            .exists(&cairn_core::storage::object_key(&oid))
            .unwrap());
        live.extend(repo.cache().obj_children(&oid).unwrap());
        checked += 1;
    }
    assert!(checked > 0);

    // Restore the latest snapshot and compare with the live tree.
    repo.unlock(PASSPHRASE).unwrap();
    let restore_to = tmp.path().join("restored");
    repo.restore_snapshot("s3", &restore_to, &CancelToken::new())
        .unwrap();
    assert_eq!(snapshot_of_dir(&source_dir), snapshot_of_dir(&restore_to));
}

#[test]
fn attach_recovers_access_from_passphrase_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_dir = tmp.path().join("repo");
    let cache_path = tmp.path().join("cache.db");
    let source_dir = tmp.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::write(source_dir.join("file.txt"), b"survives disaster").unwrap();

    let repo = init_repo(&repo_dir, &cache_path);
    repo.add_root(SET, &source_dir).unwrap();
    scan_and_backup(&repo, "s1");
    drop(repo);

    // Simulate losing the local cache: attach with a fresh one, then pull
    // the snapshot metadata from the repository itself.
    let fresh_cache = CacheDb::open(&tmp.path().join("fresh-cache.db")).unwrap();
    let storage = local_storage(&repo_dir);
    let repo = Repository::attach(storage, fresh_cache, PASSPHRASE).unwrap();
    assert!(repo.crypto().can_open());

    let meta_wire = repo.storage().get("snapshots/s1").unwrap();
    let meta = SnapshotMeta::from_wire(&meta_wire, repo.crypto()).unwrap();
    assert_eq!(meta.name, "s1");

    let restore_to = tmp.path().join("restored");
    restore::restore_tree(
        repo.storage(),
        repo.crypto(),
        &meta.root_oid,
        &restore_to,
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(snapshot_of_dir(&source_dir), snapshot_of_dir(&restore_to));
}

#[test]
fn open_without_local_key_material_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();

    let repo = init_repo(&repo_dir, &tmp.path().join("cache.db"));
    drop(repo);

    let storage = local_storage(&repo_dir);
    let fresh_cache = CacheDb::open(&tmp.path().join("other-cache.db")).unwrap();
    let err = Repository::open(storage, fresh_cache).unwrap_err();
    assert!(matches!(err, CairnError::Config(_)));
}

#[test]
fn init_refuses_existing_repository() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_dir = tmp.path().join("repo");
    let repo = init_repo(&repo_dir, &tmp.path().join("cache.db"));
    drop(repo);

    let storage = local_storage(&repo_dir);
    let cache = CacheDb::open(&tmp.path().join("cache2.db")).unwrap();
    let err = Repository::init(storage, cache, Some(PASSPHRASE), engine_config()).unwrap_err();
    assert!(matches!(err, CairnError::RepoAlreadyExists));
}
