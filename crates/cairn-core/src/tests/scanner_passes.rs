use crate::cancel::CancelToken;
use crate::error::CairnError;
use crate::tests::helpers::{scan_and_backup, setup, SourceTree, SET};
use crate::testutil::test_repo;

#[test]
fn bootstrap_discovers_whole_tree() {
    let source = SourceTree::new();
    source.write("a/b.txt", b"foo");
    source.write("c.txt", b"bar");

    let repo = test_repo();
    repo.add_root(SET, source.root()).unwrap();
    let stats = repo.scan(&CancelToken::new()).unwrap();

    // root, a, a/b.txt, c.txt
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 4);
    assert_eq!(stats.added, 3);
    assert!(!repo.cache().fs_has_new().unwrap());

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let root_entry = repo.cache().fs_get(root.entry_id).unwrap().unwrap();
    assert!(root_entry.obj_id.is_none());
    assert!(root_entry.is_dir());
}

#[test]
fn steady_state_rescan_changes_nothing() {
    let source = SourceTree::new();
    source.write("a/b.txt", b"foo");
    source.write("c.txt", b"bar");

    let repo = test_repo();
    setup(&repo, &source);
    scan_and_backup(&repo, "s1");

    let stats = repo.scan(&CancelToken::new()).unwrap();
    assert_eq!(stats.dirtied, 0);
    assert_eq!(stats.added, 0);
    assert_eq!(stats.removed, 0);

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let root_entry = repo.cache().fs_get(root.entry_id).unwrap().unwrap();
    assert!(root_entry.obj_id.is_some(), "clean rescan must keep OIDs");
}

#[test]
fn modified_file_invalidates_ancestors() {
    let source = SourceTree::new();
    source.write("a/b.txt", b"foo");
    source.write("c.txt", b"bar");

    let repo = test_repo();
    setup(&repo, &source);
    scan_and_backup(&repo, "s1");

    source.write("a/b.txt", b"foo changed");
    let stats = repo.scan(&CancelToken::new()).unwrap();
    assert!(stats.dirtied >= 1);

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let root_entry = repo.cache().fs_get(root.entry_id).unwrap().unwrap();
    assert!(root_entry.obj_id.is_none(), "root must be invalidated");

    let children = repo.cache().fs_children(root.entry_id).unwrap();
    let a = children.iter().find(|c| c.name == b"a").unwrap();
    assert!(a.obj_id.is_none(), "parent dir must be invalidated");
    let c = children.iter().find(|c| c.name == b"c.txt").unwrap();
    assert!(c.obj_id.is_some(), "unrelated entry must keep its OID");
}

#[test]
fn deleted_entry_is_removed_and_parent_dirtied() {
    let source = SourceTree::new();
    source.write("a/b.txt", b"foo");
    source.write("c.txt", b"bar");

    let repo = test_repo();
    setup(&repo, &source);
    scan_and_backup(&repo, "s1");

    source.remove("c.txt");
    let stats = repo.scan(&CancelToken::new()).unwrap();
    assert_eq!(stats.removed, 1);

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let children = repo.cache().fs_children(root.entry_id).unwrap();
    assert!(children.iter().all(|c| c.name != b"c.txt"));
    let root_entry = repo.cache().fs_get(root.entry_id).unwrap().unwrap();
    assert!(root_entry.obj_id.is_none());
}

#[test]
fn deleted_subtree_is_removed_recursively() {
    let source = SourceTree::new();
    source.write("dir/sub/leaf.txt", b"data");

    let repo = test_repo();
    setup(&repo, &source);
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 4);

    source.remove("dir");
    repo.scan(&CancelToken::new()).unwrap();
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 1);
}

#[test]
fn new_deep_subtree_is_discovered_across_passes() {
    let source = SourceTree::new();
    source.write("top.txt", b"x");

    let repo = test_repo();
    setup(&repo, &source);

    source.write("d1/d2/d3/deep.txt", b"deep");
    let stats = repo.scan(&CancelToken::new()).unwrap();
    assert_eq!(stats.added, 4);
    assert!(!repo.cache().fs_has_new().unwrap());
    // root + top.txt + d1 + d2 + d3 + deep.txt
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 6);
}

#[test]
fn file_replaced_by_directory_is_rescanned() {
    let source = SourceTree::new();
    source.write("thing", b"i am a file");

    let repo = test_repo();
    setup(&repo, &source);

    source.remove("thing");
    source.mkdir("thing");
    source.write("thing/inner.txt", b"inner");

    repo.scan(&CancelToken::new()).unwrap();

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let children = repo.cache().fs_children(root.entry_id).unwrap();
    let thing = children.iter().find(|c| c.name == b"thing").unwrap();
    assert!(thing.is_dir());
    let inner = repo.cache().fs_children(thing.id).unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].name, b"inner.txt");
}

#[test]
fn directory_replaced_by_file_drops_children() {
    let source = SourceTree::new();
    source.write("thing/inner.txt", b"inner");

    let repo = test_repo();
    setup(&repo, &source);
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 3);

    source.remove("thing");
    source.write("thing", b"now a file");

    repo.scan(&CancelToken::new()).unwrap();
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 2);

    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let children = repo.cache().fs_children(root.entry_id).unwrap();
    let thing = children.iter().find(|c| c.name == b"thing").unwrap();
    assert!(thing.is_file());
}

#[test]
fn cancelled_scan_aborts_without_committing() {
    let source = SourceTree::new();
    source.write("a.txt", b"data");

    let repo = test_repo();
    repo.add_root(SET, source.root()).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = repo.scan(&cancel).unwrap_err();
    assert!(matches!(err, CairnError::Cancelled));

    // The aborted transaction must roll back: the root is still unscanned.
    let root = repo.cache().fs_root(SET).unwrap().unwrap();
    let entry = repo.cache().fs_get(root.entry_id).unwrap().unwrap();
    assert!(entry.new_flag);
    assert_eq!(repo.cache().fs_entry_count().unwrap(), 1);
}
