// Path: crates/state/src/nodedb/tests.rs
use super::*;
use super::prune::PRUNE_POLL_INTERVAL;
use crate::mutable_tree::MutableTree;
use crate::node::encode::{put_bytes, put_varint};
use crate::node::sha256;
use iavl_storage::MemDb;
use std::time::{Duration, Instant};

fn opts() -> TreeOptions {
    TreeOptions::default()
}

/// Saves one version per entry of `versions`, each applying its `(key, value)` sets.
fn build_versions(db: &Arc<MemDb>, options: TreeOptions, versions: &[&[(&str, &str)]]) -> MutableTree {
    let mut tree = MutableTree::new(db.clone(), options);
    tree.load().unwrap();
    for sets in versions {
        for (k, v) in sets.iter() {
            tree.set(k.as_bytes(), v.as_bytes()).unwrap();
        }
        tree.save_version().unwrap();
    }
    tree
}

fn wait_for_prune(ndb: &NodeDb) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ndb.pending_prune() != 0 {
        assert!(Instant::now() < deadline, "background pruning did not finish");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn legacy_leaf(db: &MemDb, key: &[u8], value: &[u8], version: i64) -> Hash {
    let mut preimage = Vec::new();
    put_varint(&mut preimage, 0);
    put_varint(&mut preimage, 1);
    put_varint(&mut preimage, version);
    put_bytes(&mut preimage, key);
    put_bytes(&mut preimage, &sha256(value));
    let hash = sha256(&preimage);

    let mut stored = Vec::new();
    put_varint(&mut stored, 0);
    put_varint(&mut stored, 1);
    put_varint(&mut stored, version);
    put_bytes(&mut stored, key);
    put_bytes(&mut stored, value);
    db.set(&key_format::legacy_node_key(&hash), &stored).unwrap();
    hash
}

fn legacy_inner(db: &MemDb, key: &[u8], left: Hash, right: Hash, version: i64) -> Hash {
    let mut preimage = Vec::new();
    put_varint(&mut preimage, 1);
    put_varint(&mut preimage, 2);
    put_varint(&mut preimage, version);
    put_bytes(&mut preimage, &left);
    put_bytes(&mut preimage, &right);
    let hash = sha256(&preimage);

    let mut stored = Vec::new();
    put_varint(&mut stored, 1);
    put_varint(&mut stored, 2);
    put_varint(&mut stored, version);
    put_bytes(&mut stored, key);
    put_bytes(&mut stored, &left);
    put_bytes(&mut stored, &right);
    db.set(&key_format::legacy_node_key(&hash), &stored).unwrap();
    hash
}

fn count_prefix(db: &MemDb, prefix: u8) -> usize {
    let end = key_format::prefix_end(&[prefix]);
    db.iterator(Some(&[prefix]), end.as_deref()).unwrap().count()
}

#[test]
fn test_get_node_counts_cache_hits_and_misses() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    build_versions(&db, opts(), &[&[("a", "1"), ("b", "2")]]);
    let stats = Arc::new(Statistics::new());
    let ndb = NodeDb::new(db.clone(), opts(), Some(stats.clone()));

    // 2. ACT
    let root = ndb.get_root(1).unwrap().unwrap();
    let first = ndb.get_node(&root).unwrap();
    let second = ndb.get_node(&root).unwrap();

    // 3. ASSERT
    assert_eq!(root, NodeId::Versioned(NodeKey::new(1, 1)));
    assert_eq!(first.hash(), second.hash());
    assert_eq!(first.size(), 2);
    assert_eq!(stats.cache_miss(), 1);
    assert_eq!(stats.cache_hit(), 1);
}

#[test]
fn test_get_root_of_empty_reference_and_missing_versions() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let mut tree = MutableTree::new(db.clone(), opts());
    tree.save_version().unwrap();
    tree.set(b"k", b"v").unwrap();
    tree.save_version().unwrap();
    tree.save_version().unwrap();
    let ndb = tree.node_db().clone();

    // 2. ACT
    let empty = ndb.get_root(1).unwrap();
    let literal = ndb.get_root(2).unwrap();
    let reference = ndb.get_root(3).unwrap();
    let missing = ndb.get_root(4);

    // 3. ASSERT
    assert_eq!(empty, None);
    assert_eq!(literal, Some(NodeId::Versioned(NodeKey::new(2, 1))));
    // Version 3 changed nothing and points at version 2's root.
    assert_eq!(reference, literal);
    assert!(matches!(missing, Err(TreeError::VersionDoesNotExist)));
}

#[test]
fn test_versions_are_rediscovered_from_the_store() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(&db, opts(), &[&[("a", "1")], &[("b", "2")], &[("c", "3")]]);
    tree.delete_versions_to(1).unwrap();
    drop(tree);

    // 2. ACT
    let ndb = NodeDb::new(db.clone(), opts(), None);

    // 3. ASSERT
    assert_eq!(ndb.latest_version().unwrap(), 3);
    assert_eq!(ndb.first_version().unwrap(), 2);
    assert_eq!(ndb.legacy_latest_version().unwrap(), 0);
    assert!(ndb.has_version(2).unwrap());
    assert!(!ndb.has_version(1).unwrap());
}

#[test]
fn test_empty_store_has_no_versions() {
    // 1. SETUP
    let ndb = NodeDb::new(Arc::new(MemDb::new()), opts(), None);

    // 2. ACT
    let (first, latest) = (ndb.first_version().unwrap(), ndb.latest_version().unwrap());

    // 3. ASSERT
    assert_eq!((first, latest), (0, 0));
    assert_eq!(ndb.storage_version(), DEFAULT_STORAGE_VERSION);
    assert!(!ndb.has_upgraded_to_fast_storage());
    assert!(matches!(ndb.get_fast_node(b"k"), Err(TreeError::NotFastStorage)));
}

#[test]
fn test_reader_guard_blocks_pruning_until_dropped() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(&db, opts(), &[&[("a", "1")], &[("a", "2")], &[("a", "3")]]);
    let ndb = tree.node_db().clone();

    // 2. ACT
    let reader = ndb.reader(1);
    let blocked = tree.delete_versions_to(1);
    let readers_while_held = ndb.version_readers(1);
    drop(reader);
    let allowed = tree.delete_versions_to(1);

    // 3. ASSERT
    assert!(matches!(
        blocked,
        Err(TreeError::ActiveReaders { version: 1, readers: 1 })
    ));
    assert_eq!(readers_while_held, 1);
    assert_eq!(ndb.version_readers(1), 0);
    allowed.unwrap();
    assert_eq!(ndb.first_version().unwrap(), 2);
}

#[test]
fn test_pruning_the_latest_version_is_rejected() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(&db, opts(), &[&[("a", "1")], &[("b", "2")]]);

    // 2. ACT
    let result = tree.delete_versions_to(2);

    // 3. ASSERT
    assert!(matches!(
        result,
        Err(TreeError::PruneLatestVersion { latest: 2, to_version: 2 })
    ));
    assert!(tree.version_exists(1));
}

#[test]
fn test_pruning_removes_orphans_and_keeps_later_versions() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(
        &db,
        opts(),
        &[
            &[("a", "1"), ("b", "1"), ("c", "1"), ("d", "1")],
            &[("b", "2")],
            &[("e", "3")],
        ],
    );
    let ndb = tree.node_db().clone();
    let before = ndb.node_count().unwrap();
    let v2_hash = tree.get_immutable(2).unwrap().hash().unwrap();

    // 2. ACT
    tree.delete_versions_to(1).unwrap();

    // 3. ASSERT
    let after = ndb.node_count().unwrap();
    assert!(after < before, "expected fewer nodes, {after} >= {before}");
    assert!(matches!(ndb.get_root(1), Err(TreeError::VersionDoesNotExist)));
    let v2 = tree.get_immutable(2).unwrap();
    assert_eq!(v2.hash().unwrap(), v2_hash);
    assert_eq!(v2.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(v2.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(tree.get_versioned(b"e", 3).unwrap(), Some(b"3".to_vec()));
    assert_eq!(tree.available_versions().unwrap(), vec![2, 3]);
}

#[test]
fn test_pruning_moves_a_shared_root_to_nonce_zero() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let mut tree = build_versions(&db, opts(), &[&[("a", "1"), ("b", "2")]]);
    // Version 2 stores only a reference to version 1's root.
    let (hash, _) = tree.save_version().unwrap();

    // 2. ACT
    tree.delete_versions_to(1).unwrap();

    // 3. ASSERT
    assert!(!db.has(&key_format::node_key(&NodeKey::new(1, 1))).unwrap());
    assert!(db.has(&key_format::node_key(&NodeKey::new(1, 0))).unwrap());
    let ndb = NodeDb::new(db.clone(), opts(), None);
    assert_eq!(
        ndb.get_root(2).unwrap(),
        Some(NodeId::Versioned(NodeKey::new(1, 0)))
    );
    // A literal nonce-1 lookup falls back to the moved root.
    let moved = ndb.get_node(&NodeId::Versioned(NodeKey::new(1, 1))).unwrap();
    assert_eq!(moved.hash(), Some(&hash));

    // A later unchanged version still resolves through the old reference.
    let (next_hash, next) = tree.save_version().unwrap();
    assert_eq!(next, 3);
    assert_eq!(next_hash, hash);
    assert_eq!(tree.get_versioned(b"b", 3).unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_legacy_versions_are_read_then_removed_together() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let a = legacy_leaf(&db, b"a", b"1", 1);
    let b = legacy_leaf(&db, b"b", b"2", 1);
    let root = legacy_inner(&db, b"b", a, b, 1);
    db.set(&key_format::legacy_root_key(1), &root).unwrap();
    db.set(&key_format::legacy_orphan_key(1, 1, &[7u8; 32]), &[7u8; 32]).unwrap();

    let mut tree = MutableTree::new(db.clone(), opts());
    assert_eq!(tree.load().unwrap(), 1);
    assert_eq!(tree.hash().unwrap(), root);
    assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    tree.set(b"c", b"3").unwrap();
    tree.save_version().unwrap();

    // 2. ACT
    tree.delete_versions_to(1).unwrap();

    // 3. ASSERT
    let ndb = tree.node_db().clone();
    assert_eq!(ndb.legacy_latest_version().unwrap(), 0);
    assert_eq!(count_prefix(&db, key_format::LEGACY_ROOT_PREFIX), 0);
    assert_eq!(count_prefix(&db, key_format::LEGACY_ORPHAN_PREFIX), 0);
    // Only the legacy root was orphaned; both leaves are still shared by version 2.
    assert!(!db.has(&key_format::legacy_node_key(&root)).unwrap());
    assert_eq!(count_prefix(&db, key_format::LEGACY_NODE_PREFIX), 2);
    let v2 = tree.get_immutable(2).unwrap();
    assert_eq!(v2.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(v2.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(v2.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(tree.available_versions().unwrap(), vec![2]);
}

#[test]
fn test_legacy_deletion_is_written_with_the_rest_of_the_prune() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let a = legacy_leaf(&db, b"a", b"1", 1);
    let b = legacy_leaf(&db, b"b", b"2", 1);
    let root = legacy_inner(&db, b"b", a, b, 1);
    db.set(&key_format::legacy_root_key(1), &root).unwrap();

    let mut tree = MutableTree::new(db.clone(), opts());
    tree.load().unwrap();
    tree.set(b"c", b"3").unwrap();
    tree.save_version().unwrap();
    tree.set(b"c", b"4").unwrap();
    tree.save_version().unwrap();
    let ndb = tree.node_db().clone();

    // 2. ACT
    ndb.delete_versions_to(2).unwrap();
    let root_before_commit = db.has(&key_format::legacy_root_key(1)).unwrap();
    let node_before_commit = db.has(&key_format::legacy_node_key(&root)).unwrap();
    ndb.commit().unwrap();

    // 3. ASSERT
    assert!(root_before_commit);
    assert!(node_before_commit);
    assert_eq!(count_prefix(&db, key_format::LEGACY_ROOT_PREFIX), 0);
    assert!(!db.has(&key_format::legacy_node_key(&root)).unwrap());
    assert_eq!(ndb.first_version().unwrap(), 3);
    assert_eq!(tree.get_versioned(b"c", 3).unwrap(), Some(b"4".to_vec()));
}

#[test]
fn test_delete_versions_from_drops_later_versions() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(&db, opts(), &[&[("a", "1")], &[("b", "2")], &[("c", "3")]]);
    let ndb = tree.node_db().clone();

    // 2. ACT
    tree.delete_versions_from(2).unwrap();

    // 3. ASSERT
    assert_eq!(ndb.latest_version().unwrap(), 1);
    assert!(!ndb.has_version(2).unwrap());
    assert!(!ndb.has_version(3).unwrap());
    assert_eq!(count_prefix(&db, key_format::NODE_PREFIX), 1);
    let fresh = NodeDb::new(db.clone(), opts(), None);
    assert_eq!(fresh.latest_version().unwrap(), 1);
}

#[test]
fn test_storage_version_tracks_latest_saved_version() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    build_versions(&db, opts(), &[&[("a", "1")], &[("b", "2")]]);

    // 2. ACT
    let ndb = NodeDb::new(db.clone(), opts(), None);

    // 3. ASSERT
    assert_eq!(ndb.storage_version(), format!("{FAST_STORAGE_VERSION}-2"));
    assert!(ndb.has_upgraded_to_fast_storage());
    assert!(!ndb.should_force_fast_storage_upgrade().unwrap());
    let fast = ndb.get_fast_node(b"b").unwrap().unwrap();
    assert_eq!(fast.value, b"2".to_vec());
    assert_eq!(fast.version_last_updated_at, 2);

    // A suffix that trails the latest version forces a rebuild.
    db.set(&key_format::metadata_key(STORAGE_VERSION_KEY), b"1.1.0-1").unwrap();
    let stale = NodeDb::new(db.clone(), opts(), None);
    assert!(stale.should_force_fast_storage_upgrade().unwrap());
}

#[test]
fn test_async_pruning_runs_in_background() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(
        &db,
        opts().with_async_pruning(true),
        &[&[("a", "1")], &[("a", "2")], &[("a", "3")], &[("a", "4")]],
    );
    let ndb = tree.node_db().clone();

    // 2. ACT
    tree.delete_versions_to(2).unwrap();
    wait_for_prune(&ndb);

    // 3. ASSERT
    assert_eq!(ndb.first_version().unwrap(), 3);
    assert!(!db.has(&key_format::node_key(&NodeKey::new(1, 1))).unwrap());
    assert!(!db.has(&key_format::node_key(&NodeKey::new(2, 1))).unwrap());
    assert_eq!(tree.get_versioned(b"a", 3).unwrap(), Some(b"3".to_vec()));
    tree.close().unwrap();
}

#[test]
fn test_async_pruning_waits_for_in_flight_commit() {
    // 1. SETUP
    let db = Arc::new(MemDb::new());
    let tree = build_versions(
        &db,
        opts().with_async_pruning(true),
        &[&[("a", "1")], &[("a", "2")], &[("a", "3")], &[("a", "4")]],
    );
    let ndb = tree.node_db().clone();
    let orphan = key_format::node_key(&NodeKey::new(1, 1));

    // 2. ACT
    ndb.set_committing();
    tree.delete_versions_to(2).unwrap();
    std::thread::sleep(PRUNE_POLL_INTERVAL + Duration::from_millis(500));
    let present_while_committing = db.has(&orphan).unwrap();
    ndb.unset_committing();
    wait_for_prune(&ndb);

    // 3. ASSERT
    assert!(present_while_committing);
    assert!(!db.has(&orphan).unwrap());
    assert_eq!(ndb.first_version().unwrap(), 3);
    tree.close().unwrap();
}
