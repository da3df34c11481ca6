// Path: crates/state/src/node/tests.rs
use super::*;

fn persisted_leaf(key: &[u8], value: &[u8], nk: NodeKey) -> Node {
    let mut leaf = Node::new_leaf(key.to_vec(), value.to_vec());
    leaf.node_key = Some(nk);
    leaf
}

fn persisted_inner(left: Node, right: Node, nk: NodeKey) -> Node {
    let key = right.key.clone();
    let left_id = left.id();
    let right_id = right.id();
    let mut inner = Node::new_inner(key, Arc::new(left), Arc::new(right));
    inner.node_key = Some(nk);
    inner.hash_with(nk.version).unwrap();
    inner.left_id = left_id;
    inner.right_id = right_id;
    inner
}

#[test]
fn test_leaf_hash_preimage() {
    // 1. SETUP
    let leaf = persisted_leaf(b"key", b"value", NodeKey::new(7, 1));

    // 2. ACT
    let hash = leaf.hash_with(0).unwrap();

    // 3. ASSERT
    let mut preimage = vec![0x00, 0x02, 0x0e, 0x03];
    preimage.extend_from_slice(b"key");
    preimage.push(0x20);
    preimage.extend_from_slice(&sha256(b"value"));
    assert_eq!(hash, sha256(&preimage));
}

#[test]
fn test_working_leaf_hashes_with_working_version() {
    // 1. SETUP
    let working = Node::new_leaf(b"k".to_vec(), b"v".to_vec());
    let saved = persisted_leaf(b"k", b"v", NodeKey::new(3, 2));

    // 2. ACT
    let working_hash = working.hash_with(3).unwrap();

    // 3. ASSERT
    assert_eq!(working_hash, saved.hash_with(99).unwrap());
    // The hash is memoized after the first computation.
    assert_eq!(working.hash_with(4).unwrap(), working_hash);
}

#[test]
fn test_inner_hash_commits_to_children() {
    // 1. SETUP
    let a = persisted_leaf(b"a", b"1", NodeKey::new(1, 2));
    let b = persisted_leaf(b"b", b"2", NodeKey::new(1, 3));
    let (ha, hb) = (a.hash_with(1).unwrap(), b.hash_with(1).unwrap());

    // 2. ACT
    let inner = persisted_inner(a, b, NodeKey::new(1, 1));

    // 3. ASSERT
    let mut preimage = vec![0x02, 0x04, 0x02];
    preimage.push(0x20);
    preimage.extend_from_slice(&ha);
    preimage.push(0x20);
    preimage.extend_from_slice(&hb);
    assert_eq!(inner.hash(), Some(&sha256(&preimage)));
    assert_eq!(inner.height(), 1);
    assert_eq!(inner.size(), 2);
}

#[test]
fn test_encode_decode_leaf() {
    // 1. SETUP
    let nk = NodeKey::new(12, 4);
    let leaf = persisted_leaf(b"hello", b"world", nk);
    let hash = leaf.hash_with(12).unwrap();

    // 2. ACT
    let decoded = Node::decode(nk, &leaf.encode().unwrap()).unwrap();

    // 3. ASSERT
    assert_eq!(decoded.key(), b"hello");
    assert_eq!(decoded.value(), Some(&b"world"[..]));
    assert_eq!(decoded.node_key(), Some(nk));
    assert_eq!(decoded.hash(), Some(&hash));
    decoded.validate().unwrap();
}

#[test]
fn test_encode_decode_inner_with_mixed_children() {
    // 1. SETUP
    let left = persisted_leaf(b"a", b"1", NodeKey::new(2, 2));
    let mut right = persisted_leaf(b"b", b"2", NodeKey::new(1, 0));
    right.is_legacy = true;
    right.hash_with(1).unwrap();
    let nk = NodeKey::new(2, 1);
    let inner = persisted_inner(left, right, nk);

    // 2. ACT
    let encoded = inner.encode().unwrap();
    let decoded = Node::decode(nk, &encoded).unwrap();

    // 3. ASSERT
    assert_eq!(decoded.hash(), inner.hash());
    assert_eq!(decoded.left_id, Some(NodeId::Versioned(NodeKey::new(2, 2))));
    assert!(matches!(decoded.right_id, Some(NodeId::Legacy(_))));
    assert_eq!(decoded.right_id, inner.right_id);
    assert_eq!(decoded.size(), 2);
    assert!(decoded.value().is_none());
}

#[test]
fn test_encode_inner_without_child_ids_fails() {
    // 1. SETUP
    let a = Arc::new(Node::new_leaf(b"a".to_vec(), b"1".to_vec()));
    let b = Arc::new(Node::new_leaf(b"b".to_vec(), b"2".to_vec()));
    let inner = Node::new_inner(b"b".to_vec(), a, b);
    inner.hash_with(1).unwrap();

    // 2. ACT
    let result = inner.encode();

    // 3. ASSERT
    assert!(matches!(result, Err(TreeError::Encode(_))));
}

#[test]
fn test_decode_legacy_node() {
    // 1. SETUP
    let hash = sha256(b"legacy");
    let mut bytes = Vec::new();
    put_varint(&mut bytes, 0);
    put_varint(&mut bytes, 1);
    put_varint(&mut bytes, 5);
    put_bytes(&mut bytes, b"key");
    put_bytes(&mut bytes, b"value");

    // 2. ACT
    let node = Node::decode_legacy(hash, &bytes).unwrap();

    // 3. ASSERT
    assert!(node.is_legacy());
    assert_eq!(node.id(), Some(NodeId::Legacy(hash)));
    assert_eq!(node.node_key().map(|nk| nk.version), Some(5));
    assert_eq!(node.value(), Some(&b"value"[..]));
}

#[test]
fn test_decode_rejects_truncated_and_invalid_input() {
    // 1. SETUP
    let nk = NodeKey::new(1, 1);
    let leaf = persisted_leaf(b"key", b"value", nk);
    let encoded = leaf.encode().unwrap();

    // 2. ACT
    let truncated = Node::decode(nk, &encoded[..encoded.len() - 2]);
    let bad_height = Node::decode(nk, &[0xfe, 0x01]);

    // 3. ASSERT
    assert!(truncated.is_err());
    assert!(bad_height.is_err());
}

#[test]
fn test_validate_rejects_malformed_nodes() {
    // 1. SETUP
    let unsaved = Node::new_leaf(b"k".to_vec(), b"v".to_vec());
    let zero_version = persisted_leaf(b"k", b"v", NodeKey::new(0, 1));
    let mut big_leaf = persisted_leaf(b"k", b"v", NodeKey::new(1, 1));
    big_leaf.size = 2;
    let mut childless_inner = persisted_leaf(b"k", b"v", NodeKey::new(1, 1));
    childless_inner.height = 1;
    childless_inner.value = None;

    // 2. ACT & 3. ASSERT
    for node in [unsaved, zero_version, big_leaf, childless_inner] {
        assert!(matches!(node.validate(), Err(TreeError::InvalidNode(_))));
    }
}

#[test]
fn test_clone_of_leaf_is_rejected() {
    // 1. SETUP
    let ndb = NodeDb::new(
        Arc::new(iavl_storage::MemDb::new()),
        iavl_types::config::TreeOptions::default(),
        None,
    );
    let leaf = Node::new_leaf(b"k".to_vec(), b"v".to_vec());

    // 2. ACT
    let result = leaf.clone_inner(&ndb);

    // 3. ASSERT
    assert!(matches!(result, Err(TreeError::CloneLeafNode)));
}

#[test]
fn test_get_and_index_lookups_on_working_tree() {
    // 1. SETUP
    let ndb = NodeDb::new(
        Arc::new(iavl_storage::MemDb::new()),
        iavl_types::config::TreeOptions::default(),
        None,
    );
    let a = Arc::new(Node::new_leaf(b"a".to_vec(), b"1".to_vec()));
    let c = Arc::new(Node::new_leaf(b"c".to_vec(), b"3".to_vec()));
    let root = Arc::new(Node::new_inner(b"c".to_vec(), a, c));

    // 2. ACT
    let hit = root.get(&ndb, b"c").unwrap();
    let between = root.get(&ndb, b"b").unwrap();
    let after = root.get(&ndb, b"d").unwrap();

    // 3. ASSERT
    assert_eq!(hit, (1, Some(b"3".to_vec())));
    assert_eq!(between, (1, None));
    assert_eq!(after, (2, None));
    assert_eq!(root.get_by_index(&ndb, 0).unwrap(), Some((b"a".to_vec(), b"1".to_vec())));
    assert!(root.has(&ndb, b"a").unwrap());
    assert!(!root.has(&ndb, b"b").unwrap());
}
