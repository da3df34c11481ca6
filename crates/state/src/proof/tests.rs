// Path: crates/state/src/proof/tests.rs
use super::*;
use crate::immutable_tree::ImmutableTree;
use crate::mutable_tree::MutableTree;
use iavl_storage::MemDb;
use iavl_types::config::TreeOptions;
use std::sync::Arc;

fn saved_tree(keys: &[&[u8]]) -> (MutableTree, ImmutableTree) {
    let mut tree = MutableTree::new(Arc::new(MemDb::new()), TreeOptions::default());
    for key in keys {
        tree.set(key, &[&b"value-"[..], key].concat()).unwrap();
    }
    let (_, version) = tree.save_version().unwrap();
    let snapshot = tree.get_immutable(version).unwrap();
    (tree, snapshot)
}

const KEYS: [&[u8]; 7] = [b"b", b"d", b"f", b"h", b"j", b"l", b"n"];

#[test]
fn test_membership_proofs_verify_for_every_key() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    for key in KEYS {
        // 2. ACT
        let proof = snapshot.get_membership_proof(key).unwrap();

        // 3. ASSERT
        let value = [&b"value-"[..], key].concat();
        assert!(verify_membership(&ProofSpec::iavl(), &root, &proof, key, &value));
        assert!(snapshot.verify_membership(&proof, key).unwrap());
        assert!(!verify_membership(&ProofSpec::iavl(), &root, &proof, key, b"other"));
        assert!(!verify_non_membership(&ProofSpec::iavl(), &root, &proof, key));
    }
}

#[test]
fn test_membership_proof_matches_node_hashes() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);

    // 2. ACT
    let CommitmentProof::Exist(exist) = snapshot.get_membership_proof(b"h").unwrap() else {
        panic!("expected an existence proof");
    };

    // 3. ASSERT
    assert_eq!(exist.calculate().unwrap(), snapshot.hash().unwrap());
    assert!(exist.path.len() <= usize::try_from(snapshot.height()).unwrap());
    assert_eq!(exist.leaf, LeafOp::iavl(1));
}

#[test]
fn test_non_membership_proofs_cover_every_gap() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    // Before the first key, between each pair, and after the last key.
    for missing in [&b"a"[..], b"c", b"e", b"g", b"i", b"k", b"m", b"z"] {
        // 2. ACT
        let proof = snapshot.get_non_membership_proof(missing).unwrap();

        // 3. ASSERT
        assert!(
            verify_non_membership(&ProofSpec::iavl(), &root, &proof, missing),
            "absence of {missing:?}"
        );
        assert!(snapshot.verify_non_membership(&proof, missing).unwrap());
        assert!(!verify_membership(&ProofSpec::iavl(), &root, &proof, missing, b"x"));
    }
}

#[test]
fn test_non_membership_proof_edges_have_one_neighbour() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);

    // 2. ACT
    let first = snapshot.get_non_membership_proof(b"a").unwrap();
    let last = snapshot.get_non_membership_proof(b"z").unwrap();

    // 3. ASSERT
    let CommitmentProof::Nonexist(first) = first else {
        panic!("expected a non-existence proof");
    };
    assert!(first.left.is_none());
    assert_eq!(first.right.as_ref().unwrap().key, b"b");
    let CommitmentProof::Nonexist(last) = last else {
        panic!("expected a non-existence proof");
    };
    assert!(last.right.is_none());
    assert_eq!(last.left.as_ref().unwrap().key, b"n");
}

#[test]
fn test_non_membership_rejects_non_adjacent_neighbours() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();
    let CommitmentProof::Nonexist(mut proof) = snapshot.get_non_membership_proof(b"e").unwrap()
    else {
        panic!("expected a non-existence proof");
    };

    // 2. ACT
    // Replace the right neighbour "f" with "h", which skips a key.
    let CommitmentProof::Exist(far) = snapshot.get_membership_proof(b"h").unwrap() else {
        panic!("expected an existence proof");
    };
    proof.right = Some(far);
    proof.key = b"g".to_vec();
    let forged = proof.verify(&ProofSpec::iavl(), &root, b"g");

    // 3. ASSERT
    assert!(matches!(forged, Err(ProofError::InvalidNonExistence(_))));
}

#[test]
fn test_non_membership_proof_for_present_key_fails() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);

    // 2. ACT
    let result = snapshot.get_non_membership_proof(b"d");

    // 3. ASSERT
    assert!(result.is_err());
}

#[test]
fn test_existence_proof_rejects_wrong_root_and_tampered_path() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();
    let CommitmentProof::Exist(mut proof) = snapshot.get_membership_proof(b"j").unwrap() else {
        panic!("expected an existence proof");
    };

    // 2. ACT
    let wrong_root = proof.verify(&ProofSpec::iavl(), &[7u8; 32], b"j", b"value-j");
    proof.path[0].prefix[0] ^= 0x02;
    let tampered = proof.verify(&ProofSpec::iavl(), &root, b"j", b"value-j");

    // 3. ASSERT
    assert_eq!(wrong_root, Err(ProofError::RootMismatch));
    assert!(tampered.is_err());
}

#[test]
fn test_leaf_prefix_with_trailing_bytes_is_rejected() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();
    let CommitmentProof::Exist(mut proof) = snapshot.get_membership_proof(b"b").unwrap() else {
        panic!("expected an existence proof");
    };

    // 2. ACT
    proof.leaf.prefix.push(0x00);
    let result = proof.verify(&ProofSpec::iavl(), &root, b"b", b"value-b");

    // 3. ASSERT
    assert!(matches!(result, Err(ProofError::SpecMismatch(_))));
}

#[test]
fn test_get_proof_picks_the_right_kind_and_survives_scale_round_trip() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);

    // 2. ACT
    let present = snapshot.get_proof(b"l").unwrap();
    let absent = snapshot.get_proof(b"k").unwrap();
    let decoded = CommitmentProof::decode(&mut present.encode().as_slice()).unwrap();

    // 3. ASSERT
    assert!(matches!(present, CommitmentProof::Exist(_)));
    assert!(matches!(absent, CommitmentProof::Nonexist(_)));
    assert_eq!(decoded, present);
}

#[test]
fn test_versioned_proof_targets_old_root() {
    // 1. SETUP
    let (mut tree, _) = saved_tree(&KEYS);
    let v1_root = tree.hash().unwrap();
    tree.set(b"d", b"changed").unwrap();
    tree.remove(b"f").unwrap();
    tree.save_version().unwrap();

    // 2. ACT
    let old = tree.get_versioned_proof(b"f", 1).unwrap();
    let new = tree.get_versioned_proof(b"f", 2).unwrap();

    // 3. ASSERT
    assert!(verify_membership(&ProofSpec::iavl(), &v1_root, &old, b"f", b"value-f"));
    assert!(verify_non_membership(&ProofSpec::iavl(), &tree.hash().unwrap(), &new, b"f"));
}

#[test]
fn test_proofs_on_single_leaf_tree() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&[&b"only"[..]]);
    let root = snapshot.hash().unwrap();

    // 2. ACT
    let exist = snapshot.get_membership_proof(b"only").unwrap();
    let before = snapshot.get_non_membership_proof(b"a").unwrap();
    let after = snapshot.get_non_membership_proof(b"z").unwrap();

    // 3. ASSERT
    assert!(verify_membership(&ProofSpec::iavl(), &root, &exist, b"only", b"value-only"));
    assert!(verify_non_membership(&ProofSpec::iavl(), &root, &before, b"a"));
    assert!(verify_non_membership(&ProofSpec::iavl(), &root, &after, b"z"));
}

// --- Range proofs ---

#[test]
fn test_get_with_proof_present_key() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    // 2. ACT
    let (value, proof) = snapshot.get_with_proof(b"h").unwrap();
    let mut proof = proof.unwrap();

    // 3. ASSERT
    assert_eq!(value.as_deref(), Some(&b"value-h"[..]));
    assert_eq!(proof.verify_item(b"h", b"value-h"), Err(ProofError::RootNotVerified));
    proof.verify(&root).unwrap();
    proof.verify_item(b"h", b"value-h").unwrap();
    assert!(proof.verify_item(b"h", b"wrong").is_err());
    assert_eq!(proof.left_index(), Some(3));
}

#[test]
fn test_get_with_proof_absent_key_proves_absence() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    for missing in [&b"a"[..], b"e", b"k", b"z"] {
        // 2. ACT
        let (value, proof) = snapshot.get_with_proof(missing).unwrap();
        let mut proof = proof.unwrap();

        // 3. ASSERT
        assert!(value.is_none());
        proof.verify(&root).unwrap();
        proof.verify_absence(missing).unwrap();
    }
}

#[test]
fn test_range_proof_covers_requested_span() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    // 2. ACT
    let (keys, values, proof) = snapshot
        .get_range_with_proof(Some(b"c"), Some(b"k"), 0)
        .unwrap();
    let mut proof = proof.unwrap();

    // 3. ASSERT
    assert_eq!(keys, vec![b"d".to_vec(), b"f".to_vec(), b"h".to_vec(), b"j".to_vec()]);
    assert_eq!(values[0], b"value-d");
    // The proof also carries the neighbour on each side.
    assert_eq!(proof.keys().first().map(Vec::as_slice), Some(&b"b"[..]));
    assert_eq!(proof.keys().last().map(Vec::as_slice), Some(&b"l"[..]));
    assert_eq!(proof.compute_root_hash().unwrap(), root);
    proof.verify(&root).unwrap();
    for (key, value) in keys.iter().zip(&values) {
        proof.verify_item(key, value).unwrap();
    }
    proof.verify_absence(b"e").unwrap();
    assert!(proof.verify_absence(b"f").is_err());
}

#[test]
fn test_full_range_proof_reaches_tree_end() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    // 2. ACT
    let (keys, _, proof) = snapshot.get_range_with_proof(None, None, 0).unwrap();
    let mut proof = proof.unwrap();

    // 3. ASSERT
    assert_eq!(keys.len(), KEYS.len());
    assert!(proof.left_path.is_left_most());
    proof.verify(&root).unwrap();
    proof.verify_absence(b"zz").unwrap();
}

#[test]
fn test_range_proof_limit_and_invalid_range() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();

    // 2. ACT
    let (keys, _, proof) = snapshot.get_range_with_proof(Some(b"d"), None, 3).unwrap();
    let bad = snapshot.get_range_with_proof(Some(b"k"), Some(b"c"), 0);

    // 3. ASSERT
    assert_eq!(keys, vec![b"d".to_vec(), b"f".to_vec()]);
    let mut proof = proof.unwrap();
    assert_eq!(proof.leaves.len(), 3);
    proof.verify(&root).unwrap();
    assert!(matches!(bad, Err(iavl_types::error::TreeError::InvalidRange)));
}

#[test]
fn test_range_proof_rejects_tampered_leaf() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();
    let (_, _, proof) = snapshot.get_range_with_proof(Some(b"d"), Some(b"j"), 0).unwrap();
    let mut proof = proof.unwrap();

    // 2. ACT
    proof.leaves[1].value_hash = crate::node::sha256(b"forged");
    let result = proof.verify(&root);

    // 3. ASSERT
    assert!(result.is_err());
}

#[test]
fn test_range_proof_scale_round_trip_drops_verification_state() {
    // 1. SETUP
    let (_tree, snapshot) = saved_tree(&KEYS);
    let root = snapshot.hash().unwrap();
    let (_, proof) = snapshot.get_with_proof(b"e").unwrap();
    let mut proof = proof.unwrap();
    proof.verify(&root).unwrap();

    // 2. ACT
    let mut decoded = RangeProof::decode(&mut proof.encode().as_slice()).unwrap();

    // 3. ASSERT
    assert_eq!(decoded.leaves, proof.leaves);
    assert_eq!(decoded.verify_absence(b"e"), Err(ProofError::RootNotVerified));
    decoded.verify(&root).unwrap();
    decoded.verify_absence(b"e").unwrap();
}

#[test]
fn test_versioned_range_proof_and_adjacency() {
    // 1. SETUP
    let (mut tree, _) = saved_tree(&KEYS);
    tree.set(b"c", b"value-c").unwrap();
    tree.save_version().unwrap();

    // 2. ACT
    let (value, proof) = tree.get_versioned_with_proof(b"c", 1).unwrap();
    let (_, _, left) = tree.get_versioned_range_with_proof(Some(b"d"), None, 1, 2).unwrap();
    let (_, _, right) = tree.get_versioned_range_with_proof(Some(b"f"), None, 1, 2).unwrap();

    // 3. ASSERT
    assert!(value.is_none());
    let mut proof = proof.unwrap();
    proof.verify(&tree.get_immutable(1).unwrap().hash().unwrap()).unwrap();
    proof.verify_absence(b"c").unwrap();
    let (left, right) = (left.unwrap(), right.unwrap());
    assert!(left.left_path.is_left_adjacent_to(&right.left_path));
    assert!(!right.left_path.is_left_adjacent_to(&left.left_path));
}
