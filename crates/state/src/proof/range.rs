// Path: crates/state/src/proof/range.rs
//! Range proofs in the hash-keyed format: a path to the left-most proven leaf, the
//! inner nodes leading to each following leaf, and the leaves themselves.
//!
//! The right boundary needs no path of its own; it is implied by the leaves and inner
//! paths, which together must hash back to the root.

use crate::immutable_tree::ImmutableTree;
use crate::iterator::Traversal;
use crate::mutable_tree::MutableTree;
use crate::node::encode::{put_bytes, put_varint};
use crate::node::{sha256, Hash, Node};
use iavl_types::error::{ProofError, TreeError};
use parity_scale_codec::{Decode, Encode};
use std::sync::Arc;

/// An inner node on a proof path. Exactly one of `left` and `right` is set: the hash of
/// the sibling not on the path.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProofInnerNode {
    pub height: i8,
    pub size: i64,
    pub version: i64,
    pub left: Option<Hash>,
    pub right: Option<Hash>,
}

impl ProofInnerNode {
    fn hash(&self, child: &Hash) -> Result<Hash, ProofError> {
        let mut buf = Vec::with_capacity(12 + 2 * 33);
        put_varint(&mut buf, i64::from(self.height));
        put_varint(&mut buf, self.size);
        put_varint(&mut buf, self.version);
        match (&self.left, &self.right) {
            (None, Some(right)) => {
                put_bytes(&mut buf, child);
                put_bytes(&mut buf, right);
            }
            (Some(left), None) => {
                put_bytes(&mut buf, left);
                put_bytes(&mut buf, child);
            }
            _ => {
                return Err(ProofError::InvalidRangeProof(
                    "inner node must have exactly one sibling".into(),
                ))
            }
        }
        Ok(sha256(&buf))
    }
}

/// A proven leaf. The value is carried as its hash.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProofLeafNode {
    pub key: Vec<u8>,
    pub value_hash: Hash,
    pub version: i64,
}

impl ProofLeafNode {
    fn from_node(node: &Node, working_version: i64) -> Self {
        Self {
            key: node.key.clone(),
            value_hash: sha256(node.value.as_deref().unwrap_or_default()),
            version: node.effective_version(working_version),
        }
    }

    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(6 + self.key.len() + 33);
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, self.version);
        put_bytes(&mut buf, &self.key);
        put_bytes(&mut buf, &self.value_hash);
        sha256(&buf)
    }
}

/// Inner nodes from a subtree root down to a leaf, root first.
#[derive(Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct PathToLeaf(pub Vec<ProofInnerNode>);

impl PathToLeaf {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the path only ever descends left.
    pub fn is_left_most(&self) -> bool {
        self.0.iter().all(|n| n.left.is_none())
    }

    /// True when the path only ever descends right.
    pub fn is_right_most(&self) -> bool {
        is_right_most(&self.0)
    }

    /// True when the leaf at the end of `self` is immediately left of the leaf at the end
    /// of `other` in a tree with the same root.
    pub fn is_left_adjacent_to(&self, other: &PathToLeaf) -> bool {
        let shared = self
            .0
            .iter()
            .zip(&other.0)
            .take_while(|(a, b)| a.left == b.left && a.right == b.right)
            .count();
        let splits = matches!(
            (self.0.get(shared), other.0.get(shared)),
            (Some(l), Some(r)) if l.right.is_some() && r.left.is_some()
        );
        if !splits {
            return false;
        }
        // Below the split the left leaf hugs it from the left, the right leaf from the right.
        match (self.0.get(shared + 1..), other.0.get(shared + 1..)) {
            (Some(left), Some(right)) => {
                is_right_most(left) && right.iter().all(|n| n.left.is_none())
            }
            _ => false,
        }
    }

    /// The index of the leaf this path leads to, or `None` when a node carries both or
    /// neither sibling.
    pub fn index(&self) -> Option<i64> {
        let mut idx = 0i64;
        for (i, node) in self.0.iter().enumerate() {
            match (&node.left, &node.right) {
                (None, Some(_)) => {}
                (Some(_), None) => {
                    // Everything in the left sibling precedes the leaf.
                    let below = self.0.get(i + 1).map_or(1, |next| next.size);
                    idx += node.size - below;
                }
                _ => return None,
            }
        }
        Some(idx)
    }
}

fn is_right_most(path: &[ProofInnerNode]) -> bool {
    path.iter().all(|n| n.right.is_none())
}

fn compute_path_root(path: &[ProofInnerNode], leaf_hash: Hash) -> Result<Hash, ProofError> {
    path.iter().rev().try_fold(leaf_hash, |hash, node| node.hash(&hash))
}

/// Proves a contiguous run of leaves, and through them the presence and absence of keys
/// in the run's span.
#[derive(Encode, Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeProof {
    pub left_path: PathToLeaf,
    /// One path per leaf after the first, each hanging off the previous paths.
    pub inner_nodes: Vec<PathToLeaf>,
    pub leaves: Vec<ProofLeafNode>,
    #[codec(skip)]
    root_hash: Option<Hash>,
    #[codec(skip)]
    root_verified: bool,
    #[codec(skip)]
    tree_end: bool,
}

/// Walks the leaves left to right, consuming one inner path for every left turn that
/// leads to more leaves.
struct RootComputer<'a> {
    leaves: &'a [ProofLeafNode],
    inners: &'a [PathToLeaf],
}

impl RootComputer<'_> {
    /// Returns `(subtree hash, last leaf ends the tree, all leaves consumed)`.
    fn compute(
        &mut self,
        path: &[ProofInnerNode],
        rightmost: bool,
    ) -> Result<(Hash, bool, bool), ProofError> {
        let leaves = self.leaves;
        let Some((leaf, rest)) = leaves.split_first() else {
            return Err(ProofError::InvalidRangeProof("ran out of leaves".into()));
        };
        self.leaves = rest;
        let hash = compute_path_root(path, leaf.hash())?;
        if self.leaves.is_empty() {
            return Ok((hash, rightmost && is_right_most(path), true));
        }

        for (i, node) in path.iter().enumerate().rev() {
            let Some(right) = node.right else {
                continue;
            };
            let inners = self.inners;
            let Some((inner, rest)) = inners.split_first() else {
                return Err(ProofError::InvalidRangeProof("ran out of inner paths".into()));
            };
            self.inners = rest;
            let above = path.get(..i).unwrap_or_default();
            let (derived, tree_end, done) =
                self.compute(&inner.0, rightmost && is_right_most(above))?;
            if derived != right {
                return Err(ProofError::InvalidRangeProof(format!(
                    "intermediate root hash {} doesn't match, got {}",
                    hex::encode(right),
                    hex::encode(derived)
                )));
            }
            if done {
                return Ok((hash, tree_end, true));
            }
        }
        Ok((hash, false, false))
    }
}

impl RangeProof {
    /// All keys carried by the proof. These may extend past the queried range by one leaf
    /// on either side, as absence proofs need the neighbours.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.leaves.iter().map(|l| l.key.clone()).collect()
    }

    /// Index of the first leaf within the whole tree.
    pub fn left_index(&self) -> Option<i64> {
        self.left_path.index()
    }

    /// Recomputes the root the proof commits to. Does not verify it.
    pub fn compute_root_hash(&self) -> Result<Hash, ProofError> {
        self.compute().map(|(root, _)| root)
    }

    fn compute(&self) -> Result<(Hash, bool), ProofError> {
        if self.leaves.is_empty() {
            return Err(ProofError::InvalidRangeProof("no leaves".into()));
        }
        if self.inner_nodes.len() + 1 != self.leaves.len() {
            return Err(ProofError::InvalidRangeProof(
                "inner paths vs leaves length mismatch, leaves should be one more".into(),
            ));
        }
        let mut computer = RootComputer {
            leaves: &self.leaves,
            inners: &self.inner_nodes,
        };
        let (root, tree_end, done) = computer.compute(&self.left_path.0, true)?;
        if !done {
            return Err(ProofError::InvalidRangeProof("left over leaves".into()));
        }
        Ok((root, tree_end))
    }

    /// Checks the proof against a trusted root. Must succeed before the item and absence
    /// checks can be used.
    pub fn verify(&mut self, root: &Hash) -> Result<(), ProofError> {
        let computed = match self.root_hash {
            Some(hash) => hash,
            None => {
                let (hash, tree_end) = self.compute()?;
                self.root_hash = Some(hash);
                self.tree_end = tree_end;
                hash
            }
        };
        if computed != *root {
            return Err(ProofError::RootMismatch);
        }
        self.root_verified = true;
        Ok(())
    }

    /// Checks that the verified proof contains `key` with `value`.
    pub fn verify_item(&self, key: &[u8], value: &[u8]) -> Result<(), ProofError> {
        if !self.root_verified {
            return Err(ProofError::RootNotVerified);
        }
        let leaf = self
            .leaves
            .binary_search_by(|l| l.key.as_slice().cmp(key))
            .ok()
            .and_then(|i| self.leaves.get(i))
            .ok_or_else(|| ProofError::InvalidRangeProof("leaf key not found in proof".into()))?;
        if leaf.value_hash != sha256(value) {
            return Err(ProofError::InvalidRangeProof("leaf value hash not same".into()));
        }
        Ok(())
    }

    /// Checks that the verified proof shows `key` absent from the tree.
    pub fn verify_absence(&self, key: &[u8]) -> Result<(), ProofError> {
        if !self.root_verified {
            return Err(ProofError::RootNotVerified);
        }
        let invalid = |msg: String| Err(ProofError::InvalidRangeProof(msg));
        let Some(first) = self.leaves.first() else {
            return invalid("no leaves".into());
        };
        match key.cmp(first.key.as_slice()) {
            std::cmp::Ordering::Less => {
                if self.left_path.is_left_most() {
                    return Ok(());
                }
                return invalid("absence not proved by left path".into());
            }
            std::cmp::Ordering::Equal => return invalid("absence disproved via item #0".into()),
            std::cmp::Ordering::Greater => {}
        }
        if self.left_path.is_empty() || self.left_path.is_right_most() {
            return Ok(());
        }
        for (i, leaf) in self.leaves.iter().enumerate().skip(1) {
            match key.cmp(leaf.key.as_slice()) {
                std::cmp::Ordering::Less => return Ok(()),
                std::cmp::Ordering::Equal => {
                    return invalid(format!("absence disproved via item #{i}"))
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        // Past the last leaf, which must then be the last leaf of the tree.
        if self.tree_end {
            return Ok(());
        }
        if self.leaves.len() < 2 {
            return invalid("absence not proved by right leaf (need another leaf?)".into());
        }
        invalid("absence not proved by right leaf".into())
    }
}

/// The smallest key sorting strictly after `key`.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

fn same_node(a: &Arc<Node>, b: &Arc<Node>) -> bool {
    Arc::ptr_eq(a, b) || matches!((a.id(), b.id()), (Some(x), Some(y)) if x == y)
}

/// Keys and values found in the queried range, with the proof covering them.
pub type RangeWithProof = (Vec<Vec<u8>>, Vec<Vec<u8>>, Option<RangeProof>);

impl ImmutableTree {
    /// Descends towards `key` (the left-most leaf for `None`). Ends at `key`'s leaf when
    /// present, otherwise at the previous leaf, or the first leaf when `key` sorts first.
    fn path_to_leaf(
        &self,
        root: &Arc<Node>,
        key: Option<&[u8]>,
    ) -> Result<(PathToLeaf, Arc<Node>, Vec<Arc<Node>>), TreeError> {
        let mut path = Vec::new();
        let mut visited = Vec::new();
        let mut node = root.clone();
        while !node.is_leaf() {
            let left = node.left(&self.ndb)?;
            let right = node.right(&self.ndb)?;
            let version = node.effective_version(self.unsaved_version);
            let go_left = key.map_or(true, |k| k < node.key.as_slice());
            let next = if go_left {
                path.push(ProofInnerNode {
                    height: node.height,
                    size: node.size,
                    version,
                    left: None,
                    right: Some(right.hash_with(self.unsaved_version)?),
                });
                left
            } else {
                path.push(ProofInnerNode {
                    height: node.height,
                    size: node.size,
                    version,
                    left: Some(left.hash_with(self.unsaved_version)?),
                    right: None,
                });
                right
            };
            visited.push(std::mem::replace(&mut node, next));
        }
        Ok((PathToLeaf(path), node, visited))
    }

    /// Proves up to `limit` leaves (0 for no limit) from `start` to `end` exclusive, plus
    /// the neighbours needed to prove the range's boundaries.
    pub fn get_range_with_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<RangeWithProof, TreeError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(TreeError::InvalidRange);
            }
        }
        let Some(root) = &self.root else {
            return Ok((Vec::new(), Vec::new(), None));
        };
        root.hash_with(self.unsaved_version)?;

        let (left_path, left, left_nodes) = self.path_to_leaf(root, start)?;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let start_ok = start.map_or(true, |s| s <= left.key.as_slice());
        let end_ok = end.map_or(true, |e| left.key.as_slice() < e);
        if start_ok && end_ok {
            keys.push(left.key.clone());
            values.push(left.value.clone().unwrap_or_default());
        }
        let mut leaves = vec![ProofLeafNode::from_node(&left, self.unsaved_version)];

        let after_left = successor(&left.key);
        let stop = limit == 1 || end.map_or(false, |e| after_left.as_slice() >= e);
        if stop {
            let proof = RangeProof {
                left_path,
                leaves,
                ..RangeProof::default()
            };
            return Ok((keys, values, Some(proof)));
        }

        let mut traversal = Traversal::new(
            self.ndb.clone(),
            Some(root.clone()),
            Some(&after_left),
            None,
            true,
            false,
            false,
        );
        let mut inner_nodes = Vec::new();
        let mut current = Vec::new();
        // Position along the left path while the traversal still retraces it.
        let mut retracing = Some(0usize);
        while let Some(node) = traversal.next_node()? {
            if let Some(depth) = retracing {
                retracing = left_nodes
                    .get(depth)
                    .filter(|n| same_node(n, &node))
                    .map(|_| depth + 1);
            }

            if node.is_leaf() {
                inner_nodes.push(PathToLeaf(std::mem::take(&mut current)));
                leaves.push(ProofLeafNode::from_node(&node, self.unsaved_version));
                if limit > 0 && limit <= leaves.len() {
                    break;
                }
                if end.map_or(false, |e| node.key.as_slice() >= e) {
                    break;
                }
                keys.push(node.key.clone());
                values.push(node.value.clone().unwrap_or_default());
                if end.map_or(false, |e| successor(&node.key).as_slice() >= e) {
                    break;
                }
            } else if retracing.is_none() {
                current.push(ProofInnerNode {
                    height: node.height,
                    size: node.size,
                    version: node.effective_version(self.unsaved_version),
                    left: None,
                    right: Some(node.right(&self.ndb)?.hash_with(self.unsaved_version)?),
                });
            }
        }

        let proof = RangeProof {
            left_path,
            inner_nodes,
            leaves,
            ..RangeProof::default()
        };
        Ok((keys, values, Some(proof)))
    }

    /// The value of `key` (if any) with a range proof of its presence or absence.
    pub fn get_with_proof(
        &self,
        key: &[u8],
    ) -> Result<(Option<Vec<u8>>, Option<RangeProof>), TreeError> {
        let (_, values, proof) = self.get_range_with_proof(Some(key), Some(&successor(key)), 2)?;
        let found = proof
            .as_ref()
            .and_then(|p| p.leaves.first())
            .map_or(false, |leaf| leaf.key == key);
        let value = if found { values.into_iter().next() } else { None };
        Ok((value, proof))
    }
}

impl MutableTree {
    /// [`ImmutableTree::get_with_proof`] against the saved `version`.
    pub fn get_versioned_with_proof(
        &self,
        key: &[u8],
        version: i64,
    ) -> Result<(Option<Vec<u8>>, Option<RangeProof>), TreeError> {
        self.get_immutable(version)?.get_with_proof(key)
    }

    /// [`ImmutableTree::get_range_with_proof`] against the saved `version`.
    pub fn get_versioned_range_with_proof(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
        version: i64,
    ) -> Result<RangeWithProof, TreeError> {
        self.get_immutable(version)?.get_range_with_proof(start, end, limit)
    }
}
