// Path: crates/state/src/diff.rs
//! Change sets between consecutive versions, computed without walking shared subtrees.

use crate::immutable_tree::ImmutableTree;
use crate::iterator::NodeIterator;
use crate::mutable_tree::MutableTree;
use crate::node::{Node, NodeId};
use crate::nodedb::NodeDb;
use iavl_types::error::TreeError;
use parity_scale_codec::{Decode, Encode};
use std::collections::VecDeque;
use std::sync::Arc;

/// One write of a change set: an upsert, or a delete when `delete` is set.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ChangePair {
    pub delete: bool,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ChangePair {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            delete: false,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            delete: true,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

/// The net writes turning one version into the next, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct ChangeSet {
    pub pairs: Vec<ChangePair>,
}

fn node_version(node: &Node) -> i64 {
    node.node_key().map_or(0, |nk| nk.version)
}

/// Matches leaves orphaned from the previous version against leaves new in the current
/// one. Both streams arrive in key order.
struct Extractor<'a, F> {
    cur: NodeIterator<'a>,
    prev_version: i64,
    shared: Option<Arc<Node>>,
    new_leaves: VecDeque<Arc<Node>>,
    receiver: F,
}

impl<'a, F> Extractor<'a, F>
where
    F: FnMut(ChangePair) -> Result<(), TreeError>,
{
    fn emit_insert(&mut self, node: &Node) -> Result<(), TreeError> {
        (self.receiver)(ChangePair::set(
            node.key.clone(),
            node.value.clone().unwrap_or_default(),
        ))
    }

    fn consume_new_leaves(&mut self) -> Result<(), TreeError> {
        while let Some(leaf) = self.new_leaves.pop_front() {
            self.emit_insert(&leaf)?;
        }
        Ok(())
    }

    /// Walks the current version up to its next subtree shared with the previous one,
    /// collecting new leaves on the way.
    fn advance_shared(&mut self) -> Result<(), TreeError> {
        self.consume_new_leaves()?;
        self.shared = None;
        while let Some(node) = self.cur.peek().cloned() {
            let shared = node_version(&node) <= self.prev_version;
            self.cur.advance(shared)?;
            if shared {
                self.shared = Some(node);
                break;
            }
            if node.is_leaf() {
                self.new_leaves.push_back(node);
            }
        }
        Ok(())
    }

    fn add_orphaned_leaf(&mut self, orphan: &Node) -> Result<(), TreeError> {
        while let Some(leaf) = self.new_leaves.front().cloned() {
            match orphan.key.cmp(&leaf.key) {
                std::cmp::Ordering::Greater => {
                    self.new_leaves.pop_front();
                    self.emit_insert(&leaf)?;
                }
                std::cmp::Ordering::Less => break,
                std::cmp::Ordering::Equal => {
                    self.new_leaves.pop_front();
                    return self.emit_insert(&leaf);
                }
            }
        }
        (self.receiver)(ChangePair::delete(orphan.key.clone()))
    }
}

impl NodeDb {
    /// Streams the writes that turn the tree at `prev_root` (saved as `prev_version`) into
    /// the tree at `root`.
    pub(crate) fn extract_state_changes(
        &self,
        prev_version: i64,
        prev_root: Option<NodeId>,
        root: Option<NodeId>,
        receiver: impl FnMut(ChangePair) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        let mut prev = NodeIterator::new(self, prev_root)?;
        let mut ex = Extractor {
            cur: NodeIterator::new(self, root)?,
            prev_version,
            shared: None,
            new_leaves: VecDeque::new(),
            receiver,
        };
        ex.advance_shared()?;

        while let Some(node) = prev.peek().cloned() {
            let shared = ex
                .shared
                .as_ref()
                .map_or(false, |s| Arc::ptr_eq(s, &node) || s.hash() == node.hash());
            prev.advance(shared)?;
            if shared {
                ex.advance_shared()?;
            } else if node.is_leaf() {
                ex.add_orphaned_leaf(&node)?;
            }
        }

        ex.consume_new_leaves()?;
        while let Some(node) = ex.cur.peek().cloned() {
            let shared = node_version(&node) <= prev_version;
            ex.cur.advance(shared)?;
            if !shared && node.is_leaf() {
                ex.emit_insert(&node)?;
            }
        }
        Ok(())
    }

    /// Calls `f` with the change set of every version in `[start_version, end_version]`,
    /// clamped to the retained versions.
    pub(crate) fn traverse_state_changes(
        &self,
        start_version: i64,
        end_version: i64,
        mut f: impl FnMut(i64, &ChangeSet) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        let start = start_version.max(self.first_version()?);
        let end = end_version.min(self.latest_version()?);

        let mut prev_version = start - 1;
        let mut prev_root = match self.get_root(prev_version) {
            Ok(root) => root,
            Err(TreeError::VersionDoesNotExist) => None,
            Err(e) => return Err(e),
        };
        for version in start..=end {
            let root = self.get_root(version)?;
            let mut change_set = ChangeSet::default();
            self.extract_state_changes(prev_version, prev_root, root.clone(), |pair| {
                change_set.pairs.push(pair);
                Ok(())
            })?;
            f(version, &change_set)?;
            prev_version = version;
            prev_root = root;
        }
        Ok(())
    }
}

impl ImmutableTree {
    /// See [`MutableTree::traverse_state_changes`].
    pub fn traverse_state_changes(
        &self,
        start_version: i64,
        end_version: i64,
        f: impl FnMut(i64, &ChangeSet) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        self.ndb.traverse_state_changes(start_version, end_version, f)
    }
}

impl MutableTree {
    /// Calls `f` with the change set of every saved version in `[start_version,
    /// end_version]`. Replaying them with [`MutableTree::save_change_set`] on a tree at
    /// `start_version - 1` reproduces the same versions.
    pub fn traverse_state_changes(
        &self,
        start_version: i64,
        end_version: i64,
        f: impl FnMut(i64, &ChangeSet) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        self.node_db()
            .traverse_state_changes(start_version, end_version, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iavl_storage::MemDb;
    use iavl_types::config::TreeOptions;

    fn tree() -> MutableTree {
        MutableTree::new(Arc::new(MemDb::new()), TreeOptions::default())
    }

    fn collect(tree: &MutableTree, from: i64, to: i64) -> Vec<(i64, ChangeSet)> {
        let mut out = Vec::new();
        tree.traverse_state_changes(from, to, |version, cs| {
            out.push((version, cs.clone()));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_delete_and_insert_between_versions() {
        // 1. SETUP
        let mut tree = tree();
        tree.set(b"a", b"1").unwrap();
        tree.set(b"b", b"2").unwrap();
        tree.save_version().unwrap();
        tree.remove(b"b").unwrap();
        tree.set(b"c", b"3").unwrap();
        tree.save_version().unwrap();

        // 2. ACT
        let changes = collect(&tree, 2, 2);

        // 3. ASSERT
        assert_eq!(changes.len(), 1);
        let (version, cs) = &changes[0];
        assert_eq!(*version, 2);
        assert_eq!(
            cs.pairs,
            vec![ChangePair::delete(b"b".to_vec()), ChangePair::set(b"c".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn test_first_version_is_all_inserts_and_update_is_reported() {
        // 1. SETUP
        let mut tree = tree();
        tree.set(b"k1", b"v1").unwrap();
        tree.set(b"k2", b"v2").unwrap();
        tree.save_version().unwrap();
        tree.set(b"k2", b"v2b").unwrap();
        tree.save_version().unwrap();

        // 2. ACT
        let changes = collect(&tree, 0, 10);

        // 3. ASSERT
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0].1.pairs,
            vec![
                ChangePair::set(b"k1".to_vec(), b"v1".to_vec()),
                ChangePair::set(b"k2".to_vec(), b"v2".to_vec()),
            ]
        );
        assert_eq!(changes[1].1.pairs, vec![ChangePair::set(b"k2".to_vec(), b"v2b".to_vec())]);
    }

    #[test]
    fn test_replaying_change_sets_reproduces_hashes() {
        // 1. SETUP
        let mut source = tree();
        let mut hashes = Vec::new();
        for round in 0..5u8 {
            for i in 0..20u8 {
                let key = [b'k', i];
                if (i + round) % 3 == 0 {
                    source.remove(&key).unwrap();
                } else {
                    source.set(&key, &[round, i]).unwrap();
                }
            }
            hashes.push(source.save_version().unwrap().0);
        }

        // 2. ACT
        let mut replica = tree();
        let changes = collect(&source, 1, 5);
        for (_, cs) in &changes {
            replica.save_change_set(cs).unwrap();
        }

        // 3. ASSERT
        assert_eq!(replica.latest_version().unwrap(), 5);
        assert_eq!(replica.hash().unwrap(), hashes[4]);
        let cs = &changes[0].1;
        let encoded = cs.encode();
        assert_eq!(ChangeSet::decode(&mut encoded.as_slice()).unwrap(), *cs);
    }
}
