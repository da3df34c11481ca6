// Path: crates/state/src/iterator.rs
//! Iterators over tree nodes, the persisted fast index, and the fast index overlaid with
//! a mutable tree's unsaved changes.

use crate::fast_node::FastNode;
use crate::node::{Node, NodeId};
use crate::nodedb::{NodeDb, VersionReader};
use iavl_storage::KvIter;
use iavl_types::error::TreeError;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::iter::Peekable;
use std::sync::Arc;

/// An owned key-value pair.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A boxed iterator over key-value pairs in key order.
pub type TreeIter = Box<dyn Iterator<Item = Result<KvPair, TreeError>> + Send>;

/// Pre-order walk over persisted nodes that can skip whole subtrees.
pub(crate) struct NodeIterator<'a> {
    ndb: &'a NodeDb,
    stack: Vec<Arc<Node>>,
}

impl<'a> NodeIterator<'a> {
    pub(crate) fn new(ndb: &'a NodeDb, root: Option<NodeId>) -> Result<Self, TreeError> {
        let stack = match root {
            Some(id) => vec![ndb.get_node(&id)?],
            None => Vec::new(),
        };
        Ok(Self { ndb, stack })
    }

    pub(crate) fn peek(&self) -> Option<&Arc<Node>> {
        self.stack.last()
    }

    /// Moves past the current node; with `skip` its subtree is not visited.
    pub(crate) fn advance(&mut self, skip: bool) -> Result<(), TreeError> {
        let Some(node) = self.stack.pop() else {
            return Ok(());
        };
        if skip || node.is_leaf() {
            return Ok(());
        }
        self.stack.push(node.right(self.ndb)?);
        self.stack.push(node.left(self.ndb)?);
        Ok(())
    }
}

/// Ordered traversal of a (possibly unsaved) tree restricted to a key range.
///
/// Nodes are expanded lazily: a node pushed as *delayed* has its children pushed only
/// when it is popped, so only the paths touching the range are loaded.
pub(crate) struct Traversal {
    ndb: Arc<NodeDb>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    ascending: bool,
    inclusive: bool,
    post_order: bool,
    delayed: Vec<(Arc<Node>, bool)>,
}

impl Traversal {
    pub(crate) fn new(
        ndb: Arc<NodeDb>,
        root: Option<Arc<Node>>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        inclusive: bool,
        post_order: bool,
    ) -> Self {
        Self {
            ndb,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            ascending,
            inclusive,
            post_order,
            delayed: root.into_iter().map(|n| (n, true)).collect(),
        }
    }

    pub(crate) fn next_node(&mut self) -> Result<Option<Arc<Node>>, TreeError> {
        while let Some((node, delayed)) = self.delayed.pop() {
            if !delayed {
                return Ok(Some(node));
            }
            let key = node.key.as_slice();
            let after_start = self.start.as_deref().map_or(true, |s| s < key);
            let start_or_after = after_start || self.start.as_deref() == Some(key);
            let before_end = match self.end.as_deref() {
                None => true,
                Some(e) => key < e || (self.inclusive && key == e),
            };
            let in_range = start_or_after && before_end;

            if self.post_order && (!node.is_leaf() || in_range) {
                self.delayed.push((node.clone(), false));
            }
            if !node.is_leaf() {
                if self.ascending {
                    if before_end {
                        self.delayed.push((node.right(&self.ndb)?, true));
                    }
                    if after_start {
                        self.delayed.push((node.left(&self.ndb)?, true));
                    }
                } else {
                    if after_start {
                        self.delayed.push((node.left(&self.ndb)?, true));
                    }
                    if before_end {
                        self.delayed.push((node.right(&self.ndb)?, true));
                    }
                }
            }
            if !self.post_order && (!node.is_leaf() || in_range) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

/// Iterates the leaves of a tree in key order.
pub struct TreeIterator {
    traversal: Traversal,
    done: bool,
    // Keeps the iterated version from being pruned.
    _reader: Option<Arc<VersionReader>>,
}

impl TreeIterator {
    pub(crate) fn new(traversal: Traversal, reader: Option<Arc<VersionReader>>) -> Self {
        Self {
            traversal,
            done: false,
            _reader: reader,
        }
    }
}

impl Iterator for TreeIterator {
    type Item = Result<KvPair, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.traversal.next_node() {
                Ok(Some(node)) if node.is_leaf() => {
                    return Some(Ok((node.key.clone(), node.value.clone().unwrap_or_default())));
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Iterates the persisted fast index, yielding the latest value of each key.
pub struct FastIterator {
    inner: KvIter,
}

impl FastIterator {
    pub(crate) fn new(
        ndb: &NodeDb,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<Self, TreeError> {
        Ok(Self {
            inner: ndb.fast_index_iter(start, end, ascending)?,
        })
    }
}

impl Iterator for FastIterator {
    type Item = Result<KvPair, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(item.map_err(TreeError::from).and_then(|(key, value)| {
            let key = key.get(1..).unwrap_or_default().to_vec();
            let node = FastNode::decode(key, &value)?;
            Ok((node.key, node.value))
        }))
    }
}

/// Merges the persisted fast index with a mutable tree's unsaved additions and removals.
/// Unsaved additions win over persisted entries with the same key.
pub struct UnsavedFastIterator {
    disk: Peekable<FastIterator>,
    additions: Peekable<std::vec::IntoIter<KvPair>>,
    removals: BTreeSet<Vec<u8>>,
    ascending: bool,
}

impl UnsavedFastIterator {
    pub(crate) fn new(
        disk: FastIterator,
        mut additions: Vec<KvPair>,
        removals: BTreeSet<Vec<u8>>,
        ascending: bool,
    ) -> Self {
        if !ascending {
            additions.reverse();
        }
        Self {
            disk: disk.peekable(),
            additions: additions.into_iter().peekable(),
            removals,
            ascending,
        }
    }
}

impl Iterator for UnsavedFastIterator {
    type Item = Result<KvPair, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let disk_key = match self.disk.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => return self.disk.next(),
                None => None,
            };
            if let Some(key) = &disk_key {
                if self.removals.contains(key) {
                    self.disk.next();
                    continue;
                }
            }
            return match (disk_key, self.additions.peek()) {
                (Some(disk_key), Some((add_key, _))) => {
                    let order = disk_key.as_slice().cmp(add_key.as_slice());
                    let unsaved_first = match order {
                        Ordering::Equal => true,
                        Ordering::Greater => self.ascending,
                        Ordering::Less => !self.ascending,
                    };
                    if unsaved_first {
                        if order == Ordering::Equal {
                            self.disk.next();
                        }
                        self.additions.next().map(Ok)
                    } else {
                        self.disk.next()
                    }
                }
                (Some(_), None) => self.disk.next(),
                (None, Some(_)) => self.additions.next().map(Ok),
                (None, None) => None,
            };
        }
    }
}
