// Path: crates/state/src/immutable_tree.rs
//! A read-only view of the tree at one version.

use crate::iterator::{FastIterator, Traversal, TreeIter, TreeIterator};
use crate::node::{empty_hash, Hash, Node};
use crate::nodedb::{NodeDb, VersionReader};
use iavl_types::error::TreeError;
use std::fmt;
use std::sync::Arc;

/// A tree bound to a root node and a node database. Cheap to clone.
///
/// Trees obtained from a saved version hold a reader on that version, so pruning
/// refuses to delete it while any clone (or iterator) is alive.
#[derive(Clone)]
pub struct ImmutableTree {
    pub(crate) root: Option<Arc<Node>>,
    pub(crate) ndb: Arc<NodeDb>,
    pub(crate) version: i64,
    /// Version that nodes without a node key hash with: the version they will be saved as.
    pub(crate) unsaved_version: i64,
    pub(crate) skip_fast_storage_upgrade: bool,
    pub(crate) reader: Option<Arc<VersionReader>>,
}

impl fmt::Debug for ImmutableTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImmutableTree")
            .field("version", &self.version)
            .field("size", &self.size())
            .field("root_hash", &self.root.as_ref().and_then(|r| r.hash().map(hex::encode)))
            .finish()
    }
}

impl ImmutableTree {
    /// An empty tree at version 0.
    pub fn new(ndb: Arc<NodeDb>, skip_fast_storage_upgrade: bool) -> Self {
        Self {
            root: None,
            ndb,
            version: 0,
            unsaved_version: 1,
            skip_fast_storage_upgrade,
            reader: None,
        }
    }

    /// Opens the saved `version`, registering a reader on it.
    pub(crate) fn load(
        ndb: Arc<NodeDb>,
        version: i64,
        skip_fast_storage_upgrade: bool,
    ) -> Result<Self, TreeError> {
        let reader = Arc::new(ndb.reader(version));
        let mut tree = Self::open(ndb, version, skip_fast_storage_upgrade)?;
        tree.reader = Some(reader);
        Ok(tree)
    }

    /// Opens the saved `version` without registering a reader. Used for the mutable
    /// tree's own working and last-saved views.
    pub(crate) fn open(
        ndb: Arc<NodeDb>,
        version: i64,
        skip_fast_storage_upgrade: bool,
    ) -> Result<Self, TreeError> {
        let root = ndb
            .get_root(version)?
            .map(|id| ndb.get_node(&id))
            .transpose()?;
        Ok(Self {
            root,
            ndb,
            version,
            unsaved_version: version.saturating_add(1),
            skip_fast_storage_upgrade,
            reader: None,
        })
    }

    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    /// Number of leaves.
    pub fn size(&self) -> i64 {
        self.root.as_ref().map_or(0, |r| r.size)
    }

    pub fn height(&self) -> i8 {
        self.root.as_ref().map_or(0, |r| r.height)
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Root hash; the hash of the empty string for an empty tree.
    pub fn hash(&self) -> Result<Hash, TreeError> {
        match &self.root {
            Some(root) => root.hash_with(self.unsaved_version),
            None => Ok(empty_hash()),
        }
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        match &self.root {
            Some(root) => root.has(&self.ndb, key),
            None => Ok(false),
        }
    }

    /// Looks `key` up, through the fast index when it reflects this version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        if !self.skip_fast_storage_upgrade {
            match self.ndb.get_fast_node(key) {
                Err(_) => return Ok(root.get(&self.ndb, key)?.1),
                Ok(None) => {
                    // The fast index mirrors the latest state exactly.
                    if self.version == self.ndb.latest_version()? {
                        return Ok(None);
                    }
                    return Ok(root.get(&self.ndb, key)?.1);
                }
                Ok(Some(fast)) if fast.version_last_updated_at <= self.version => {
                    return Ok(Some(fast.value));
                }
                Ok(Some(_)) => {}
            }
        }
        Ok(root.get(&self.ndb, key)?.1)
    }

    /// Returns the key's index (or insertion index when absent) and its value.
    pub fn get_with_index(&self, key: &[u8]) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        match &self.root {
            Some(root) => root.get(&self.ndb, key),
            None => Ok((0, None)),
        }
    }

    pub fn get_by_index(&self, index: i64) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        match &self.root {
            Some(root) if index >= 0 => root.get_by_index(&self.ndb, index),
            _ => Ok(None),
        }
    }

    /// True when this is the latest version and the fast index has been built.
    pub fn is_fast_cache_enabled(&self) -> Result<bool, TreeError> {
        Ok(self.version == self.ndb.latest_version()? && self.ndb.has_upgraded_to_fast_storage())
    }

    /// Iterates `[start, end)` in the requested order.
    pub fn iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<TreeIter, TreeError> {
        if !self.skip_fast_storage_upgrade && self.is_fast_cache_enabled()? {
            return Ok(Box::new(FastIterator::new(&self.ndb, start, end, ascending)?));
        }
        Ok(Box::new(self.tree_iterator(start, end, ascending)))
    }

    /// Iterates the tree itself, never the fast index.
    pub(crate) fn tree_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> TreeIterator {
        let traversal = Traversal::new(
            self.ndb.clone(),
            self.root.clone(),
            start,
            end,
            ascending,
            false,
            false,
        );
        TreeIterator::new(traversal, self.reader.clone())
    }

    /// Calls `f` for every pair in ascending order until it returns true. Returns
    /// whether iteration was stopped early.
    pub fn iterate(
        &self,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<bool, TreeError> {
        if self.root.is_none() {
            return Ok(false);
        }
        for item in self.iterator(None, None, true)? {
            let (key, value) = item?;
            if f(&key, &value) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Like [`ImmutableTree::iterate`] over `[start, end)`, walking the tree directly.
    pub fn iterate_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        mut f: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<bool, TreeError> {
        self.traverse_leaves(start, end, ascending, false, |node| {
            f(&node.key, node.value.as_deref().unwrap_or_default())
        })
    }

    /// Iterates `[start, end]`, also passing the version that wrote each leaf.
    pub fn iterate_range_inclusive(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        mut f: impl FnMut(&[u8], &[u8], i64) -> bool,
    ) -> Result<bool, TreeError> {
        let version = self.unsaved_version;
        self.traverse_leaves(start, end, ascending, true, |node| {
            f(
                &node.key,
                node.value.as_deref().unwrap_or_default(),
                node.effective_version(version),
            )
        })
    }

    fn traverse_leaves(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        inclusive: bool,
        mut f: impl FnMut(&Node) -> bool,
    ) -> Result<bool, TreeError> {
        let mut traversal = Traversal::new(
            self.ndb.clone(),
            self.root.clone(),
            start,
            end,
            ascending,
            inclusive,
            false,
        );
        while let Some(node) = traversal.next_node()? {
            if node.is_leaf() && f(&node) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Renders the tree sideways for debugging: left subtree above, right below.
    pub fn render_shape(&self, indent: &str) -> Result<Vec<String>, TreeError> {
        let mut lines = Vec::new();
        match &self.root {
            Some(root) => self.render_node(root, indent, 0, &mut lines)?,
            None => lines.push("<nil>".to_string()),
        }
        Ok(lines)
    }

    fn render_node(
        &self,
        node: &Arc<Node>,
        indent: &str,
        depth: usize,
        out: &mut Vec<String>,
    ) -> Result<(), TreeError> {
        let prefix = indent.repeat(depth);
        if node.is_leaf() {
            out.push(format!("{prefix}{}", hex::encode_upper(&node.key)));
            return Ok(());
        }
        self.render_node(&node.left(&self.ndb)?, indent, depth + 1, out)?;
        let hash = node.hash().map_or_else(|| "?".to_string(), hex::encode_upper);
        out.push(format!("{prefix}-{depth} {hash}"));
        self.render_node(&node.right(&self.ndb)?, indent, depth + 1, out)
    }
}

impl fmt::Display for ImmutableTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.render_shape("  ").map_err(|_| fmt::Error)?;
        write!(f, "{}", lines.join("\n"))
    }
}
