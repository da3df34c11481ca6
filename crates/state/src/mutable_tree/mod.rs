// Path: crates/state/src/mutable_tree/mod.rs
//! The working tree: copy-on-write mutation, AVL rebalancing, version saving and loading,
//! and maintenance of the fast index overlay.


use crate::diff::ChangeSet;
use crate::fast_node::FastNode;
use crate::immutable_tree::ImmutableTree;
use crate::iterator::{FastIterator, KvPair, TreeIter, UnsavedFastIterator};
use crate::key_format::NodeKey;
use crate::metrics::metrics;
use crate::node::{empty_hash, Hash, Node};
use crate::nodedb::{NodeDb, DEFAULT_STORAGE_VERSION};
use iavl_storage::KvStore;
use iavl_telemetry::time::Timer;
use iavl_telemetry::Statistics;
use iavl_types::config::TreeOptions;
use iavl_types::error::TreeError;
use iavl_types::prelude::OptionExt;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Result of removing a key from a subtree: the replacement subtree (`None` when the
/// subtree was the removed leaf), the new leftmost key of the right branch if it changed,
/// and the removed value.
type Removed = (Option<Arc<Node>>, Option<Vec<u8>>, Vec<u8>);

/// A versioned tree with a single writer.
///
/// Mutations build a new working root through copy-on-write; persisted nodes are
/// never modified. [`MutableTree::save_version`] assigns node keys to everything new and
/// commits it as the next version. Read-only snapshots of saved versions are obtained
/// with [`MutableTree::get_immutable`] and may be used from other threads.
pub struct MutableTree {
    working: ImmutableTree,
    last_saved: ImmutableTree,
    additions: BTreeMap<Vec<u8>, FastNode>,
    removals: BTreeSet<Vec<u8>>,
    ndb: Arc<NodeDb>,
    skip_fast_storage_upgrade: bool,
    initial_version: u64,
    initial_version_set: bool,
}

impl std::fmt::Debug for MutableTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableTree")
            .field("version", &self.working.version)
            .field("size", &self.working.size())
            .field("unsaved_additions", &self.additions.len())
            .field("unsaved_removals", &self.removals.len())
            .finish_non_exhaustive()
    }
}

impl MutableTree {
    pub fn new(db: Arc<dyn KvStore>, opts: TreeOptions) -> Self {
        Self::build(db, opts, None)
    }

    /// Like [`MutableTree::new`], counting cache hits and misses into `stats`.
    pub fn with_stats(db: Arc<dyn KvStore>, opts: TreeOptions, stats: Arc<Statistics>) -> Self {
        Self::build(db, opts, Some(stats))
    }

    fn build(db: Arc<dyn KvStore>, opts: TreeOptions, stats: Option<Arc<Statistics>>) -> Self {
        let skip = opts.skip_fast_storage_upgrade;
        let initial_version = opts.initial_version;
        let ndb = NodeDb::new(db, opts, stats);
        let head = ImmutableTree::new(ndb.clone(), skip);
        Self {
            last_saved: head.clone(),
            working: head,
            additions: BTreeMap::new(),
            removals: BTreeSet::new(),
            ndb,
            skip_fast_storage_upgrade: skip,
            initial_version,
            initial_version_set: initial_version > 0,
        }
    }

    pub fn node_db(&self) -> &Arc<NodeDb> {
        &self.ndb
    }

    /// A snapshot of the working tree, including unsaved changes. Its unsaved nodes hash
    /// with [`MutableTree::working_version`], so reading its hash or proofs agrees with
    /// the next [`MutableTree::save_version`].
    pub fn working_tree(&self) -> ImmutableTree {
        let mut tree = self.working.clone();
        tree.unsaved_version = self.working_version();
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.working.size() == 0
    }

    pub fn size(&self) -> i64 {
        self.working.size()
    }

    pub fn height(&self) -> i8 {
        self.working.height()
    }

    /// The version the working tree was loaded from or last saved as.
    pub fn version(&self) -> i64 {
        self.working.version
    }

    pub fn latest_version(&self) -> Result<i64, TreeError> {
        self.ndb.latest_version()
    }

    pub fn version_exists(&self, version: i64) -> bool {
        let Ok(legacy_latest) = self.ndb.legacy_latest_version() else {
            return false;
        };
        if version <= legacy_latest {
            return self.ndb.has_legacy_version(version).unwrap_or(false);
        }
        let (Ok(first), Ok(latest)) = (self.ndb.first_version(), self.ndb.latest_version()) else {
            return false;
        };
        latest > 0 && first > 0 && first <= version && version <= latest
    }

    /// Every retained version in ascending order.
    pub fn available_versions(&self) -> Result<Vec<i64>, TreeError> {
        let mut first = self.ndb.first_version()?;
        let latest = self.ndb.latest_version()?;
        let legacy_latest = self.ndb.legacy_latest_version()?;
        let mut versions = Vec::new();
        if first == 0 {
            return Ok(versions);
        }
        if legacy_latest > first {
            for version in first..legacy_latest {
                if self.ndb.has_legacy_version(version)? {
                    versions.push(version);
                }
            }
            first = legacy_latest;
        }
        versions.extend(first..=latest);
        Ok(versions)
    }

    /// Hash of the last saved version.
    pub fn hash(&self) -> Result<Hash, TreeError> {
        self.last_saved.hash()
    }

    /// Hash of the working tree as it would be saved.
    pub fn working_hash(&self) -> Result<Hash, TreeError> {
        self.root_hash_at(self.working_version())
    }

    fn root_hash_at(&self, version: i64) -> Result<Hash, TreeError> {
        match &self.working.root {
            Some(root) => root.hash_with(version),
            None => Ok(empty_hash()),
        }
    }

    /// The version the next [`MutableTree::save_version`] will create.
    pub fn working_version(&self) -> i64 {
        let version = self.working.version + 1;
        if version == 1 && self.initial_version_set {
            return i64::try_from(self.initial_version).unwrap_or(i64::MAX);
        }
        version
    }

    /// Sets `key` to `value`. Returns true when an existing value was replaced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, TreeError> {
        if key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        if !self.skip_fast_storage_upgrade {
            let node = FastNode::new(key.to_vec(), value.to_vec(), self.working_version());
            self.add_unsaved_addition(node);
        }
        let Some(root) = self.working.root.clone() else {
            self.working.root = Some(Arc::new(Node::new_leaf(key.to_vec(), value.to_vec())));
            return Ok(false);
        };
        let (new_root, updated) = self.recursive_set(&root, key, value)?;
        self.working.root = Some(new_root);
        Ok(updated)
    }

    fn recursive_set(
        &self,
        node: &Arc<Node>,
        key: &[u8],
        value: &[u8],
    ) -> Result<(Arc<Node>, bool), TreeError> {
        if node.is_leaf() {
            return Ok(set_leaf(node, key, value));
        }
        let ndb = &*self.ndb;
        let mut node = node.clone_inner(ndb)?;
        let updated = if key < node.key.as_slice() {
            let (left, updated) = self.recursive_set(&node.left(ndb)?, key, value)?;
            node.set_left(left);
            updated
        } else {
            let (right, updated) = self.recursive_set(&node.right(ndb)?, key, value)?;
            node.set_right(right);
            updated
        };
        if updated {
            return Ok((Arc::new(node), true));
        }
        node.calc_height_and_size(ndb)?;
        Ok((Arc::new(self.balance(node)?), false))
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let Some(root) = self.working.root.clone() else {
            return Ok(None);
        };
        let Some((new_root, _, value)) = self.recursive_remove(&root, key)? else {
            return Ok(None);
        };
        if !self.skip_fast_storage_upgrade {
            self.add_unsaved_removal(key);
        }
        self.working.root = new_root;
        Ok(Some(value))
    }

    fn recursive_remove(&self, node: &Arc<Node>, key: &[u8]) -> Result<Option<Removed>, TreeError> {
        if node.is_leaf() {
            if node.key == key {
                return Ok(Some((None, None, node.value.clone().unwrap_or_default())));
            }
            return Ok(None);
        }
        let ndb = &*self.ndb;
        if key < node.key.as_slice() {
            let Some((new_left, new_key, value)) = self.recursive_remove(&node.left(ndb)?, key)? else {
                return Ok(None);
            };
            let Some(new_left) = new_left else {
                // The left leaf went away; the right subtree takes this node's place and its
                // leftmost key is this node's key.
                return Ok(Some((Some(node.right(ndb)?), Some(node.key.clone()), value)));
            };
            let mut node = node.clone_inner(ndb)?;
            node.set_left(new_left);
            node.calc_height_and_size(ndb)?;
            return Ok(Some((Some(Arc::new(self.balance(node)?)), new_key, value)));
        }

        let Some((new_right, new_key, value)) = self.recursive_remove(&node.right(ndb)?, key)? else {
            return Ok(None);
        };
        let Some(new_right) = new_right else {
            return Ok(Some((Some(node.left(ndb)?), None, value)));
        };
        let mut node = node.clone_inner(ndb)?;
        node.set_right(new_right);
        if let Some(new_key) = new_key {
            node.key = new_key;
        }
        node.calc_height_and_size(ndb)?;
        Ok(Some((Some(Arc::new(self.balance(node)?)), None, value)))
    }

    fn rotate_right(&self, mut node: Node) -> Result<Node, TreeError> {
        let ndb = &*self.ndb;
        let mut pivot = node.left(ndb)?.clone_inner(ndb)?;
        node.set_left(pivot.right(ndb)?);
        node.calc_height_and_size(ndb)?;
        pivot.set_right(Arc::new(node));
        pivot.calc_height_and_size(ndb)?;
        Ok(pivot)
    }

    fn rotate_left(&self, mut node: Node) -> Result<Node, TreeError> {
        let ndb = &*self.ndb;
        let mut pivot = node.right(ndb)?.clone_inner(ndb)?;
        node.set_right(pivot.left(ndb)?);
        node.calc_height_and_size(ndb)?;
        pivot.set_left(Arc::new(node));
        pivot.calc_height_and_size(ndb)?;
        Ok(pivot)
    }

    /// Restores the AVL invariant at a working node whose children are balanced.
    fn balance(&self, mut node: Node) -> Result<Node, TreeError> {
        if node.is_persisted() {
            return Err(TreeError::InvalidNode(
                "unexpected balance() call on persisted node".into(),
            ));
        }
        let ndb = &*self.ndb;
        let balance = node.calc_balance(ndb)?;
        if balance > 1 {
            let left = node.left(ndb)?;
            if left.calc_balance(ndb)? >= 0 {
                return self.rotate_right(node);
            }
            let rotated = self.rotate_left(left.clone_inner(ndb)?)?;
            node.set_left(Arc::new(rotated));
            return self.rotate_right(node);
        }
        if balance < -1 {
            let right = node.right(ndb)?;
            if right.calc_balance(ndb)? <= 0 {
                return self.rotate_left(node);
            }
            let rotated = self.rotate_right(right.clone_inner(ndb)?)?;
            node.set_right(Arc::new(rotated));
            return self.rotate_left(node);
        }
        Ok(node)
    }

    fn add_unsaved_addition(&mut self, node: FastNode) {
        self.removals.remove(&node.key);
        self.additions.insert(node.key.clone(), node);
    }

    fn add_unsaved_removal(&mut self, key: &[u8]) {
        self.additions.remove(key);
        self.removals.insert(key.to_vec());
    }

    /// Reads `key` from the working tree, honouring unsaved changes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        if self.working.root.is_none() {
            return Ok(None);
        }
        if !self.skip_fast_storage_upgrade {
            if let Some(node) = self.additions.get(key) {
                return Ok(Some(node.value.clone()));
            }
            if self.removals.contains(key) {
                return Ok(None);
            }
        }
        self.working.get(key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, TreeError> {
        self.working.has(key)
    }

    pub fn get_with_index(&self, key: &[u8]) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        self.working.get_with_index(key)
    }

    pub fn get_by_index(&self, index: i64) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        self.working.get_by_index(index)
    }

    /// Reads `key` as of a saved `version`. Missing versions read as absent.
    pub fn get_versioned(&self, key: &[u8], version: i64) -> Result<Option<Vec<u8>>, TreeError> {
        if !self.version_exists(version) {
            return Ok(None);
        }
        if !self.skip_fast_storage_upgrade && self.working.is_fast_cache_enabled()? {
            let fast = self.ndb.get_fast_node(key).ok().flatten();
            match fast {
                None if version == self.ndb.latest_version()? => return Ok(None),
                Some(node) if node.version_last_updated_at <= version => {
                    return Ok(Some(node.value));
                }
                _ => {}
            }
        }
        match self.get_immutable(version) {
            Ok(tree) => tree.get(key),
            Err(_) => Ok(None),
        }
    }

    /// A read-only snapshot of a saved version. It keeps the version from being pruned
    /// for as long as it (or any clone) is alive.
    pub fn get_immutable(&self, version: i64) -> Result<ImmutableTree, TreeError> {
        ImmutableTree::load(self.ndb.clone(), version, self.skip_fast_storage_upgrade)
    }

    /// Iterates `[start, end)` over the working state, unsaved changes included.
    pub fn iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<TreeIter, TreeError> {
        if !self.skip_fast_storage_upgrade && self.working.is_fast_cache_enabled()? {
            let disk = FastIterator::new(&self.ndb, start, end, ascending)?;
            let additions: Vec<KvPair> = self
                .additions
                .values()
                .filter(|n| start.map_or(true, |s| n.key.as_slice() >= s))
                .filter(|n| end.map_or(true, |e| n.key.as_slice() < e))
                .map(|n| (n.key.clone(), n.value.clone()))
                .collect();
            return Ok(Box::new(UnsavedFastIterator::new(
                disk,
                additions,
                self.removals.clone(),
                ascending,
            )));
        }
        self.working.iterator(start, end, ascending)
    }

    /// Calls `f` for every pair of the working state in ascending order until it returns
    /// true. Returns whether iteration was stopped early.
    pub fn iterate(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) -> Result<bool, TreeError> {
        if self.working.root.is_none() {
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

    /// Loads the latest version.
    pub fn load(&mut self) -> Result<i64, TreeError> {
        self.load_version(0)
    }

    /// Loads `target_version`, or the latest version when it is not positive. Returns the
    /// latest version on disk.
    pub fn load_version(&mut self, target_version: i64) -> Result<i64, TreeError> {
        let first = self.ndb.first_version()?;
        if first > 0 && (first as u64) < self.initial_version {
            return Err(TreeError::InitialVersionConflict {
                initial: self.initial_version,
                first,
            });
        }
        let latest = self.ndb.latest_version()?;
        if latest < target_version {
            return Err(TreeError::TargetVersionAhead {
                target: target_version,
                latest,
            });
        }
        if latest == 0 {
            if target_version > 0 {
                return Err(TreeError::NoVersionsFound(target_version));
            }
            if !self.skip_fast_storage_upgrade {
                self.enable_fast_storage_and_commit_if_not_enabled()?;
            }
            return Ok(0);
        }

        let target = if target_version <= 0 { latest } else { target_version };
        if !self.version_exists(target) {
            return Err(TreeError::VersionDoesNotExist);
        }
        let tree = ImmutableTree::open(self.ndb.clone(), target, self.skip_fast_storage_upgrade)?;
        self.working = tree.clone();
        self.last_saved = tree;
        self.additions.clear();
        self.removals.clear();
        tracing::debug!(target: "iavl", version = target, latest, "loaded version");

        if !self.skip_fast_storage_upgrade {
            self.enable_fast_storage_and_commit_if_not_enabled()?;
        }
        Ok(latest)
    }

    /// Loads `target_version` and deletes every later version, so the next save
    /// overwrites history from there.
    pub fn load_version_for_overwriting(&mut self, target_version: i64) -> Result<(), TreeError> {
        self.load_version(target_version)?;
        self.ndb.delete_versions_from(target_version + 1)?;
        self.ndb.commit()?;
        if !self.skip_fast_storage_upgrade {
            // The stored fast index now disagrees with the latest version and is rebuilt.
            self.enable_fast_storage_and_commit_if_not_enabled()?;
        }
        Ok(())
    }

    /// True when the fast index is missing or stale and would be rebuilt on load.
    pub fn is_upgradeable(&self) -> Result<bool, TreeError> {
        let force = self.ndb.should_force_fast_storage_upgrade()?;
        Ok(!self.skip_fast_storage_upgrade && (!self.ndb.has_upgraded_to_fast_storage() || force))
    }

    fn enable_fast_storage_and_commit_if_not_enabled(&mut self) -> Result<bool, TreeError> {
        if !self.is_upgradeable()? {
            return Ok(false);
        }
        // Entries written before a downgrade may no longer match live state.
        let mut deleted = 0u64;
        for item in FastIterator::new(&self.ndb, None, None, true)? {
            let (key, _) = item?;
            self.ndb.delete_fast_node(&key)?;
            deleted += 1;
        }
        match self.enable_fast_storage_and_commit() {
            Ok(upgraded) => {
                tracing::info!(
                    target: "iavl",
                    version = self.working.version,
                    deleted,
                    upgraded,
                    "rebuilt fast index"
                );
                Ok(true)
            }
            Err(e) => {
                self.ndb.reset_storage_version(DEFAULT_STORAGE_VERSION);
                Err(e)
            }
        }
    }

    fn enable_fast_storage_and_commit(&self) -> Result<u64, TreeError> {
        let mut upgraded = 0u64;
        for item in self.working.tree_iterator(None, None, true) {
            let (key, value) = item?;
            self.ndb
                .save_fast_node_no_cache(&FastNode::new(key, value, self.working.version))?;
            upgraded += 1;
        }
        let latest = self.ndb.latest_version()?;
        self.ndb.set_fast_storage_version_to_batch(latest)?;
        self.ndb.commit()?;
        Ok(upgraded)
    }

    /// Discards unsaved changes.
    pub fn rollback(&mut self) {
        self.working = if self.working.version > 0 {
            self.last_saved.clone()
        } else {
            ImmutableTree::new(self.ndb.clone(), self.skip_fast_storage_upgrade)
        };
        self.additions.clear();
        self.removals.clear();
    }

    /// Blocks background pruning writes until [`MutableTree::unset_committing`].
    pub fn set_committing(&self) {
        self.ndb.set_committing();
    }

    pub fn unset_committing(&self) {
        self.ndb.unset_committing();
    }

    /// Persists the working tree as the next version and returns its hash and number.
    ///
    /// Saving a version that already exists succeeds only when the working hash equals the
    /// stored one.
    pub fn save_version(&mut self) -> Result<(Hash, i64), TreeError> {
        let _timer = Timer::new(metrics(), "save_version");
        let version = self.working_version();
        self.initial_version_set = false;

        if self.version_exists(version) {
            let existing = self
                .ndb
                .get_root(version)?
                .map(|id| self.ndb.get_node(&id))
                .transpose()?;
            let new_hash = self.root_hash_at(version)?;
            let same = match (&existing, &self.working.root) {
                (None, None) => true,
                (Some(root), _) => root.hash() == Some(&new_hash),
                (None, Some(_)) => false,
            };
            if !same {
                return Err(TreeError::VersionConflict {
                    version,
                    hash: hex::encode(new_hash),
                });
            }
            self.working.version = version;
            self.working.unsaved_version = version.saturating_add(1);
            self.working.root = existing;
            self.last_saved = self.working.clone();
            self.additions.clear();
            self.removals.clear();
            return Ok((new_hash, version));
        }

        tracing::debug!(target: "iavl", version, "saving version");
        if !self.skip_fast_storage_upgrade {
            self.save_fast_node_version(version)?;
        }

        match self.working.root.clone() {
            None => self.ndb.save_empty_root(version)?,
            Some(root) if root.is_persisted() => {
                let nk = root.node_key().required(TreeError::NodeMissingNodeKey)?;
                self.ndb.save_root(version, &nk)?;
                if root.is_legacy() {
                    // Rewrite the referenced root in the versioned format.
                    let mut migrated = Node::clone(&root);
                    migrated.is_legacy = false;
                    let migrated = Arc::new(migrated);
                    self.ndb.save_node(migrated.clone())?;
                    self.working.root = Some(migrated);
                }
            }
            Some(root) => {
                let saved = self.save_new_nodes(version, &root)?;
                self.working.root = Some(saved);
            }
        }

        self.ndb.commit()?;
        self.ndb.reset_latest_version(version);
        self.working.version = version;
        self.working.unsaved_version = version.saturating_add(1);
        self.last_saved = self.working.clone();
        self.additions.clear();
        self.removals.clear();

        let hash = self.last_saved.hash()?;
        tracing::debug!(target: "iavl", version, hash = %hex::encode(hash), "saved version");
        Ok((hash, version))
    }

    fn save_fast_node_version(&self, version: i64) -> Result<(), TreeError> {
        for node in self.additions.values() {
            self.ndb.save_fast_node(node)?;
        }
        for key in &self.removals {
            self.ndb.delete_fast_node(key)?;
        }
        self.ndb.set_fast_storage_version_to_batch(version)
    }

    /// Assigns `(version, nonce)` keys to every unsaved node in pre-order, so the root
    /// gets nonce 1, then stages them. Returns the persisted form of the root.
    fn save_new_nodes(&self, version: i64, root: &Arc<Node>) -> Result<Arc<Node>, TreeError> {
        let mut nonce = 0u32;
        let mut new_nodes = Vec::new();
        let saved = assign_keys(root, version, &mut nonce, &mut new_nodes)?;
        let count = new_nodes.len();
        for node in new_nodes {
            self.ndb.save_node(node)?;
        }
        metrics().inc_nodes_saved(count as u64);
        tracing::debug!(target: "iavl", version, nodes = count, "staged new nodes");
        Ok(saved)
    }

    /// Overrides the version of the first save on an empty database.
    pub fn set_initial_version(&mut self, version: u64) {
        self.initial_version = version;
        self.initial_version_set = true;
    }

    /// Deletes every version up to and including `to_version`, and commits.
    pub fn delete_versions_to(&self, to_version: i64) -> Result<(), TreeError> {
        self.ndb.delete_versions_to(to_version)?;
        self.ndb.commit()
    }

    /// Deletes `from_version` and everything after it, and commits.
    pub fn delete_versions_from(&self, from_version: i64) -> Result<(), TreeError> {
        self.ndb.delete_versions_from(from_version)?;
        self.ndb.commit()
    }

    /// Applies a change set to a clean tree and saves it as the next version.
    pub fn save_change_set(&mut self, change_set: &ChangeSet) -> Result<i64, TreeError> {
        if self.working.root.as_ref().map_or(false, |r| !r.is_persisted()) {
            return Err(TreeError::UncommittedChanges);
        }
        for pair in &change_set.pairs {
            if pair.delete {
                if self.remove(&pair.key)?.is_none() {
                    return Err(TreeError::RemoveMissingKey(
                        String::from_utf8_lossy(&pair.key).into_owned(),
                    ));
                }
            } else {
                self.set(&pair.key, &pair.value)?;
            }
        }
        let (_, version) = self.save_version()?;
        Ok(version)
    }

    /// Closes the node database. Snapshots taken from this tree become unusable too.
    pub fn close(self) -> Result<(), TreeError> {
        self.ndb.close()
    }
}

fn set_leaf(leaf: &Arc<Node>, key: &[u8], value: &[u8]) -> (Arc<Node>, bool) {
    let new_leaf = Arc::new(Node::new_leaf(key.to_vec(), value.to_vec()));
    match key.cmp(leaf.key.as_slice()) {
        std::cmp::Ordering::Less => (
            Arc::new(Node::new_inner(leaf.key.clone(), new_leaf, leaf.clone())),
            false,
        ),
        std::cmp::Ordering::Greater => (
            Arc::new(Node::new_inner(key.to_vec(), leaf.clone(), new_leaf)),
            false,
        ),
        std::cmp::Ordering::Equal => (new_leaf, true),
    }
}

fn assign_keys(
    node: &Arc<Node>,
    version: i64,
    nonce: &mut u32,
    out: &mut Vec<Arc<Node>>,
) -> Result<Arc<Node>, TreeError> {
    if node.is_persisted() {
        return Ok(node.clone());
    }
    *nonce += 1;
    let node_key = NodeKey::new(version, *nonce);
    let hash = OnceCell::new();
    let _ = hash.set(node.hash_with(version)?);
    let mut saved = Node {
        key: node.key.clone(),
        value: node.value.clone(),
        height: node.height,
        size: node.size,
        hash,
        node_key: Some(node_key),
        ..Node::default()
    };
    if !node.is_leaf() {
        let (Some(left), Some(right)) = (&node.left_node, &node.right_node) else {
            return Err(TreeError::EmptyChild);
        };
        let left = assign_keys(left, version, nonce, out)?;
        let right = assign_keys(right, version, nonce, out)?;
        saved.left_id = Some(left.id().required(TreeError::NodeMissingNodeKey)?);
        saved.right_id = Some(right.id().required(TreeError::NodeMissingNodeKey)?);
    }
    let saved = Arc::new(saved);
    out.push(saved.clone());
    Ok(saved)
}
