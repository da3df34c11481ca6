// Path: crates/state/src/nodedb/mod.rs
//! The node database: the only component that translates node identities to stored bytes.
//!
//! It owns the node and fast-node caches, the pending write batch, the version
//! bookkeeping (first, latest, legacy latest, active readers) and version pruning.

mod prune;

#[cfg(test)]
mod tests;

use crate::cache::Cache;
use crate::fast_node::FastNode;
use crate::key_format::{self, NodeKey, NODE_PREFIX};
use crate::node::{Hash, Node, NodeId};
use iavl_storage::{Batch, BatchWithFlusher, KvIter, KvStore};
use iavl_telemetry::Statistics;
use iavl_types::config::TreeOptions;
use iavl_types::error::{StorageError, TreeError};
use iavl_types::prelude::OptionExt;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) use prune::PruneState;

pub const DEFAULT_STORAGE_VERSION: &str = "1.0.0";
pub const FAST_STORAGE_VERSION: &str = "1.1.0";
const STORAGE_VERSION_KEY: &[u8] = b"storage_version";
const STORAGE_VERSION_DELIMITER: char = '-';

#[derive(Debug, Default)]
struct VersionState {
    /// Zero until discovered.
    first: i64,
    /// Zero until discovered.
    latest: i64,
    /// `None` until scanned; `Some(0)` when there are no legacy versions.
    legacy_latest: Option<i64>,
    readers: HashMap<i64, u32>,
    storage_version: String,
}

/// The one-slot rendezvous that keeps background pruning writes out of a commit.
#[derive(Debug, Default)]
struct CommitGate {
    committing: Mutex<bool>,
    cv: Condvar,
}

impl CommitGate {
    fn enter(&self) {
        let mut committing = self.committing.lock();
        while *committing {
            self.cv.wait(&mut committing);
        }
        *committing = true;
    }

    fn leave(&self) {
        *self.committing.lock() = false;
        self.cv.notify_all();
    }
}

pub struct NodeDb {
    db: Arc<dyn KvStore>,
    opts: TreeOptions,
    stats: Option<Arc<Statistics>>,
    batch: Mutex<BatchWithFlusher>,
    node_cache: Cache<NodeId, Arc<Node>>,
    fast_cache: Cache<Vec<u8>, FastNode>,
    versions: Mutex<VersionState>,
    gate: CommitGate,
    prune: Mutex<PruneState>,
    prune_cv: Condvar,
    prune_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let versions = self.versions.lock();
        f.debug_struct("NodeDb")
            .field("first", &versions.first)
            .field("latest", &versions.latest)
            .field("storage_version", &versions.storage_version)
            .field("node_cache_len", &self.node_cache.len())
            .field("fast_cache_len", &self.fast_cache.len())
            .finish_non_exhaustive()
    }
}

/// Keeps a version from being pruned while it is alive.
#[derive(Debug)]
pub struct VersionReader {
    ndb: Arc<NodeDb>,
    version: i64,
}

impl Drop for VersionReader {
    fn drop(&mut self) {
        self.ndb.dec_version_readers(self.version);
    }
}

impl NodeDb {
    pub fn new(db: Arc<dyn KvStore>, opts: TreeOptions, stats: Option<Arc<Statistics>>) -> Arc<Self> {
        let storage_version = match db.get(&key_format::metadata_key(STORAGE_VERSION_KEY)) {
            Ok(Some(v)) if !v.is_empty() => String::from_utf8_lossy(&v).into_owned(),
            _ => DEFAULT_STORAGE_VERSION.to_string(),
        };
        let batch = BatchWithFlusher::new(db.clone(), opts.flush_threshold);
        let ndb = Arc::new(Self {
            node_cache: Cache::new(opts.cache_size),
            fast_cache: Cache::new(opts.fast_cache_size),
            batch: Mutex::new(batch),
            versions: Mutex::new(VersionState {
                storage_version,
                ..VersionState::default()
            }),
            gate: CommitGate::default(),
            prune: Mutex::new(PruneState::default()),
            prune_cv: Condvar::new(),
            prune_handle: Mutex::new(None),
            db,
            opts,
            stats,
        });
        if ndb.opts.async_pruning {
            prune::spawn(&ndb);
        }
        ndb
    }

    pub fn options(&self) -> &TreeOptions {
        &self.opts
    }

    pub(crate) fn store(&self) -> &Arc<dyn KvStore> {
        &self.db
    }

    // --- Nodes ---

    /// Loads a node by id, from the cache or the store. A missing nonce-1 root is retried
    /// under nonce 0, where pruning moves roots that later versions still reference.
    pub fn get_node(&self, id: &NodeId) -> Result<Arc<Node>, TreeError> {
        if let Some(node) = self.node_cache.get(id) {
            if let Some(s) = &self.stats {
                s.inc_cache_hit();
            }
            return Ok(node);
        }
        if let Some(s) = &self.stats {
            s.inc_cache_miss();
        }
        let node = match id {
            NodeId::Legacy(hash) => {
                let bytes = self
                    .db
                    .get(&id.store_key())
                    .map_err(|e| node_err(id, e))?
                    .required_with(|| TreeError::NodeNotFound { key: id.to_string() })?;
                Node::decode_legacy(*hash, &bytes)
                    .map_err(|e| TreeError::Decode(format!("decoding node {id}: {e}")))?
            }
            NodeId::Versioned(nk) => {
                let mut found = self
                    .db
                    .get(&id.store_key())
                    .map_err(|e| node_err(id, e))?
                    .map(|bytes| (*nk, bytes));
                if found.is_none() && nk.nonce == 1 {
                    let reformatted = NodeKey::new(nk.version, 0);
                    found = self
                        .db
                        .get(&key_format::node_key(&reformatted))
                        .map_err(|e| node_err(id, e))?
                        .map(|bytes| (reformatted, bytes));
                }
                let (nk, bytes) =
                    found.required_with(|| TreeError::NodeNotFound { key: id.to_string() })?;
                Node::decode(nk, &bytes)
                    .map_err(|e| TreeError::Decode(format!("decoding node {id}: {e}")))?
            }
        };
        let node = Arc::new(node);
        self.node_cache.add(id.clone(), node.clone());
        Ok(node)
    }

    /// Stages a persisted node into the write batch and caches it.
    pub fn save_node(&self, node: Arc<Node>) -> Result<(), TreeError> {
        let mut batch = self.batch.lock();
        self.save_node_to(&mut *batch, node)
    }

    pub(crate) fn save_node_to(&self, batch: &mut dyn Batch, node: Arc<Node>) -> Result<(), TreeError> {
        let nk = node.node_key.required(TreeError::NodeMissingNodeKey)?;
        let bytes = node.encode()?;
        batch.set(&key_format::node_key(&nk), &bytes)?;
        tracing::trace!(target: "nodedb", node_key = %nk, "batch save");
        self.node_cache.add(NodeId::Versioned(nk), node);
        Ok(())
    }

    // --- Roots ---

    /// Resolves the root of `version`. `Ok(None)` is the empty tree.
    pub fn get_root(&self, version: i64) -> Result<Option<NodeId>, TreeError> {
        let root_key = NodeKey::new(version, 1);
        let Some(value) = self.db.get(&key_format::node_key(&root_key))? else {
            return self.get_legacy_root(version);
        };
        if value.is_empty() {
            return Ok(None);
        }
        if value.first() != Some(&NODE_PREFIX) {
            return Ok(Some(NodeId::Versioned(root_key)));
        }
        let target = key_format::parse_node_key(&value)
            .ok_or_else(|| TreeError::Decode(format!("invalid reference root {}", hex::encode(&value))))?;
        if value.len() == 9 {
            return Ok(Some(NodeId::Versioned(NodeKey::new(target.version, 1))));
        }
        if self.db.has(&value)? {
            return Ok(Some(NodeId::Versioned(target)));
        }
        let reformatted = NodeKey::new(target.version, 0);
        if self.db.has(&key_format::node_key(&reformatted))? {
            return Ok(Some(NodeId::Versioned(reformatted)));
        }
        Err(TreeError::VersionDoesNotExist)
    }

    fn get_legacy_root(&self, version: i64) -> Result<Option<NodeId>, TreeError> {
        match self.db.get(&key_format::legacy_root_key(version))? {
            None => Err(TreeError::VersionDoesNotExist),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => {
                let hash = Hash::try_from(v.as_slice())
                    .map_err(|_| TreeError::Decode(format!("invalid legacy root for version {version}")))?;
                Ok(Some(NodeId::Legacy(hash)))
            }
        }
    }

    /// Points `version`'s root slot at the root of an earlier version.
    pub fn save_root(&self, version: i64, root: &NodeKey) -> Result<(), TreeError> {
        self.batch.lock().set(
            &key_format::node_key(&NodeKey::new(version, 1)),
            &key_format::node_key(root),
        )?;
        Ok(())
    }

    pub fn save_empty_root(&self, version: i64) -> Result<(), TreeError> {
        self.batch
            .lock()
            .set(&key_format::node_key(&NodeKey::new(version, 1)), &[])?;
        Ok(())
    }

    // --- Versions ---

    pub(crate) fn has_version(&self, version: i64) -> Result<bool, TreeError> {
        Ok(self.db.has(&key_format::node_key(&NodeKey::new(version, 1)))?)
    }

    pub(crate) fn has_legacy_version(&self, version: i64) -> Result<bool, TreeError> {
        Ok(self.db.has(&key_format::legacy_root_key(version))?)
    }

    /// The latest saved version, or 0 when nothing has been saved.
    pub fn latest_version(&self) -> Result<i64, TreeError> {
        let cached = self.versions.lock().latest;
        if cached > 0 {
            return Ok(cached);
        }
        let mut iter = self.db.reverse_iterator(
            Some(&key_format::version_key(1)),
            Some(&key_format::version_key(i64::MAX)),
        )?;
        if let Some(item) = iter.next() {
            let (key, _) = item?;
            let nk = key_format::parse_node_key(&key)
                .ok_or_else(|| TreeError::Decode(format!("invalid node key {}", hex::encode(&key))))?;
            self.reset_latest_version(nk.version);
            return Ok(nk.version);
        }
        let legacy = self.legacy_latest_version()?;
        if legacy > 0 {
            self.reset_latest_version(legacy);
        }
        Ok(legacy)
    }

    /// The earliest retained version, or 0 when nothing has been saved.
    pub fn first_version(&self) -> Result<i64, TreeError> {
        let cached = self.versions.lock().first;
        if cached > 0 {
            return Ok(cached);
        }
        let legacy_start = [key_format::LEGACY_ROOT_PREFIX];
        let legacy_end = [key_format::LEGACY_ROOT_PREFIX + 1];
        if let Some(item) = self.db.iterator(Some(&legacy_start), Some(&legacy_end))?.next() {
            let (key, _) = item?;
            if let Some(version) = key_format::parse_legacy_root_key(&key) {
                return Ok(version);
            }
        }
        let mut latest = self.latest_version()?;
        let mut first = 0;
        while first < latest {
            let mid = first + (latest - first) / 2;
            if self.has_version(mid)? {
                latest = mid;
            } else {
                first = mid + 1;
            }
        }
        self.reset_first_version(latest);
        Ok(latest)
    }

    /// The latest version stored in the hash-keyed format, or 0 if there is none.
    pub fn legacy_latest_version(&self) -> Result<i64, TreeError> {
        if let Some(v) = self.versions.lock().legacy_latest {
            return Ok(v);
        }
        let mut iter = self.db.reverse_iterator(
            Some(&key_format::legacy_root_key(1)),
            Some(&key_format::legacy_root_key(i64::MAX)),
        )?;
        let latest = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                key_format::parse_legacy_root_key(&key).unwrap_or(0)
            }
            None => 0,
        };
        self.versions.lock().legacy_latest = Some(latest);
        Ok(latest)
    }

    pub(crate) fn reset_latest_version(&self, version: i64) {
        self.versions.lock().latest = version;
        crate::metrics::metrics().set_latest_version(version);
    }

    pub(crate) fn reset_first_version(&self, version: i64) {
        self.versions.lock().first = version;
    }

    pub(crate) fn reset_legacy_latest_version(&self, version: Option<i64>) {
        self.versions.lock().legacy_latest = version;
    }

    // --- Readers ---

    pub(crate) fn inc_version_readers(&self, version: i64) {
        *self.versions.lock().readers.entry(version).or_default() += 1;
    }

    pub(crate) fn dec_version_readers(&self, version: i64) {
        let mut state = self.versions.lock();
        if let Some(count) = state.readers.get_mut(&version) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.readers.remove(&version);
            }
        }
    }

    /// Registers a reader of `version` that is released when the guard drops.
    pub fn reader(self: &Arc<Self>, version: i64) -> VersionReader {
        self.inc_version_readers(version);
        VersionReader {
            ndb: self.clone(),
            version,
        }
    }

    pub fn version_readers(&self, version: i64) -> u32 {
        self.versions.lock().readers.get(&version).copied().unwrap_or(0)
    }

    /// The first version in `range` that still has readers.
    fn active_reader_in(&self, range: impl Fn(i64) -> bool) -> Option<(i64, u32)> {
        self.versions
            .lock()
            .readers
            .iter()
            .filter(|(v, r)| range(**v) && **r > 0)
            .map(|(v, r)| (*v, *r))
            .min()
    }

    // --- Fast nodes ---

    pub fn storage_version(&self) -> String {
        self.versions.lock().storage_version.clone()
    }

    pub fn has_upgraded_to_fast_storage(&self) -> bool {
        self.versions.lock().storage_version.as_str() >= FAST_STORAGE_VERSION
    }

    /// True when the stored fast-index version suffix disagrees with the latest version.
    pub fn should_force_fast_storage_upgrade(&self) -> Result<bool, TreeError> {
        let storage_version = self.storage_version();
        let parts: Vec<&str> = storage_version.split(STORAGE_VERSION_DELIMITER).collect();
        if let [_, suffix] = parts.as_slice() {
            let latest = self.latest_version()?;
            return Ok(*suffix != latest.to_string());
        }
        Ok(false)
    }

    /// Stages `"1.1.0-<latest>"` as the storage version.
    pub fn set_fast_storage_version_to_batch(&self, latest: i64) -> Result<(), TreeError> {
        let mut state = self.versions.lock();
        let base = if state.storage_version.as_str() >= FAST_STORAGE_VERSION {
            let parts: Vec<&str> = state.storage_version.split(STORAGE_VERSION_DELIMITER).collect();
            if parts.len() > 2 {
                return Err(TreeError::InvalidStorageVersion(state.storage_version.clone()));
            }
            parts.first().copied().unwrap_or(FAST_STORAGE_VERSION).to_string()
        } else {
            FAST_STORAGE_VERSION.to_string()
        };
        let new_version = format!("{base}{STORAGE_VERSION_DELIMITER}{latest}");
        self.batch.lock().set(
            &key_format::metadata_key(STORAGE_VERSION_KEY),
            new_version.as_bytes(),
        )?;
        state.storage_version = new_version;
        Ok(())
    }

    /// Forgets an unpersisted storage version bump after a failed upgrade.
    pub(crate) fn reset_storage_version(&self, version: &str) {
        self.versions.lock().storage_version = version.to_string();
    }

    pub fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, TreeError> {
        if !self.has_upgraded_to_fast_storage() {
            return Err(TreeError::NotFastStorage);
        }
        if key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        if let Some(node) = self.fast_cache.get(&key.to_vec()) {
            if let Some(s) = &self.stats {
                s.inc_fast_cache_hit();
            }
            return Ok(Some(node));
        }
        if let Some(s) = &self.stats {
            s.inc_fast_cache_miss();
        }
        let Some(bytes) = self.db.get(&key_format::fast_key(key))? else {
            return Ok(None);
        };
        let node = FastNode::decode(key.to_vec(), &bytes)?;
        self.fast_cache.add(key.to_vec(), node.clone());
        Ok(Some(node))
    }

    pub fn save_fast_node(&self, node: &FastNode) -> Result<(), TreeError> {
        self.save_fast_node_inner(node, true)
    }

    /// Used by the bulk rebuild so a full upgrade does not churn the cache.
    pub fn save_fast_node_no_cache(&self, node: &FastNode) -> Result<(), TreeError> {
        self.save_fast_node_inner(node, false)
    }

    fn save_fast_node_inner(&self, node: &FastNode, cache: bool) -> Result<(), TreeError> {
        if node.key.is_empty() {
            return Err(TreeError::EmptyKey);
        }
        self.batch
            .lock()
            .set(&key_format::fast_key(&node.key), &node.encode())?;
        if cache {
            self.fast_cache.add(node.key.clone(), node.clone());
        }
        Ok(())
    }

    pub fn delete_fast_node(&self, key: &[u8]) -> Result<(), TreeError> {
        self.batch.lock().delete(&key_format::fast_key(key))?;
        self.fast_cache.remove(&key.to_vec());
        Ok(())
    }

    /// Raw iterator over the fast index in `[start, end)`, keys still carrying the prefix.
    pub(crate) fn fast_index_iter(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
    ) -> Result<KvIter, TreeError> {
        let lower = key_format::fast_key(start.unwrap_or_default());
        let upper = match end {
            Some(end) => Some(key_format::fast_key(end)),
            None => key_format::prefix_end(&[key_format::FAST_PREFIX]),
        };
        let iter = if ascending {
            self.db.iterator(Some(&lower), upper.as_deref())?
        } else {
            self.db.reverse_iterator(Some(&lower), upper.as_deref())?
        };
        Ok(iter)
    }

    // --- Batch ---

    /// Writes the pending batch, durably when the options ask for it.
    pub fn commit(&self) -> Result<(), TreeError> {
        let mut batch = self.batch.lock();
        if self.opts.sync {
            batch.write_sync()?;
        } else {
            batch.write()?;
        }
        Ok(())
    }

    /// Blocks background pruning from writing until [`NodeDb::unset_committing`].
    pub fn set_committing(&self) {
        self.gate.enter();
    }

    pub fn unset_committing(&self) {
        self.gate.leave();
    }

    /// Deletes every key under `prefix`, staging the deletes in the write batch.
    pub(crate) fn delete_prefix(&self, prefix: &[u8]) -> Result<usize, TreeError> {
        let end = key_format::prefix_end(prefix);
        let mut count = 0;
        let mut batch = self.batch.lock();
        for item in self.db.iterator(Some(prefix), end.as_deref())? {
            let (key, _) = item?;
            batch.delete(&key)?;
            count += 1;
        }
        Ok(count)
    }

    /// Visits every stored tree node of both formats.
    pub fn traverse_nodes(
        &self,
        mut f: impl FnMut(&Node) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        let end = key_format::prefix_end(&[NODE_PREFIX]);
        for item in self.db.iterator(Some(&[NODE_PREFIX]), end.as_deref())? {
            let (key, value) = item?;
            if value.is_empty() || value.first() == Some(&NODE_PREFIX) {
                continue;
            }
            let Some(nk) = key_format::parse_node_key(&key) else {
                continue;
            };
            f(&Node::decode(nk, &value)?)?;
        }
        let end = key_format::prefix_end(&[key_format::LEGACY_NODE_PREFIX]);
        for item in self
            .db
            .iterator(Some(&[key_format::LEGACY_NODE_PREFIX]), end.as_deref())?
        {
            let (key, value) = item?;
            let hash = key
                .get(1..)
                .and_then(|h| Hash::try_from(h).ok())
                .ok_or_else(|| TreeError::Decode(format!("invalid legacy node key {}", hex::encode(&key))))?;
            f(&Node::decode_legacy(hash, &value)?)?;
        }
        Ok(())
    }

    pub fn node_count(&self) -> Result<usize, TreeError> {
        let mut count = 0;
        self.traverse_nodes(|_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    pub(crate) fn clear_node_cache_entry(&self, id: &NodeId) {
        self.node_cache.remove(id);
    }

    /// Stops background pruning, drops pending writes and closes the store.
    pub fn close(&self) -> Result<(), TreeError> {
        prune::shutdown(self);
        self.batch.lock().close()?;
        self.node_cache.clear();
        self.fast_cache.clear();
        self.db.close()?;
        Ok(())
    }
}

impl Drop for NodeDb {
    fn drop(&mut self) {
        prune::signal_shutdown(self);
    }
}

fn node_err(id: &NodeId, e: StorageError) -> TreeError {
    TreeError::Storage(StorageError::Backend(format!("get node {id}: {e}")))
}
