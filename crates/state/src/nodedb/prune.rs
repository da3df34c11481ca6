// Path: crates/state/src/nodedb/prune.rs
//! Version deletion: orphan collection, root reformatting, legacy clean-up and the
//! background pruning thread.

use super::NodeDb;
use crate::iterator::NodeIterator;
use crate::key_format::{self, NodeKey};
use crate::metrics::metrics;
use crate::node::{Node, NodeId};
use iavl_storage::{Batch, BatchWithFlusher};
use iavl_telemetry::time::Timer;
use iavl_types::error::{ErrorCode, TreeError};
use iavl_types::prelude::OptionExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(super) const PRUNE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The prune watermark handed to the background thread.
#[derive(Debug, Default)]
pub(crate) struct PruneState {
    /// Zero when there is nothing to prune.
    target: i64,
    shutdown: bool,
}

/// Holds the commit gate for one version's deletion and its write.
struct GateGuard<'a>(&'a NodeDb);

impl<'a> GateGuard<'a> {
    fn enter(ndb: &'a NodeDb) -> Self {
        ndb.gate.enter();
        Self(ndb)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.gate.leave();
    }
}

impl NodeDb {
    /// Deletes every version up to and including `to_version`.
    ///
    /// In async mode this only moves the prune watermark; the background thread deletes
    /// and commits each version on its own batch. Otherwise deletions are staged in the
    /// shared batch and written by the next commit.
    pub fn delete_versions_to(&self, to_version: i64) -> Result<(), TreeError> {
        if self.opts.async_pruning {
            let mut state = self.prune.lock();
            state.target = to_version;
            self.prune_cv.notify_all();
            return Ok(());
        }
        let mut batch = self.batch.lock();
        self.delete_versions_to_with(to_version, &mut *batch, false)
    }

    /// The watermark still waiting for the background thread, or 0.
    pub fn pending_prune(&self) -> i64 {
        self.prune.lock().target
    }

    fn delete_versions_to_with(
        &self,
        to_version: i64,
        batch: &mut dyn Batch,
        gated: bool,
    ) -> Result<(), TreeError> {
        let _timer = Timer::new(metrics(), "delete_versions_to");
        let legacy_latest = self.legacy_latest_version()?;
        // Legacy versions are removed all at once, after the watermark passes them.
        if legacy_latest > to_version {
            return Ok(());
        }
        let mut first = self.first_version()?;
        let latest = self.latest_version()?;
        if latest <= to_version {
            return Err(TreeError::PruneLatestVersion {
                latest,
                to_version,
            });
        }
        if let Some((version, readers)) =
            self.active_reader_in(|v| v >= first && v <= to_version)
        {
            return Err(TreeError::ActiveReaders { version, readers });
        }

        if legacy_latest > 0 && legacy_latest >= first {
            let guard = gated.then(|| GateGuard::enter(self));
            self.delete_legacy_versions(legacy_latest, batch)?;
            if gated {
                self.write_batch(batch)?;
            }
            drop(guard);
            first = legacy_latest + 1;
        }

        for version in first..=to_version {
            let guard = gated.then(|| GateGuard::enter(self));
            self.delete_version(version, batch)?;
            if gated {
                self.write_batch(batch)?;
            }
            drop(guard);
            self.reset_first_version(version + 1);
            metrics().inc_versions_deleted(1);
        }
        tracing::info!(target: "nodedb", from = first, to = to_version, "pruned versions");
        Ok(())
    }

    fn write_batch(&self, batch: &mut dyn Batch) -> Result<(), TreeError> {
        if self.opts.sync {
            batch.write_sync()?;
        } else {
            batch.write()?;
        }
        Ok(())
    }

    /// Stages the deletion of every node that `version` owns and `version + 1` does not.
    fn delete_version(&self, version: i64, batch: &mut dyn Batch) -> Result<(), TreeError> {
        let root = self.get_root(version)?;
        let mut pruned = 0u64;
        self.traverse_orphans(version, version + 1, |orphan| {
            let hash = orphan.hash().copied().required(TreeError::EmptyChild)?;
            if orphan.is_legacy() {
                batch.delete(&key_format::legacy_node_key(&hash))?;
                pruned += 1;
                return Ok(());
            }
            let mut nk = orphan.node_key().required(TreeError::NodeMissingNodeKey)?;
            if nk.nonce == 0 {
                // A reformatted root may also survive under its legacy key.
                batch.delete(&key_format::legacy_node_key(&hash))?;
            }
            if nk.nonce == 1 && nk.version < version {
                // The previous version's root has already been moved to nonce 0.
                nk.nonce = 0;
            }
            batch.delete(&key_format::node_key(&nk))?;
            self.clear_node_cache_entry(&NodeId::Versioned(nk));
            pruned += 1;
            Ok(())
        })?;
        metrics().inc_nodes_pruned(pruned);

        let literal = NodeKey::new(version, 1);
        if root != Some(NodeId::Versioned(literal)) {
            // Empty or reference root: only the slot itself belongs to this version.
            batch.delete(&key_format::node_key(&literal))?;
        }

        if self.get_root(version + 1)? == Some(NodeId::Versioned(literal)) {
            let root = self.get_node(&NodeId::Versioned(literal))?;
            batch.delete(&key_format::node_key(&literal))?;
            self.clear_node_cache_entry(&NodeId::Versioned(literal));
            let mut moved = Node::clone(&root);
            moved.node_key = Some(NodeKey::new(version, 0));
            self.save_node_to(batch, Arc::new(moved))?;
        }
        tracing::debug!(target: "nodedb", version, nodes = pruned, "deleted version");
        Ok(())
    }

    /// Calls `f` with every node reachable from `prev_version`'s root but not from
    /// `cur_version`'s, walking both trees in pre-order and skipping shared subtrees.
    pub(crate) fn traverse_orphans(
        &self,
        prev_version: i64,
        cur_version: i64,
        mut f: impl FnMut(&Arc<Node>) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        let mut cur = NodeIterator::new(self, self.get_root(cur_version)?)?;
        let mut prev = NodeIterator::new(self, self.get_root(prev_version)?)?;
        let mut shared: Option<Arc<Node>> = None;
        while let Some(p) = prev.peek().cloned() {
            while shared.is_none() {
                let Some(node) = cur.peek().cloned() else {
                    break;
                };
                if node_version(&node) <= prev_version {
                    cur.advance(true)?;
                    shared = Some(node);
                } else {
                    cur.advance(false)?;
                }
            }
            if shared.as_ref().map_or(false, |s| s.hash() == p.hash()) {
                prev.advance(true)?;
                shared = None;
            } else {
                f(&p)?;
                prev.advance(false)?;
            }
        }
        Ok(())
    }

    /// Stages the removal of all hash-keyed versions at once: the orphans of the last
    /// legacy version, every recorded legacy orphan, and every legacy root. Nothing is
    /// written here; the caller commits the batch with the rest of the prune.
    fn delete_legacy_versions(
        &self,
        legacy_latest: i64,
        batch: &mut dyn Batch,
    ) -> Result<(), TreeError> {
        self.traverse_orphans(legacy_latest, legacy_latest + 1, |orphan| {
            if let Some(hash) = orphan.hash() {
                batch.delete(&key_format::legacy_node_key(hash))?;
            }
            Ok(())
        })?;

        let orphan_prefix = [key_format::LEGACY_ORPHAN_PREFIX];
        let orphan_end = key_format::prefix_end(&orphan_prefix);
        for item in self.db.iterator(Some(&orphan_prefix), orphan_end.as_deref())? {
            let (key, hash) = item?;
            batch.delete(&key)?;
            let Some((to, from, _)) = key_format::parse_legacy_orphan_key(&key) else {
                continue;
            };
            if (from <= legacy_latest && to < legacy_latest) || from > legacy_latest {
                batch.delete(&key_format::legacy_node_key(&hash))?;
            }
        }

        let root_prefix = [key_format::LEGACY_ROOT_PREFIX];
        let root_end = key_format::prefix_end(&root_prefix);
        for item in self.db.iterator(Some(&root_prefix), root_end.as_deref())? {
            let (key, _) = item?;
            batch.delete(&key)?;
        }

        self.reset_legacy_latest_version(Some(0));
        tracing::info!(target: "nodedb", legacy_latest, "staged legacy version deletion");
        Ok(())
    }

    /// Deletes `from_version` and every later version. Used to overwrite history.
    pub fn delete_versions_from(&self, from_version: i64) -> Result<(), TreeError> {
        let latest = self.latest_version()?;
        if latest < from_version {
            return Ok(());
        }
        if let Some((version, readers)) = self.active_reader_in(|v| v >= from_version) {
            return Err(TreeError::ActiveReaders { version, readers });
        }

        let mut batch = self.batch.lock();
        let legacy_latest = self.legacy_latest_version()?;
        let mut start = from_version;
        if legacy_latest >= from_version {
            let lower = key_format::legacy_root_key(from_version);
            let upper = key_format::legacy_root_key(legacy_latest + 1);
            for item in self.db.iterator(Some(&lower), Some(&upper))? {
                let (key, root_hash) = item?;
                let Some(version) = key_format::parse_legacy_root_key(&key) else {
                    continue;
                };
                if let Ok(hash) = <[u8; 32]>::try_from(root_hash.as_slice()) {
                    self.delete_nodes_from(version, &NodeId::Legacy(hash), &mut *batch)?;
                }
                // Legacy orphans are removed together with the other legacy versions.
                batch.delete(&key)?;
            }
            self.reset_legacy_latest_version(None);
            start = legacy_latest + 1;
        }

        let lower = key_format::version_key(start);
        let upper = key_format::version_key(latest.saturating_add(1));
        let mut deleted = 0u64;
        for item in self.db.iterator(Some(&lower), Some(&upper))? {
            let (key, _) = item?;
            batch.delete(&key)?;
            if let Some(nk) = key_format::parse_node_key(&key) {
                self.clear_node_cache_entry(&NodeId::Versioned(nk));
            }
            deleted += 1;
        }

        self.reset_latest_version(from_version - 1);
        if self.versions.lock().first >= from_version {
            self.reset_first_version(0);
        }
        metrics().inc_versions_deleted(u64::try_from(latest - from_version + 1).unwrap_or(0));
        tracing::info!(target: "nodedb", from = from_version, to = latest, keys = deleted, "deleted versions from");
        Ok(())
    }

    /// Deletes a legacy subtree's nodes created at or after `version`.
    fn delete_nodes_from(
        &self,
        version: i64,
        id: &NodeId,
        batch: &mut dyn Batch,
    ) -> Result<(), TreeError> {
        let node = self.get_node(id)?;
        if let Some(left) = &node.left_id {
            self.delete_nodes_from(version, left, batch)?;
        }
        if let Some(right) = &node.right_id {
            self.delete_nodes_from(version, right, batch)?;
        }
        if node_version(&node) >= version {
            batch.delete(&id.store_key())?;
            self.clear_node_cache_entry(id);
        }
        Ok(())
    }

    /// Background entry point: prunes to `to_version` on a private batch, writing
    /// each version as soon as it is deleted.
    fn prune_to(&self, to_version: i64) -> Result<(), TreeError> {
        let mut batch = BatchWithFlusher::new(self.db.clone(), self.opts.flush_threshold);
        self.delete_versions_to_with(to_version, &mut batch, true)
    }
}

fn node_version(node: &Node) -> i64 {
    node.node_key().map_or(0, |nk| nk.version)
}

pub(super) fn spawn(ndb: &Arc<NodeDb>) {
    let weak = Arc::downgrade(ndb);
    match std::thread::Builder::new()
        .name("iavl-pruning".into())
        .spawn(move || run(weak))
    {
        Ok(handle) => *ndb.prune_handle.lock() = Some(handle),
        Err(e) => tracing::error!(target: "nodedb", error = %e, "failed to start pruning thread"),
    }
}

fn run(weak: Weak<NodeDb>) {
    loop {
        let Some(ndb) = weak.upgrade() else {
            return;
        };
        let target = {
            let mut state = ndb.prune.lock();
            if state.target == 0 && !state.shutdown {
                ndb.prune_cv.wait_for(&mut state, PRUNE_POLL_INTERVAL);
            }
            if state.shutdown {
                return;
            }
            state.target
        };
        if target <= 0 {
            continue;
        }
        match ndb.prune_to(target) {
            Ok(()) => {
                let mut state = ndb.prune.lock();
                if state.target <= target {
                    state.target = 0;
                }
            }
            Err(e) => {
                iavl_telemetry::error_metrics().inc_error("prune", e.code());
                tracing::error!(target: "nodedb", to_version = target, error = %e, "background pruning failed");
                let mut state = ndb.prune.lock();
                if !state.shutdown {
                    ndb.prune_cv.wait_for(&mut state, PRUNE_POLL_INTERVAL);
                }
            }
        }
    }
}

pub(super) fn signal_shutdown(ndb: &NodeDb) {
    let mut state = ndb.prune.lock();
    state.shutdown = true;
    ndb.prune_cv.notify_all();
}

pub(super) fn shutdown(ndb: &NodeDb) {
    signal_shutdown(ndb);
    let handle = ndb.prune_handle.lock().take();
    if let Some(handle) = handle {
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            tracing::warn!(target: "nodedb", "pruning thread panicked");
        }
    }
}
