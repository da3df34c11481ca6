// Path: crates/state/src/import.rs
//! Rebuilds a tree from a post-order [`ExportNode`] stream into an empty database.

use crate::export::ExportNode;
use crate::key_format::{self, NodeKey};
use crate::metrics::metrics;
use crate::mutable_tree::MutableTree;
use crate::node::Node;
use iavl_storage::Batch;
use iavl_telemetry::time::Timer;
use iavl_types::error::{StorageError, TreeError};
use iavl_types::prelude::OptionExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Nodes written per batch before it is handed to the background writer.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// A sink for snapshot nodes, fed in the order a [`crate::export::NodeExporter`] yields them.
pub trait NodeImporter {
    fn add(&mut self, node: ExportNode) -> Result<(), TreeError>;

    /// Writes the final root and loads the imported version into the tree.
    fn commit(&mut self) -> Result<(), TreeError>;
}

/// Reconstructs a tree with a stack: a node whose height exceeds both nodes on top of
/// the stack adopts them as its left and right children.
///
/// Completed subtrees are written as soon as their parent arrives, at most
/// [`MAX_BATCH_SIZE`] nodes per batch, with one batch in flight on a background thread.
pub struct Importer<'a> {
    tree: Option<&'a mut MutableTree>,
    version: i64,
    batch: Box<dyn Batch>,
    batch_size: usize,
    stack: Vec<Arc<Node>>,
    nonces: HashMap<i64, u32>,
    inflight: Option<JoinHandle<Result<(), StorageError>>>,
    imported: u64,
}

impl MutableTree {
    /// Starts importing a snapshot of `version` into this empty tree.
    pub fn import(&mut self, version: i64) -> Result<Importer<'_>, TreeError> {
        Importer::new(self, version)
    }
}

impl<'a> Importer<'a> {
    fn new(tree: &'a mut MutableTree, version: i64) -> Result<Self, TreeError> {
        if version < 0 {
            return Err(TreeError::ImportNegativeVersion);
        }
        let latest = tree.latest_version()?;
        if latest > 0 {
            return Err(TreeError::ImportDatabaseNotEmpty(latest));
        }
        if !tree.is_empty() {
            return Err(TreeError::ImportTreeNotEmpty);
        }
        let batch = tree.node_db().store().new_batch();
        Ok(Self {
            tree: Some(tree),
            version,
            batch,
            batch_size: 0,
            stack: Vec::with_capacity(8),
            nonces: HashMap::new(),
            inflight: None,
            imported: 0,
        })
    }

    fn write_node(&mut self, node: &Node) -> Result<(), TreeError> {
        node.validate()?;
        let nk = node.node_key().required(TreeError::NodeMissingNodeKey)?;
        self.batch.set(&key_format::node_key(&nk), &node.encode()?)?;
        self.batch_size += 1;
        self.imported += 1;
        if self.batch_size >= MAX_BATCH_SIZE {
            self.wait_inflight()?;
            let tree = self.tree.as_ref().required(TreeError::NoImport)?;
            let fresh = tree.node_db().store().new_batch();
            let mut full = std::mem::replace(&mut self.batch, fresh);
            self.batch_size = 0;
            let handle = std::thread::Builder::new()
                .name("iavl-import-flush".into())
                .spawn(move || full.write())
                .map_err(|e| StorageError::Backend(format!("spawn import writer: {e}")))?;
            self.inflight = Some(handle);
        }
        Ok(())
    }

    fn wait_inflight(&mut self) -> Result<(), TreeError> {
        if let Some(handle) = self.inflight.take() {
            handle
                .join()
                .map_err(|_| StorageError::Backend("import writer panicked".into()))??;
        }
        Ok(())
    }

    /// Waits for any in-flight write and discards pending ones. Further calls fail with
    /// [`TreeError::NoImport`].
    pub fn close(&mut self) {
        if let Err(e) = self.wait_inflight() {
            tracing::warn!(target: "import", error = %e, "in-flight import batch failed");
        }
        let _ = self.batch.close();
        self.stack.clear();
        self.tree = None;
    }
}

impl NodeImporter for Importer<'_> {
    fn add(&mut self, export: ExportNode) -> Result<(), TreeError> {
        if self.tree.is_none() {
            return Err(TreeError::NoImport);
        }
        if export.version > self.version {
            return Err(TreeError::ImportNodeVersion {
                node_version: export.version,
                import_version: self.version,
            });
        }
        let mut node = Node {
            key: export.key,
            value: if export.height == 0 {
                Some(export.value.unwrap_or_default())
            } else {
                None
            },
            height: export.height,
            size: 1,
            ..Node::default()
        };

        let len = self.stack.len();
        let children = match (self.stack.get(len.wrapping_sub(2)), self.stack.last()) {
            (Some(l), Some(r)) if l.height < node.height && r.height < node.height => {
                Some((l.clone(), r.clone()))
            }
            _ => None,
        };
        if let Some((left, right)) = children {
            node.size = left.size + right.size;
            node.left_id = left.id();
            node.right_id = right.id();
            node.left_node = Some(left.clone());
            node.right_node = Some(right.clone());
            self.write_node(&left)?;
            self.write_node(&right)?;
            self.stack.truncate(len - 2);
        }

        // Nonce 1 is reserved for the version's root.
        let nonce = self.nonces.entry(export.version).or_insert(0);
        *nonce += 1;
        node.node_key = Some(NodeKey::new(export.version, *nonce + 1));
        node.hash_with(export.version)?;
        node.left_node = None;
        node.right_node = None;

        self.stack.push(Arc::new(node));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TreeError> {
        if self.tree.is_none() {
            return Err(TreeError::NoImport);
        }
        let _timer = Timer::new(metrics(), "import_commit");
        let root_slot = key_format::node_key(&NodeKey::new(self.version, 1));
        match self.stack.len() {
            0 => self.batch.set(&root_slot, &[])?,
            1 => {
                let top = self.stack.pop().required(TreeError::ImportStackSize(0))?;
                let mut root = Node::clone(&top);
                let root_version = root.node_key().map_or(self.version, |nk| nk.version);
                let root_key = NodeKey::new(root_version, 1);
                root.node_key = Some(root_key);
                self.write_node(&root)?;
                if root_version < self.version {
                    // Nothing changed at the imported version; point its slot at the root.
                    self.batch.set(&root_slot, &key_format::node_key(&root_key))?;
                }
            }
            n => return Err(TreeError::ImportStackSize(n)),
        }

        self.wait_inflight()?;
        self.batch.write_sync()?;
        metrics().inc_nodes_saved(self.imported);

        let version = self.version;
        let imported = self.imported;
        let tree = self.tree.take().required(TreeError::NoImport)?;
        tree.node_db().reset_latest_version(version);
        tree.load_version(version)?;
        tracing::info!(target: "import", version, nodes = imported, "imported snapshot");
        self.close();
        Ok(())
    }
}

impl Drop for Importer<'_> {
    fn drop(&mut self) {
        if self.tree.is_some() || self.inflight.is_some() {
            self.close();
        }
    }
}
