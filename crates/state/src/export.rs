// Path: crates/state/src/export.rs
//! Streaming snapshot export: one [`ExportNode`] per tree node, children before parents.

use crate::immutable_tree::ImmutableTree;
use crate::iterator::Traversal;
use crate::nodedb::VersionReader;
use iavl_types::error::TreeError;
use iavl_types::prelude::OptionExt;
use parity_scale_codec::{Decode, Encode};
use std::sync::Arc;

/// The unit of a snapshot. The tree shape is recovered from heights alone, so no child
/// references are carried. `value` is `Some` exactly for leaves.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ExportNode {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub version: i64,
    pub height: i8,
}

/// A source of snapshot nodes in depth-first post-order. `Ok(None)` marks the end.
pub trait NodeExporter {
    fn next_node(&mut self) -> Result<Option<ExportNode>, TreeError>;
}

/// Walks a saved tree lazily in post-order. The exported version cannot be pruned while
/// the exporter is alive.
pub struct Exporter {
    traversal: Traversal,
    done: bool,
    _reader: Arc<VersionReader>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter").field("done", &self.done).finish_non_exhaustive()
    }
}

impl ImmutableTree {
    /// Exports this saved version. An empty tree exports no nodes.
    pub fn export(&self) -> Exporter {
        let reader = match &self.reader {
            Some(reader) => reader.clone(),
            None => Arc::new(self.ndb.reader(self.version)),
        };
        Exporter {
            traversal: Traversal::new(
                self.ndb.clone(),
                self.root.clone(),
                None,
                None,
                true,
                false,
                true,
            ),
            done: false,
            _reader: reader,
        }
    }
}

impl NodeExporter for Exporter {
    fn next_node(&mut self) -> Result<Option<ExportNode>, TreeError> {
        if self.done {
            return Ok(None);
        }
        let node = match self.traversal.next_node() {
            Ok(Some(node)) => node,
            Ok(None) => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };
        // Only saved trees can be exported; unsaved nodes have no version yet.
        let nk = node.node_key().required(TreeError::NodeMissingNodeKey)?;
        Ok(Some(ExportNode {
            key: node.key().to_vec(),
            value: node.is_leaf().then(|| node.value().unwrap_or_default().to_vec()),
            version: nk.version,
            height: node.height(),
        }))
    }
}

impl Iterator for Exporter {
    type Item = Result<ExportNode, TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_node().transpose()
    }
}
