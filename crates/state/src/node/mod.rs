// Path: crates/state/src/node/mod.rs
//! The tree node: its identity, hashing, storage encoding and structural helpers.
//!
//! A node is either *working* (no node key, children held as in-memory pointers) or
//! *persisted* (node key assigned at save time, children referenced by id and loaded
//! lazily through the node database). Persisted nodes are never mutated; the mutable
//! tree clones them before touching anything.

pub(crate) mod encode;

#[cfg(test)]
mod tests;

use crate::key_format::{self, NodeKey};
use crate::nodedb::NodeDb;
use encode::{put_bytes, put_varint, read_bytes, read_varint};
use iavl_types::error::TreeError;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::sync::Arc;

/// A SHA-256 digest.
pub type Hash = [u8; 32];

const MODE_LEGACY_LEFT: i64 = 0x01;
const MODE_LEGACY_RIGHT: i64 = 0x02;

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// The hash of a tree with no nodes.
pub fn empty_hash() -> Hash {
    sha256(&[])
}

/// How a persisted node is addressed in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeId {
    /// Written by this format: `'s' ‖ version ‖ nonce`.
    Versioned(NodeKey),
    /// Written by the hash-keyed format: `'n' ‖ hash`.
    Legacy(Hash),
}

impl NodeId {
    pub fn store_key(&self) -> Vec<u8> {
        match self {
            NodeId::Versioned(nk) => key_format::node_key(nk),
            NodeId::Legacy(hash) => key_format::legacy_node_key(hash),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeId::Versioned(nk) => write!(f, "{nk}"),
            NodeId::Legacy(hash) => write!(f, "legacy:{}", hex::encode(hash)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) height: i8,
    pub(crate) size: i64,
    pub(crate) hash: OnceCell<Hash>,
    pub(crate) node_key: Option<NodeKey>,
    pub(crate) is_legacy: bool,
    pub(crate) left_id: Option<NodeId>,
    pub(crate) right_id: Option<NodeId>,
    pub(crate) left_node: Option<Arc<Node>>,
    pub(crate) right_node: Option<Arc<Node>>,
}

impl Node {
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
            height: 0,
            size: 1,
            ..Self::default()
        }
    }

    /// An unsaved inner node over two subtrees. Height and size are computed here.
    pub(crate) fn new_inner(key: Vec<u8>, left: Arc<Node>, right: Arc<Node>) -> Self {
        let mut node = Self {
            key,
            left_node: Some(left),
            right_node: Some(right),
            ..Self::default()
        };
        node.refresh_height_and_size_from_pointers();
        node
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn height(&self) -> i8 {
        self.height
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn node_key(&self) -> Option<NodeKey> {
        self.node_key
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub fn is_persisted(&self) -> bool {
        self.node_key.is_some()
    }

    pub fn is_legacy(&self) -> bool {
        self.is_legacy
    }

    /// The cached hash, if it has been computed.
    pub fn hash(&self) -> Option<&Hash> {
        self.hash.get()
    }

    /// The store identity of a persisted node.
    pub fn id(&self) -> Option<NodeId> {
        if self.is_legacy {
            return self.hash.get().map(|h| NodeId::Legacy(*h));
        }
        self.node_key.map(NodeId::Versioned)
    }

    /// Version stamped into the node's hash: its own for persisted nodes, otherwise the
    /// version the pending save will assign.
    pub(crate) fn effective_version(&self, working_version: i64) -> i64 {
        self.node_key.map_or(working_version, |nk| nk.version)
    }

    /// Computes (once) and returns the node hash. Working inner nodes hash their
    /// children first; persisted nodes always carry their hash.
    pub fn hash_with(&self, working_version: i64) -> Result<Hash, TreeError> {
        self.hash
            .get_or_try_init(|| {
                let mut buf = Vec::with_capacity(96 + self.key.len());
                self.write_hash_bytes(&mut buf, working_version)?;
                Ok(sha256(&buf))
            })
            .copied()
    }

    /// The hash preimage: `height ‖ size ‖ version ‖ (bytes(key) ‖ bytes(sha256(value)) |
    /// bytes(left.hash) ‖ bytes(right.hash))`.
    pub(crate) fn write_hash_bytes(
        &self,
        buf: &mut Vec<u8>,
        working_version: i64,
    ) -> Result<(), TreeError> {
        put_varint(buf, i64::from(self.height));
        put_varint(buf, self.size);
        put_varint(buf, self.effective_version(working_version));
        if self.is_leaf() {
            put_bytes(buf, &self.key);
            let value = self.value.as_deref().unwrap_or_default();
            put_bytes(buf, &sha256(value));
        } else {
            let (Some(left), Some(right)) = (&self.left_node, &self.right_node) else {
                return Err(TreeError::EmptyChild);
            };
            put_bytes(buf, &left.hash_with(working_version)?);
            put_bytes(buf, &right.hash_with(working_version)?);
        }
        Ok(())
    }

    /// Storage encoding. Inner nodes must already be hashed and have both child ids.
    pub fn encode(&self) -> Result<Vec<u8>, TreeError> {
        let mut buf = Vec::with_capacity(64 + self.key.len());
        put_varint(&mut buf, i64::from(self.height));
        put_varint(&mut buf, self.size);
        put_bytes(&mut buf, &self.key);
        if self.is_leaf() {
            put_bytes(&mut buf, self.value.as_deref().unwrap_or_default());
            return Ok(buf);
        }
        let hash = self
            .hash
            .get()
            .ok_or_else(|| TreeError::Encode("inner node has no hash".into()))?;
        put_bytes(&mut buf, hash);
        let (Some(left), Some(right)) = (&self.left_id, &self.right_id) else {
            return Err(TreeError::Encode("inner node is missing a child key".into()));
        };
        let mut mode = 0;
        if matches!(left, NodeId::Legacy(_)) {
            mode |= MODE_LEGACY_LEFT;
        }
        if matches!(right, NodeId::Legacy(_)) {
            mode |= MODE_LEGACY_RIGHT;
        }
        put_varint(&mut buf, mode);
        for child in [left, right] {
            match child {
                NodeId::Legacy(hash) => put_bytes(&mut buf, hash),
                NodeId::Versioned(nk) => {
                    put_varint(&mut buf, nk.version);
                    put_varint(&mut buf, i64::from(nk.nonce));
                }
            }
        }
        Ok(buf)
    }

    /// Decodes a node stored under `nk`. Leaf hashes are recomputed, inner hashes are read.
    pub fn decode(nk: NodeKey, bytes: &[u8]) -> Result<Self, TreeError> {
        let mut cursor = bytes;
        let height = read_height(&mut cursor)?;
        let size = read_varint(&mut cursor)?;
        let key = read_bytes(&mut cursor)?;
        let mut node = Node {
            key,
            height,
            size,
            node_key: Some(nk),
            ..Node::default()
        };
        if height == 0 {
            node.value = Some(read_bytes(&mut cursor)?);
            node.hash_with(nk.version)?;
            return Ok(node);
        }
        let hash = read_hash(&mut cursor)?;
        let _ = node.hash.set(hash);
        let mode = read_varint(&mut cursor)?;
        if !(0..=(MODE_LEGACY_LEFT | MODE_LEGACY_RIGHT)).contains(&mode) {
            return Err(TreeError::Decode(format!("invalid child mode {mode}")));
        }
        node.left_id = Some(read_child(&mut cursor, mode & MODE_LEGACY_LEFT != 0)?);
        node.right_id = Some(read_child(&mut cursor, mode & MODE_LEGACY_RIGHT != 0)?);
        Ok(node)
    }

    /// Decodes a node written by the hash-keyed format, stored under `'n' ‖ hash`.
    pub fn decode_legacy(hash: Hash, bytes: &[u8]) -> Result<Self, TreeError> {
        let mut cursor = bytes;
        let height = read_height(&mut cursor)?;
        let size = read_varint(&mut cursor)?;
        let version = read_varint(&mut cursor)?;
        let key = read_bytes(&mut cursor)?;
        let mut node = Node {
            key,
            height,
            size,
            node_key: Some(NodeKey::new(version, 0)),
            is_legacy: true,
            ..Node::default()
        };
        let _ = node.hash.set(hash);
        if height == 0 {
            node.value = Some(read_bytes(&mut cursor)?);
        } else {
            node.left_id = Some(NodeId::Legacy(read_hash(&mut cursor)?));
            node.right_id = Some(NodeId::Legacy(read_hash(&mut cursor)?));
        }
        Ok(node)
    }

    /// Copy-on-write clone of an inner node. The copy holds both children as pointers and
    /// has no hash or node key. Leaves are replaced, not cloned.
    pub(crate) fn clone_inner(&self, ndb: &NodeDb) -> Result<Node, TreeError> {
        if self.is_leaf() {
            return Err(TreeError::CloneLeafNode);
        }
        Ok(Node {
            key: self.key.clone(),
            value: None,
            height: self.height,
            size: self.size,
            hash: OnceCell::new(),
            node_key: None,
            is_legacy: false,
            left_id: None,
            right_id: None,
            left_node: Some(self.left(ndb)?),
            right_node: Some(self.right(ndb)?),
        })
    }

    pub(crate) fn left(&self, ndb: &NodeDb) -> Result<Arc<Node>, TreeError> {
        match (&self.left_node, &self.left_id) {
            (Some(node), _) => Ok(node.clone()),
            (None, Some(id)) => ndb.get_node(id),
            (None, None) => Err(TreeError::EmptyChild),
        }
    }

    pub(crate) fn right(&self, ndb: &NodeDb) -> Result<Arc<Node>, TreeError> {
        match (&self.right_node, &self.right_id) {
            (Some(node), _) => Ok(node.clone()),
            (None, Some(id)) => ndb.get_node(id),
            (None, None) => Err(TreeError::EmptyChild),
        }
    }

    pub(crate) fn set_left(&mut self, node: Arc<Node>) {
        self.left_id = None;
        self.left_node = Some(node);
    }

    pub(crate) fn set_right(&mut self, node: Arc<Node>) {
        self.right_id = None;
        self.right_node = Some(node);
    }

    /// Recomputes height and size from the in-memory children. Only valid on working nodes.
    pub(crate) fn refresh_height_and_size_from_pointers(&mut self) {
        if let (Some(l), Some(r)) = (&self.left_node, &self.right_node) {
            self.height = l.height.max(r.height) + 1;
            self.size = l.size + r.size;
        }
    }

    pub(crate) fn calc_height_and_size(&mut self, ndb: &NodeDb) -> Result<(), TreeError> {
        let left = self.left(ndb)?;
        let right = self.right(ndb)?;
        self.height = left.height.max(right.height) + 1;
        self.size = left.size + right.size;
        Ok(())
    }

    pub(crate) fn calc_balance(&self, ndb: &NodeDb) -> Result<i32, TreeError> {
        let left = self.left(ndb)?;
        let right = self.right(ndb)?;
        Ok(i32::from(left.height) - i32::from(right.height))
    }

    /// Returns `(index, value)`. The index is the key's position when present, or the
    /// number of keys smaller than `key` when absent.
    pub(crate) fn get(self: &Arc<Self>, ndb: &NodeDb, key: &[u8]) -> Result<(i64, Option<Vec<u8>>), TreeError> {
        let mut node = self.clone();
        let mut index = 0i64;
        while !node.is_leaf() {
            if key < node.key.as_slice() {
                node = node.left(ndb)?;
            } else {
                let right = node.right(ndb)?;
                index += node.size - right.size;
                node = right;
            }
        }
        Ok(match node.key.as_slice().cmp(key) {
            Ordering::Less => (index + 1, None),
            Ordering::Greater => (index, None),
            Ordering::Equal => (index, node.value.clone()),
        })
    }

    pub(crate) fn get_by_index(
        self: &Arc<Self>,
        ndb: &NodeDb,
        mut index: i64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        let mut node = self.clone();
        while !node.is_leaf() {
            let left = node.left(ndb)?;
            if index < left.size {
                node = left;
            } else {
                index -= left.size;
                node = node.right(ndb)?;
            }
        }
        if index != 0 {
            return Ok(None);
        }
        Ok(Some((node.key.clone(), node.value.clone().unwrap_or_default())))
    }

    pub(crate) fn has(self: &Arc<Self>, ndb: &NodeDb, key: &[u8]) -> Result<bool, TreeError> {
        let mut node = self.clone();
        while !node.is_leaf() {
            node = if key < node.key.as_slice() {
                node.left(ndb)?
            } else {
                node.right(ndb)?
            };
        }
        Ok(node.key == key)
    }

    /// Checks the structural invariants of a persisted node.
    pub fn validate(&self) -> Result<(), TreeError> {
        let invalid = |msg: &str| Err(TreeError::InvalidNode(msg.to_string()));
        let Some(nk) = self.node_key else {
            return invalid("node key cannot be empty");
        };
        if nk.version <= 0 {
            return invalid("version must be greater than 0");
        }
        if self.height < 0 {
            return invalid("height cannot be less than 0");
        }
        if self.size < 1 {
            return invalid("size must be at least 1");
        }
        let has_children = self.left_id.is_some()
            || self.right_id.is_some()
            || self.left_node.is_some()
            || self.right_node.is_some();
        if self.height == 0 {
            if self.value.is_none() {
                return invalid("value cannot be empty for leaf node");
            }
            if has_children {
                return invalid("leaf node cannot have children");
            }
            if self.size != 1 {
                return invalid("leaf nodes must have size 1");
            }
            return Ok(());
        }
        if self.value.is_some() {
            return invalid("value must be empty for inner node");
        }
        if !has_children {
            return invalid("inner node must have children");
        }
        if let (Some(l), Some(r)) = (&self.left_node, &self.right_node) {
            if self.size != l.size + r.size {
                return invalid("size must equal the sum of the children's sizes");
            }
            if i32::from(self.height) != i32::from(l.height.max(r.height)) + 1 {
                return invalid("height must be one more than the tallest child");
            }
        }
        Ok(())
    }
}

fn read_height(cursor: &mut &[u8]) -> Result<i8, TreeError> {
    let height = read_varint(cursor)?;
    i8::try_from(height).map_err(|_| TreeError::Decode(format!("invalid height {height}")))
}

fn read_hash(cursor: &mut &[u8]) -> Result<Hash, TreeError> {
    let bytes = read_bytes(cursor)?;
    Hash::try_from(bytes.as_slice())
        .map_err(|_| TreeError::Decode(format!("hash has length {}, want 32", bytes.len())))
}

fn read_child(cursor: &mut &[u8], legacy: bool) -> Result<NodeId, TreeError> {
    if legacy {
        return Ok(NodeId::Legacy(read_hash(cursor)?));
    }
    let version = read_varint(cursor)?;
    let nonce = read_varint(cursor)?;
    let nonce = u32::try_from(nonce).map_err(|_| TreeError::Decode(format!("invalid nonce {nonce}")))?;
    Ok(NodeId::Versioned(NodeKey::new(version, nonce)))
}
