// Path: crates/state/src/key_format.rs
//! Byte layouts of every key the node database writes to the backing store.
//!
//! All integers are big-endian so that the store's lexicographic order matches the
//! numeric order of versions and nonces.

use std::fmt;

/// Nodes: `'s' ‖ version(8) ‖ nonce(4)`. A bare `'s' ‖ version(8)` entry is a reference root.
pub const NODE_PREFIX: u8 = b's';
/// Fast index: `'f' ‖ key`.
pub const FAST_PREFIX: u8 = b'f';
/// Metadata: `'m' ‖ name`.
pub const METADATA_PREFIX: u8 = b'm';
/// Legacy nodes: `'n' ‖ sha256`.
pub const LEGACY_NODE_PREFIX: u8 = b'n';
/// Legacy orphans: `'o' ‖ to_version(8) ‖ from_version(8) ‖ sha256`.
pub const LEGACY_ORPHAN_PREFIX: u8 = b'o';
/// Legacy roots: `'r' ‖ version(8)`.
pub const LEGACY_ROOT_PREFIX: u8 = b'r';

pub(crate) const HASH_LEN: usize = 32;
pub(crate) const NODE_KEY_LEN: usize = 12;

/// The persistent address of a node: the version that created it and its position among
/// the nodes saved in that version. Roots carry nonce 1, or 0 once reformatted by pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub version: i64,
    pub nonce: u32,
}

impl NodeKey {
    pub fn new(version: i64, nonce: u32) -> Self {
        Self { version, nonce }
    }

    /// The 12-byte big-endian form used inside store keys and reference roots.
    pub fn to_bytes(&self) -> [u8; NODE_KEY_LEN] {
        let mut out = [0u8; NODE_KEY_LEN];
        let (v, n) = out.split_at_mut(8);
        v.copy_from_slice(&self.version.to_be_bytes());
        n.copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != NODE_KEY_LEN {
            return None;
        }
        let (v, n) = bytes.split_at(8);
        Some(Self {
            version: i64::from_be_bytes(v.try_into().ok()?),
            nonce: u32::from_be_bytes(n.try_into().ok()?),
        })
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.version, self.nonce)
    }
}

pub fn node_key(nk: &NodeKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + NODE_KEY_LEN);
    out.push(NODE_PREFIX);
    out.extend_from_slice(&nk.to_bytes());
    out
}

/// `'s' ‖ version`: the reference-root slot of a version, and the prefix of all its nodes.
pub fn version_key(version: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(NODE_PREFIX);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

pub fn fast_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(FAST_PREFIX);
    out.extend_from_slice(key);
    out
}

pub fn metadata_key(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + name.len());
    out.push(METADATA_PREFIX);
    out.extend_from_slice(name);
    out
}

pub fn legacy_node_key(hash: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + hash.len());
    out.push(LEGACY_NODE_PREFIX);
    out.extend_from_slice(hash);
    out
}

pub fn legacy_root_key(version: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(LEGACY_ROOT_PREFIX);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

pub fn legacy_orphan_key(to_version: i64, from_version: i64, hash: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + hash.len());
    out.push(LEGACY_ORPHAN_PREFIX);
    out.extend_from_slice(&to_version.to_be_bytes());
    out.extend_from_slice(&from_version.to_be_bytes());
    out.extend_from_slice(hash);
    out
}

/// Exclusive upper bound for a scan over every key beginning with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn read_i64(bytes: &[u8]) -> Option<i64> {
    Some(i64::from_be_bytes(bytes.get(..8)?.try_into().ok()?))
}

/// Decodes the address of a `'s'` entry; bare version keys yield nonce 0.
pub fn parse_node_key(key: &[u8]) -> Option<NodeKey> {
    match key.split_first() {
        Some((&NODE_PREFIX, rest)) if rest.len() == NODE_KEY_LEN => NodeKey::from_bytes(rest),
        Some((&NODE_PREFIX, rest)) if rest.len() == 8 => Some(NodeKey::new(read_i64(rest)?, 0)),
        _ => None,
    }
}

pub fn parse_legacy_root_key(key: &[u8]) -> Option<i64> {
    match key.split_first() {
        Some((&LEGACY_ROOT_PREFIX, rest)) if rest.len() == 8 => read_i64(rest),
        _ => None,
    }
}

/// Returns `(to_version, from_version, hash)`.
pub fn parse_legacy_orphan_key(key: &[u8]) -> Option<(i64, i64, &[u8])> {
    match key.split_first() {
        Some((&LEGACY_ORPHAN_PREFIX, rest)) if rest.len() == 16 + HASH_LEN => {
            let to = read_i64(rest)?;
            let from = read_i64(rest.get(8..)?)?;
            Some((to, from, rest.get(16..)?))
        }
        _ => None,
    }
}
