// Path: crates/state/src/compress.rs
//! A compact snapshot encoding layered over any exporter or importer.
//!
//! Inner node keys are dropped (each equals the smallest key of its right subtree), leaf
//! keys are stored as `uvarint(shared prefix length) ‖ suffix` against the previous leaf,
//! and inner node versions as the difference from the larger child version.

use crate::export::{ExportNode, NodeExporter};
use crate::import::NodeImporter;
use crate::node::encode::{put_uvarint, read_uvarint};
use iavl_types::error::TreeError;

fn delta_encode(key: &[u8], last_key: &[u8]) -> Vec<u8> {
    let shared = key
        .iter()
        .zip(last_key)
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = Vec::with_capacity(key.len() - shared + 2);
    put_uvarint(&mut out, shared as u64);
    out.extend_from_slice(key.get(shared..).unwrap_or_default());
    out
}

fn delta_decode(encoded: &[u8], last_key: &[u8]) -> Result<Vec<u8>, TreeError> {
    let mut cursor = encoded;
    let shared = read_uvarint(&mut cursor)?;
    let prefix = usize::try_from(shared)
        .ok()
        .and_then(|n| last_key.get(..n))
        .ok_or_else(|| TreeError::Decode(format!("shared prefix {shared} exceeds previous key")))?;
    let mut key = Vec::with_capacity(prefix.len() + cursor.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(cursor);
    Ok(key)
}

/// Compresses the stream of another exporter.
pub struct CompressExporter<E> {
    inner: E,
    last_key: Vec<u8>,
    versions: Vec<i64>,
}

impl<E: NodeExporter> CompressExporter<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            last_key: Vec::new(),
            versions: Vec::new(),
        }
    }
}

impl<E: NodeExporter> NodeExporter for CompressExporter<E> {
    fn next_node(&mut self) -> Result<Option<ExportNode>, TreeError> {
        let Some(mut node) = self.inner.next_node()? else {
            return Ok(None);
        };
        if node.height == 0 {
            let encoded = delta_encode(&node.key, &self.last_key);
            self.last_key = std::mem::replace(&mut node.key, encoded);
            self.versions.push(node.version);
            return Ok(Some(node));
        }
        let (Some(right), Some(left)) = (self.versions.pop(), self.versions.pop()) else {
            return Err(TreeError::Encode("branch node exported before its children".into()));
        };
        self.versions.push(node.version);
        node.version -= left.max(right);
        node.key.clear();
        Ok(Some(node))
    }
}

/// Restores compressed nodes before handing them to another importer.
pub struct CompressImporter<I> {
    inner: I,
    last_key: Vec<u8>,
    min_keys: Vec<Vec<u8>>,
    versions: Vec<i64>,
}

impl<I: NodeImporter> CompressImporter<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            last_key: Vec::new(),
            min_keys: Vec::new(),
            versions: Vec::new(),
        }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

impl<I: NodeImporter> NodeImporter for CompressImporter<I> {
    fn add(&mut self, mut node: ExportNode) -> Result<(), TreeError> {
        if node.height == 0 {
            let key = delta_decode(&node.key, &self.last_key)?;
            self.last_key = key.clone();
            self.min_keys.push(key.clone());
            self.versions.push(node.version);
            node.key = key;
            return self.inner.add(node);
        }
        let stack = self.min_keys.len();
        let (Some(right_min), Some(left_min)) = (self.min_keys.pop(), self.min_keys.pop()) else {
            return Err(TreeError::ImportStackSize(stack));
        };
        let (Some(right), Some(left)) = (self.versions.pop(), self.versions.pop()) else {
            return Err(TreeError::ImportStackSize(stack));
        };
        node.key = right_min;
        node.version += left.max(right);
        self.min_keys.push(left_min);
        self.versions.push(node.version);
        self.inner.add(node)
    }

    fn commit(&mut self) -> Result<(), TreeError> {
        self.inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_keys() {
        let encoded = delta_encode(b"apple", b"apricot");
        assert_eq!(encoded, [&[2u8][..], b"ple"].concat());
        assert_eq!(delta_decode(&encoded, b"apricot").unwrap(), b"apple");

        let first = delta_encode(b"key", b"");
        assert_eq!(delta_decode(&first, b"").unwrap(), b"key");
    }

    #[test]
    fn test_delta_decode_rejects_long_prefix() {
        let encoded = delta_encode(b"abcdef", b"abcdef");
        assert!(delta_decode(&encoded, b"ab").is_err());
    }
}
