// Path: crates/state/src/fast_node.rs
//! Entries of the flat fast index: the latest value of a key and the version that wrote it.

use crate::node::encode::{bytes_len, put_bytes, put_varint, read_bytes, read_varint, varint_len};
use iavl_types::error::TreeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastNode {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version_last_updated_at: i64,
}

impl FastNode {
    pub fn new(key: Vec<u8>, value: Vec<u8>, version: i64) -> Self {
        Self {
            key,
            value,
            version_last_updated_at: version,
        }
    }

    /// `varint(version) ‖ bytes(value)`; the key lives in the store key.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            varint_len(self.version_last_updated_at) + bytes_len(&self.value),
        );
        put_varint(&mut buf, self.version_last_updated_at);
        put_bytes(&mut buf, &self.value);
        buf
    }

    pub fn decode(key: Vec<u8>, bytes: &[u8]) -> Result<Self, TreeError> {
        let mut cursor = bytes;
        let version = read_varint(&mut cursor)
            .map_err(|e| TreeError::Decode(format!("decoding fast node version: {e}")))?;
        let value = read_bytes(&mut cursor)
            .map_err(|e| TreeError::Decode(format!("decoding fast node value: {e}")))?;
        Ok(Self::new(key, value, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_layout() {
        let node = FastNode::new(b"key".to_vec(), b"val".to_vec(), 5);
        let bytes = node.encode();
        assert_eq!(bytes, vec![10, 3, b'v', b'a', b'l']);
        assert_eq!(FastNode::decode(b"key".to_vec(), &bytes).unwrap(), node);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(FastNode::decode(b"k".to_vec(), &[0x02, 0x09]).is_err());
    }
}
