// Path: crates/state/src/node/encode.rs
//! Varint and length-prefixed byte primitives shared by node, fast-node and proof encodings.
//!
//! Signed integers are zigzag varints; byte strings carry an unsigned varint length.

use iavl_types::error::TreeError;
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

#[inline]
fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

#[inline]
fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

pub fn put_varint(buf: &mut Vec<u8>, n: i64) {
    encode_varint(zigzag(n), buf);
}

pub fn put_uvarint(buf: &mut Vec<u8>, n: u64) {
    encode_varint(n, buf);
}

pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

pub fn varint_len(n: i64) -> usize {
    encoded_len_varint(zigzag(n))
}

pub fn bytes_len(bytes: &[u8]) -> usize {
    encoded_len_varint(bytes.len() as u64) + bytes.len()
}

pub fn read_varint(cursor: &mut &[u8]) -> Result<i64, TreeError> {
    decode_varint(cursor)
        .map(unzigzag)
        .map_err(|e| TreeError::Decode(format!("decoding varint: {e}")))
}

pub fn read_uvarint(cursor: &mut &[u8]) -> Result<u64, TreeError> {
    decode_varint(cursor).map_err(|e| TreeError::Decode(format!("decoding uvarint: {e}")))
}

pub fn read_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, TreeError> {
    let len = usize::try_from(read_uvarint(cursor)?)
        .map_err(|_| TreeError::Decode("byte string length overflows usize".into()))?;
    if cursor.len() < len {
        return Err(TreeError::Decode(format!(
            "insufficient bytes: want {len}, have {}",
            cursor.len()
        )));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag_matches_protobuf_sint64() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 0);
        put_varint(&mut buf, -1);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 64);
        assert_eq!(buf, vec![0x00, 0x01, 0x02, 0x80, 0x01]);

        let mut cursor = buf.as_slice();
        let decoded: Vec<i64> = (0..4).map(|_| read_varint(&mut cursor).unwrap()).collect();
        assert_eq!(decoded, vec![0, -1, 1, 64]);
        assert!(cursor.is_empty());
        assert_eq!(varint_len(64), 2);
    }

    #[test]
    fn test_truncated_bytes_fail_to_decode() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        assert_eq!(bytes_len(b"hello"), buf.len());
        buf.truncate(3);
        let err = read_bytes(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, TreeError::Decode(_)));
    }
}
