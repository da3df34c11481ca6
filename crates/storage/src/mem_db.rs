// Path: crates/storage/src/mem_db.rs
//! An in-memory `KvStore` over a `BTreeMap`, used by tests and ephemeral trees.

use crate::kv::{check_key, check_range, Batch, BatchOp, KvIter, KvPair, KvStore};
use crate::metrics::record_commit;
use crate::range::{is_empty_range, ChunkSource, RangeIter};
use iavl_types::error::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemInner {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemInner {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn apply(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut map = self.map.write();
        for op in ops {
            match op {
                BatchOp::Set(k, v) => {
                    map.insert(k.clone(), v.clone());
                }
                BatchOp::Delete(k) => {
                    map.remove(k);
                }
            }
        }
        Ok(())
    }
}

impl ChunkSource for MemInner {
    fn read_chunk(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<KvPair>, StorageError> {
        self.ensure_open()?;
        if is_empty_range(lower, upper) {
            return Ok(Vec::new());
        }
        let map = self.map.read();
        let range = map.range::<[u8], _>((lower, upper));
        let clone = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        let chunk = if reverse {
            range.rev().take(limit).map(clone).collect()
        } else {
            range.take(limit).map(clone).collect()
        };
        Ok(chunk)
    }
}

/// A thread-safe in-memory database. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemDb {
    inner: Arc<MemInner>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        self.inner.ensure_open()?;
        Ok(self.inner.map.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        check_key(key)?;
        self.inner.ensure_open()?;
        Ok(self.inner.map.read().contains_key(key))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner
            .apply(&[BatchOp::Set(key.to_vec(), value.to_vec())])
    }

    fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.set(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner.apply(&[BatchOp::Delete(key.to_vec())])
    }

    fn delete_sync(&self, key: &[u8]) -> Result<(), StorageError> {
        self.delete(key)
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIter, StorageError> {
        check_range(start, end)?;
        self.inner.ensure_open()?;
        let source: Arc<dyn ChunkSource> = self.inner.clone();
        Ok(Box::new(RangeIter::new(source, start, end, false)))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter, StorageError> {
        check_range(start, end)?;
        self.inner.ensure_open()?;
        let source: Arc<dyn ChunkSource> = self.inner.clone();
        Ok(Box::new(RangeIter::new(source, start, end, true)))
    }

    fn new_batch(&self) -> Box<dyn Batch> {
        self.new_batch_with_size(0)
    }

    fn new_batch_with_size(&self, size: usize) -> Box<dyn Batch> {
        Box::new(MemBatch {
            inner: self.inner.clone(),
            ops: Vec::with_capacity(size),
            size: 0,
            closed: false,
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemBatch {
    inner: Arc<MemInner>,
    ops: Vec<BatchOp>,
    size: usize,
    closed: bool,
}

impl MemBatch {
    fn push(&mut self, op: BatchOp) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::BatchClosed);
        }
        self.size += op.byte_len();
        self.ops.push(op);
        Ok(())
    }

    fn commit(&mut self, sync: bool) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::BatchClosed);
        }
        self.inner.apply(&self.ops)?;
        record_commit(self.size, sync);
        self.closed = true;
        self.ops.clear();
        Ok(())
    }
}

impl Batch for MemBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.push(BatchOp::Set(key.to_vec(), value.to_vec()))
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.push(BatchOp::Delete(key.to_vec()))
    }

    fn write(&mut self) -> Result<(), StorageError> {
        self.commit(false)
    }

    fn write_sync(&mut self) -> Result<(), StorageError> {
        self.commit(true)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.closed = true;
        self.ops.clear();
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: KvIter) -> Vec<Vec<u8>> {
        iter.map(|r| r.unwrap().0).collect()
    }

    #[test]
    fn test_iterators_respect_half_open_bounds() {
        let db = MemDb::new();
        for k in [b"a", b"b", b"c", b"d"] {
            db.set(k, b"v").unwrap();
        }
        let fwd = collect(db.iterator(Some(b"b"), Some(b"d")).unwrap());
        assert_eq!(fwd, vec![b"b".to_vec(), b"c".to_vec()]);

        let rev = collect(db.reverse_iterator(Some(b"b"), None).unwrap());
        assert_eq!(rev, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);

        // Inverted bounds yield nothing instead of panicking.
        assert!(collect(db.iterator(Some(b"d"), Some(b"a")).unwrap()).is_empty());
    }

    #[test]
    fn test_iteration_spans_multiple_chunks() {
        let db = MemDb::new();
        let n = crate::range::CHUNK_SIZE * 2 + 17;
        for i in 0..n as u32 {
            db.set(&i.to_be_bytes(), b"x").unwrap();
        }
        let keys = collect(db.iterator(None, None).unwrap());
        assert_eq!(keys.len(), n);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        let rev = collect(db.reverse_iterator(None, None).unwrap());
        assert_eq!(rev.len(), n);
        assert_eq!(rev.first(), keys.last());
    }

    #[test]
    fn test_batch_is_atomic_and_single_use() {
        // 1. SETUP
        let db = MemDb::new();
        db.set(b"gone", b"1").unwrap();
        let mut batch = db.new_batch();

        // 2. ACT
        batch.set(b"k", b"v").unwrap();
        batch.delete(b"gone").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
        assert_eq!(batch.size(), 2 + 4);
        batch.write().unwrap();

        // 3. ASSERT
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(!db.has(b"gone").unwrap());
        assert_eq!(batch.set(b"x", b"y"), Err(StorageError::BatchClosed));
    }

    #[test]
    fn test_empty_keys_and_closed_store_are_rejected() {
        let db = MemDb::new();
        assert_eq!(db.set(b"", b"v"), Err(StorageError::EmptyKey));
        assert_eq!(db.get(b"").unwrap_err(), StorageError::EmptyKey);
        db.close().unwrap();
        assert_eq!(db.get(b"k").unwrap_err(), StorageError::Closed);
    }
}
