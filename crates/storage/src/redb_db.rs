// Path: crates/storage/src/redb_db.rs
//! A persistent `KvStore` backed by a single redb table.

use crate::kv::{check_key, check_range, Batch, BatchOp, KvIter, KvPair, KvStore};
use crate::metrics::record_commit;
use crate::range::{is_empty_range, ChunkSource, RangeIter};
use iavl_types::error::StorageError;
use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Every tree key lives in one table; the node database namespaces keys by prefix byte.
const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("KV");

struct RedbInner {
    db: Database,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbInner")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedbInner {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn apply(&self, ops: &[BatchOp], sync: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut w = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        if !sync {
            w.set_durability(Durability::Eventual);
        }
        {
            let mut table = w
                .open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            for op in ops {
                match op {
                    BatchOp::Set(k, v) => {
                        table
                            .insert(k.as_slice(), v.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                    BatchOp::Delete(k) => {
                        table
                            .remove(k.as_slice())
                            .map_err(|e| StorageError::Backend(e.to_string()))?;
                    }
                }
            }
        }
        w.commit()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

impl ChunkSource for RedbInner {
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
        let r = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = r
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let range = table
            .range::<&[u8]>((lower, upper))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let ordered: Box<dyn Iterator<Item = _>> = if reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        let mut out = Vec::with_capacity(limit.min(64));
        for item in ordered.take(limit) {
            let (k, v) = item.map_err(|e| StorageError::Backend(e.to_string()))?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }
}

/// A redb-backed database file. Clones share the same open database.
#[derive(Debug, Clone)]
pub struct RedbDb {
    inner: Arc<RedbInner>,
}

impl RedbDb {
    /// Opens or creates the database at `path` and ensures the key table exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Backend(e.to_string()))?;
        {
            let w = db
                .begin_write()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            w.open_table(KV)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            w.commit()
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tracing::debug!(target: "storage", path = %path.as_ref().display(), "opened redb database");
        Ok(Self {
            inner: Arc::new(RedbInner {
                db,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl KvStore for RedbDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        self.inner.ensure_open()?;
        let r = self
            .inner
            .db
            .begin_read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let table = r
            .open_table(KV)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner
            .apply(&[BatchOp::Set(key.to_vec(), value.to_vec())], false)
    }

    fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner
            .apply(&[BatchOp::Set(key.to_vec(), value.to_vec())], true)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner.apply(&[BatchOp::Delete(key.to_vec())], false)
    }

    fn delete_sync(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.inner.apply(&[BatchOp::Delete(key.to_vec())], true)
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
        Box::new(RedbBatch {
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

struct RedbBatch {
    inner: Arc<RedbInner>,
    ops: Vec<BatchOp>,
    size: usize,
    closed: bool,
}

impl RedbBatch {
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
        self.inner.apply(&self.ops, sync)?;
        record_commit(self.size, sync);
        self.closed = true;
        self.ops.clear();
        Ok(())
    }
}

impl Batch for RedbBatch {
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

    #[test]
    fn test_values_survive_reopen() {
        // 1. SETUP
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.redb");

        // 2. ACT
        {
            let db = RedbDb::open(&path).unwrap();
            let mut batch = db.new_batch();
            batch.set(b"s1", b"one").unwrap();
            batch.set(b"s2", b"two").unwrap();
            batch.write_sync().unwrap();
            db.delete(b"s1").unwrap();
        }

        // 3. ASSERT
        let db = RedbDb::open(&path).unwrap();
        assert_eq!(db.get(b"s1").unwrap(), None);
        assert_eq!(db.get(b"s2").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_prefix_iteration_in_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let db = RedbDb::open(dir.path().join("iter.redb")).unwrap();
        for k in [&b"f1"[..], b"f2", b"f3", b"s1"] {
            db.set(k, b"v").unwrap();
        }
        let fwd: Vec<_> = db
            .iterator(Some(b"f"), Some(b"g"))
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(fwd, vec![b"f1".to_vec(), b"f2".to_vec(), b"f3".to_vec()]);

        let rev: Vec<_> = db
            .reverse_iterator(Some(b"f"), Some(b"g"))
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(rev, vec![b"f3".to_vec(), b"f2".to_vec(), b"f1".to_vec()]);
    }
}
