// Path: crates/storage/src/batch.rs
//! A write batch that flushes itself once its payload crosses a byte threshold.

use crate::kv::{Batch, KvStore};
use crate::metrics::metrics;
use iavl_types::error::StorageError;
use std::sync::Arc;

/// Wraps a backend batch and writes it out whenever the next operation would push
/// its size to `flush_threshold` bytes or more, then continues in a fresh batch.
///
/// Unlike a plain [`Batch`], this type stays usable after `write`: the inner batch is
/// replaced so the node database can keep a single long-lived handle.
pub struct BatchWithFlusher {
    db: Arc<dyn KvStore>,
    batch: Box<dyn Batch>,
    flush_threshold: usize,
    closed: bool,
}

impl std::fmt::Debug for BatchWithFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWithFlusher")
            .field("size", &self.batch.size())
            .field("flush_threshold", &self.flush_threshold)
            .finish()
    }
}

impl BatchWithFlusher {
    pub fn new(db: Arc<dyn KvStore>, flush_threshold: usize) -> Self {
        let batch = db.new_batch();
        Self {
            db,
            batch,
            flush_threshold,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::BatchClosed);
        }
        Ok(())
    }

    fn flush_if_needed(&mut self, incoming: usize) -> Result<(), StorageError> {
        if self.batch.size() > 0 && self.batch.size() + incoming >= self.flush_threshold {
            tracing::trace!(
                target: "storage",
                size = self.batch.size(),
                threshold = self.flush_threshold,
                "flushing write batch"
            );
            self.batch.write()?;
            self.batch = self.db.new_batch();
            metrics().inc_batch_flushes();
        }
        Ok(())
    }

    fn finish(&mut self, sync: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        if sync {
            self.batch.write_sync()?;
        } else {
            self.batch.write()?;
        }
        self.batch = self.db.new_batch();
        Ok(())
    }
}

impl Batch for BatchWithFlusher {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.flush_if_needed(key.len() + value.len())?;
        self.batch.set(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.flush_if_needed(key.len())?;
        self.batch.delete(key)
    }

    fn write(&mut self) -> Result<(), StorageError> {
        self.finish(false)
    }

    fn write_sync(&mut self) -> Result<(), StorageError> {
        self.finish(true)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.closed = true;
        self.batch.close()
    }

    fn size(&self) -> usize {
        self.batch.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemDb;
    use proptest::prelude::*;

    #[test]
    fn test_flushes_when_threshold_reached() {
        // 1. SETUP
        let mem = MemDb::new();
        let db: Arc<dyn KvStore> = Arc::new(mem.clone());
        let mut batch = BatchWithFlusher::new(db, 10);

        // 2. ACT
        batch.set(b"k1", b"aaaa").unwrap(); // 6 bytes pending
        assert!(mem.is_empty());
        batch.set(b"k2", b"bbbb").unwrap(); // 12 >= 10, first entry flushed

        // 3. ASSERT
        assert_eq!(mem.get(b"k1").unwrap(), Some(b"aaaa".to_vec()));
        assert_eq!(mem.get(b"k2").unwrap(), None);
        assert_eq!(batch.size(), 6);

        batch.write().unwrap();
        assert_eq!(mem.get(b"k2").unwrap(), Some(b"bbbb".to_vec()));
        assert_eq!(batch.size(), 0);

        // Still usable after a write.
        batch.delete(b"k1").unwrap();
        batch.write_sync().unwrap();
        assert!(!mem.has(b"k1").unwrap());
    }

    #[test]
    fn test_closed_flusher_rejects_writes() {
        let db: Arc<dyn KvStore> = Arc::new(MemDb::new());
        let mut batch = BatchWithFlusher::new(db, 1024);
        batch.close().unwrap();
        assert_eq!(batch.set(b"k", b"v"), Err(StorageError::BatchClosed));
        assert_eq!(batch.write(), Err(StorageError::BatchClosed));
    }

    proptest! {
        #[test]
        fn prop_flushing_never_loses_writes(
            entries in proptest::collection::btree_map(
                proptest::collection::vec(any::<u8>(), 1..8),
                proptest::collection::vec(any::<u8>(), 0..16),
                0..64,
            ),
            threshold in 1usize..64,
        ) {
            let mem = MemDb::new();
            let db: Arc<dyn KvStore> = Arc::new(mem.clone());
            let mut batch = BatchWithFlusher::new(db, threshold);
            for (k, v) in &entries {
                batch.set(k, v).unwrap();
            }
            batch.write().unwrap();
            prop_assert_eq!(mem.len(), entries.len());
            for (k, v) in &entries {
                prop_assert_eq!(mem.get(k).unwrap(), Some(v.clone()));
            }
        }
    }
}
