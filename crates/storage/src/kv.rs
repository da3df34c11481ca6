// Path: crates/storage/src/kv.rs
//! The ordered key-value contract the node database is written against.

use iavl_types::error::StorageError;

/// An owned key-value pair yielded by iterators.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// A boxed, owned iterator over a key range. Errors are yielded in-band; after an
/// error the iterator is exhausted.
pub type KvIter = Box<dyn Iterator<Item = Result<KvPair, StorageError>> + Send>;

/// An ordered byte-keyed store.
///
/// Ranges are `[start, end)`; `None` means unbounded on that side. Empty keys are
/// rejected by every write and read.
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Fetches the value stored at `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns true if `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// Writes a single entry outside of any batch.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Like [`KvStore::set`], but durably persisted before returning.
    fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Deletes a single entry outside of any batch. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Like [`KvStore::delete`], but durably persisted before returning.
    fn delete_sync(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Ascending iteration over `[start, end)`.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIter, StorageError>;

    /// Descending iteration over `[start, end)`.
    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIter, StorageError>;

    /// Opens an empty write batch.
    fn new_batch(&self) -> Box<dyn Batch>;

    /// Opens an empty write batch with room for about `size` operations.
    fn new_batch_with_size(&self, size: usize) -> Box<dyn Batch>;

    /// Releases the store. Subsequent calls fail with [`StorageError::Closed`].
    fn close(&self) -> Result<(), StorageError>;
}

/// A group of writes applied atomically by `write` or `write_sync`.
///
/// Once written or closed, a batch rejects further operations with
/// [`StorageError::BatchClosed`].
pub trait Batch: Send {
    /// Queues an insert.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    /// Queues a delete.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;
    /// Applies the queued operations.
    fn write(&mut self) -> Result<(), StorageError>;
    /// Applies the queued operations durably.
    fn write_sync(&mut self) -> Result<(), StorageError>;
    /// Discards the queued operations.
    fn close(&mut self) -> Result<(), StorageError>;
    /// Approximate payload size of the queued operations, in bytes.
    fn size(&self) -> usize;
}

pub(crate) fn check_key(key: &[u8]) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::EmptyKey);
    }
    Ok(())
}

pub(crate) fn check_range(start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), StorageError> {
    if matches!(start, Some(s) if s.is_empty()) || matches!(end, Some(e) if e.is_empty()) {
        return Err(StorageError::EmptyKey);
    }
    Ok(())
}

/// A single queued batch operation.
#[derive(Debug, Clone)]
pub(crate) enum BatchOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl BatchOp {
    pub(crate) fn byte_len(&self) -> usize {
        match self {
            BatchOp::Set(k, v) => k.len() + v.len(),
            BatchOp::Delete(k) => k.len(),
        }
    }
}
