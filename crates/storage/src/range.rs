// Path: crates/storage/src/range.rs
//! A lazy range iterator that pulls bounded chunks from a backend.
//!
//! Each chunk is read under its own short-lived read lock or transaction, and the
//! cursor resumes strictly after the last key returned, so writes that land behind
//! the cursor never disturb iteration.

use crate::kv::KvPair;
use iavl_types::error::StorageError;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

pub(crate) const CHUNK_SIZE: usize = 1024;

/// Reads at most `limit` entries inside `(lower, upper)`, in the requested order.
pub(crate) trait ChunkSource: Send + Sync {
    fn read_chunk(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Result<Vec<KvPair>, StorageError>;
}

pub(crate) struct RangeIter {
    source: Arc<dyn ChunkSource>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    reverse: bool,
    buffer: VecDeque<KvPair>,
    exhausted: bool,
}

impl RangeIter {
    pub(crate) fn new(
        source: Arc<dyn ChunkSource>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Self {
        Self {
            source,
            lower: start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec())),
            upper: end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec())),
            reverse,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<(), StorageError> {
        let chunk = self.source.read_chunk(
            as_ref_bound(&self.lower),
            as_ref_bound(&self.upper),
            self.reverse,
            CHUNK_SIZE,
        )?;
        if chunk.len() < CHUNK_SIZE {
            self.exhausted = true;
        }
        if let Some((last, _)) = chunk.last() {
            if self.reverse {
                self.upper = Bound::Excluded(last.clone());
            } else {
                self.lower = Bound::Excluded(last.clone());
            }
        }
        self.buffer.extend(chunk);
        Ok(())
    }
}

impl Iterator for RangeIter {
    type Item = Result<KvPair, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

pub(crate) fn as_ref_bound(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// True when no key can satisfy both bounds. `BTreeMap::range` panics on such input.
pub(crate) fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}
