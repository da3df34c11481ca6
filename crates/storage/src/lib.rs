// Path: crates/storage/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Ordered key-value storage consumed by the IAVL node database.
//!
//! This crate defines the `KvStore` and `Batch` abstractions, an in-memory `MemDb`,
//! a persistent `RedbDb` backed by a single redb table, and `BatchWithFlusher`,
//! a batch that writes itself out early once it grows past a byte threshold.

pub mod batch;
pub mod kv;
pub mod mem_db;
pub mod metrics;
pub mod redb_db;
mod range;

pub use batch::BatchWithFlusher;
pub use kv::{Batch, KvIter, KvPair, KvStore};
pub use mem_db::MemDb;
pub use redb_db::RedbDb;
