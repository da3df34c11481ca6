// Path: crates/state/src/lib.rs
//! # IAVL State Crate Lints
//!
//! This crate enforces a strict set of lints to ensure high-quality,
//! panic-free code. Panics are disallowed in non-test code to promote
//! robust error handling.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]
//! # IAVL State
//!
//! A versioned, persistent, authenticated AVL+ tree. Every saved version is an
//! immutable snapshot sharing unchanged subtrees with its neighbours; the root hash
//! commits to the full contents and supports ICS-23 membership proofs.
//!
//! The layers, bottom up:
//! - [`node`]: node identity, hashing and storage encoding.
//! - [`nodedb`]: node persistence, caching, version bookkeeping and pruning.
//! - [`ImmutableTree`] / [`MutableTree`]: reads of a saved version and the
//!   copy-on-write working tree.
//! - [`proof`], [`export`], [`import`], [`compress`], [`diff`]: proofs, snapshots and
//!   change sets built on top of the trees.

mod cache;
pub mod compress;
pub mod diff;
pub mod export;
pub mod fast_node;
pub mod immutable_tree;
pub mod import;
pub mod iterator;
pub mod key_format;
pub mod metrics;
pub mod mutable_tree;
pub mod node;
pub mod nodedb;
pub mod proof;

pub use compress::{CompressExporter, CompressImporter};
pub use diff::{ChangePair, ChangeSet};
pub use export::{ExportNode, Exporter, NodeExporter};
pub use immutable_tree::ImmutableTree;
pub use import::{Importer, NodeImporter};
pub use iterator::{KvPair, TreeIter};
pub use key_format::NodeKey;
pub use mutable_tree::MutableTree;
pub use node::{Hash, Node, NodeId};
pub use nodedb::{NodeDb, VersionReader};
pub use proof::{CommitmentProof, ExistenceProof, NonExistenceProof, ProofSpec, RangeProof};

/// A prelude for easily importing the most common types.
pub mod prelude {
    pub use crate::{
        ChangeSet, CommitmentProof, ExportNode, ImmutableTree, MutableTree, NodeExporter,
        NodeImporter, ProofSpec,
    };
    pub use iavl_storage::{KvStore, MemDb, RedbDb};
    pub use iavl_types::config::TreeOptions;
    pub use iavl_types::error::TreeError;
}
