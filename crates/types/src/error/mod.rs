// Path: crates/types/src/error/mod.rs
//! Core error types for the IAVL workspace.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors raised by a key-value backend consumed by the tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A generic error originating from the underlying key-value store backend (e.g., redb).
    #[error("backend error: {0}")]
    Backend(String),
    /// An error occurred while serializing data for storage.
    #[error("encode error: {0}")]
    Encode(String),
    /// An error occurred while deserializing data from storage.
    #[error("decode error: {0}")]
    Decode(String),
    /// Keys must be non-empty.
    #[error("key cannot be empty")]
    EmptyKey,
    /// The store has been closed and can no longer be used.
    #[error("store is closed")]
    Closed,
    /// The batch was already written or closed.
    #[error("batch has been written or closed")]
    BatchClosed,
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORAGE_BACKEND_ERROR",
            Self::Encode(_) => "STORAGE_ENCODE_ERROR",
            Self::Decode(_) => "STORAGE_DECODE_ERROR",
            Self::EmptyKey => "STORAGE_EMPTY_KEY",
            Self::Closed => "STORAGE_CLOSED",
            Self::BatchClosed => "STORAGE_BATCH_CLOSED",
        }
    }
}

/// Errors related to proof construction and verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    /// An error occurred during proof deserialization.
    #[error("Proof deserialization failed: {0}")]
    Deserialization(String),
    /// An error occurred while encoding a proof preimage.
    #[error("Proof encoding failed: {0}")]
    Encode(String),
    /// The recomputed root hash from the proof did not match the trusted root.
    #[error("Root hash mismatch")]
    RootMismatch,
    /// A proof of non-existence was structurally invalid.
    #[error("Invalid non-existence proof: {0}")]
    InvalidNonExistence(String),
    /// A proof of existence was structurally invalid.
    #[error("Invalid existence proof: {0}")]
    InvalidExistence(String),
    /// The proof's operations do not match the IAVL proof spec.
    #[error("Proof does not match spec: {0}")]
    SpecMismatch(String),
    /// A range proof was malformed.
    #[error("Invalid range proof: {0}")]
    InvalidRangeProof(String),
    /// A range proof was queried before its root was verified.
    #[error("Range proof root has not been verified")]
    RootNotVerified,
    /// A proof's hash length was invalid.
    #[error("Invalid hash length: expected {expected}, got {got}")]
    InvalidHashLength {
        /// The expected length in bytes.
        expected: usize,
        /// The actual length in bytes.
        got: usize,
    },
}

impl ErrorCode for ProofError {
    fn code(&self) -> &'static str {
        match self {
            Self::Deserialization(_) => "PROOF_DESERIALIZATION_FAILED",
            Self::Encode(_) => "PROOF_ENCODE_FAILED",
            Self::RootMismatch => "PROOF_ROOT_MISMATCH",
            Self::InvalidNonExistence(_) => "PROOF_INVALID_NON_EXISTENCE",
            Self::InvalidExistence(_) => "PROOF_INVALID_EXISTENCE",
            Self::SpecMismatch(_) => "PROOF_SPEC_MISMATCH",
            Self::InvalidRangeProof(_) => "PROOF_INVALID_RANGE",
            Self::RootNotVerified => "PROOF_ROOT_NOT_VERIFIED",
            Self::InvalidHashLength { .. } => "PROOF_INVALID_HASH_LENGTH",
        }
    }
}

// Allow `?` to convert prost errors while building proof preimages.
impl From<prost::EncodeError> for ProofError {
    fn from(e: prost::EncodeError) -> Self {
        ProofError::Encode(format!("Prost encode error: {}", e))
    }
}

/// Errors raised by the node database, the immutable and mutable trees, and the
/// import/export machinery.
#[derive(Error, Debug)]
pub enum TreeError {
    /// Failure reported by the key-value backend.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Failure while building or verifying a proof.
    #[error(transparent)]
    Proof(#[from] ProofError),
    /// The requested version has never been saved or has been pruned.
    #[error("version does not exist")]
    VersionDoesNotExist,
    /// A node was handed to the node database before it had been assigned a node key.
    #[error("node does not have a nodekey")]
    NodeMissingNodeKey,
    /// Only inner nodes can be cloned for copy-on-write.
    #[error("attempt to copy a leaf node")]
    CloneLeafNode,
    /// An inner node was hashed or encoded without both children.
    #[error("node has empty child")]
    EmptyChild,
    /// A node referenced by its parent or by a root pointer is absent from the store.
    #[error("value missing for node key {key}")]
    NodeNotFound {
        /// Hex encoding of the node identity that was looked up.
        key: String,
    },
    /// Stored bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A node could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
    /// A node violated a structural invariant.
    #[error("invalid node: {0}")]
    InvalidNode(String),
    /// Keys written to the tree must be non-empty.
    #[error("key cannot be empty")]
    EmptyKey,
    /// A version was resubmitted with a different root hash than the one persisted.
    #[error("version {version} was already saved to different hash {hash}")]
    VersionConflict {
        /// The conflicting version.
        version: i64,
        /// Hex encoding of the newly computed working hash.
        hash: String,
    },
    /// Versions still opened by readers cannot be deleted.
    #[error("unable to delete version {version} with {readers} active readers")]
    ActiveReaders {
        /// The version that is still being read.
        version: i64,
        /// Number of outstanding readers.
        readers: u32,
    },
    /// Pruning must always leave at least the latest version.
    #[error("latest version {latest} is less than or equal to toVersion {to_version}")]
    PruneLatestVersion {
        /// The latest persisted version.
        latest: i64,
        /// The requested upper bound of the deletion.
        to_version: i64,
    },
    /// The configured initial version is above the first persisted version.
    #[error("initial version set to {initial}, but found earlier version {first}")]
    InitialVersionConflict {
        /// Configured initial version.
        initial: u64,
        /// First version found on disk.
        first: i64,
    },
    /// A load targeted a version beyond the latest persisted one.
    #[error("wanted to load target {target} but only found up to {latest}")]
    TargetVersionAhead {
        /// Requested version.
        target: i64,
        /// Latest persisted version.
        latest: i64,
    },
    /// A load targeted a specific version on an empty database.
    #[error("no versions found while trying to load {0}")]
    NoVersionsFound(i64),
    /// Import operations were used after commit or close.
    #[error("no import in progress")]
    NoImport,
    /// Import requires a tree without any persisted or working state.
    #[error("tree must be empty")]
    ImportTreeNotEmpty,
    /// Import requires a database without any versions.
    #[error("found database at version {0}, must be 0")]
    ImportDatabaseNotEmpty(i64),
    /// Import version must be non-negative.
    #[error("imported version cannot be negative")]
    ImportNegativeVersion,
    /// An exported node claimed a version above the version being imported.
    #[error("node version {node_version} can't be greater than import version {import_version}")]
    ImportNodeVersion {
        /// Version carried by the node.
        node_version: i64,
        /// Version being imported.
        import_version: i64,
    },
    /// The node stream did not reduce to a single root.
    #[error("invalid node structure, found stack size {0} when committing")]
    ImportStackSize(usize),
    /// The fast index was consulted before the storage was upgraded.
    #[error("storage version is not fast")]
    NotFastStorage,
    /// The persisted storage version string is malformed.
    #[error("invalid storage version: {0}")]
    InvalidStorageVersion(String),
    /// A change set can only be replayed on top of a clean tree.
    #[error("cannot save changeset with uncommitted changes")]
    UncommittedChanges,
    /// A change set deleted a key that does not exist.
    #[error("attempted to remove non-existent key {0}")]
    RemoveMissingKey(String),
    /// Range queries need `start < end` when both bounds are present.
    #[error("invalid range: start must be less than end")]
    InvalidRange,
    /// The node database or tree was closed.
    #[error("tree is closed")]
    Closed,
}

impl ErrorCode for TreeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code(),
            Self::Proof(e) => e.code(),
            Self::VersionDoesNotExist => "TREE_VERSION_DOES_NOT_EXIST",
            Self::NodeMissingNodeKey => "TREE_NODE_MISSING_NODE_KEY",
            Self::CloneLeafNode => "TREE_CLONE_LEAF_NODE",
            Self::EmptyChild => "TREE_EMPTY_CHILD",
            Self::NodeNotFound { .. } => "TREE_NODE_NOT_FOUND",
            Self::Decode(_) => "TREE_DECODE_ERROR",
            Self::Encode(_) => "TREE_ENCODE_ERROR",
            Self::InvalidNode(_) => "TREE_INVALID_NODE",
            Self::EmptyKey => "TREE_EMPTY_KEY",
            Self::VersionConflict { .. } => "TREE_VERSION_CONFLICT",
            Self::ActiveReaders { .. } => "TREE_ACTIVE_READERS",
            Self::PruneLatestVersion { .. } => "TREE_PRUNE_LATEST_VERSION",
            Self::InitialVersionConflict { .. } => "TREE_INITIAL_VERSION_CONFLICT",
            Self::TargetVersionAhead { .. } => "TREE_TARGET_VERSION_AHEAD",
            Self::NoVersionsFound(_) => "TREE_NO_VERSIONS_FOUND",
            Self::NoImport => "TREE_NO_IMPORT",
            Self::ImportTreeNotEmpty => "TREE_IMPORT_TREE_NOT_EMPTY",
            Self::ImportDatabaseNotEmpty(_) => "TREE_IMPORT_DATABASE_NOT_EMPTY",
            Self::ImportNegativeVersion => "TREE_IMPORT_NEGATIVE_VERSION",
            Self::ImportNodeVersion { .. } => "TREE_IMPORT_NODE_VERSION",
            Self::ImportStackSize(_) => "TREE_IMPORT_STACK_SIZE",
            Self::NotFastStorage => "TREE_NOT_FAST_STORAGE",
            Self::InvalidStorageVersion(_) => "TREE_INVALID_STORAGE_VERSION",
            Self::UncommittedChanges => "TREE_UNCOMMITTED_CHANGES",
            Self::RemoveMissingKey(_) => "TREE_REMOVE_MISSING_KEY",
            Self::InvalidRange => "TREE_INVALID_RANGE",
            Self::Closed => "TREE_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_errors_keep_their_codes() {
        let err: TreeError = StorageError::Backend("disk full".into()).into();
        assert_eq!(err.code(), "STORAGE_BACKEND_ERROR");
        assert_eq!(err.to_string(), "backend error: disk full");

        let err: TreeError = ProofError::RootMismatch.into();
        assert_eq!(err.code(), "PROOF_ROOT_MISMATCH");
    }

    #[test]
    fn test_version_conflict_message() {
        let err = TreeError::VersionConflict {
            version: 3,
            hash: "abcd".into(),
        };
        assert_eq!(err.code(), "TREE_VERSION_CONFLICT");
        assert_eq!(
            err.to_string(),
            "version 3 was already saved to different hash abcd"
        );
    }
}
