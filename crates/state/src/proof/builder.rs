// Path: crates/state/src/proof/builder.rs
//! Store-aware construction of commitment proofs.
//!
//! Proofs are built by descending from the root of a saved version, lazily loading
//! nodes through the node database, and recording the sibling of every step.

use super::{
    verify_membership, verify_non_membership, CommitmentProof, ExistenceProof, InnerOp,
    LeafOp, NonExistenceProof, ProofSpec, Sibling,
};
use crate::immutable_tree::ImmutableTree;
use crate::mutable_tree::MutableTree;
use crate::node::Node;
use iavl_types::error::{ProofError, TreeError};
use std::sync::Arc;

impl ImmutableTree {
    /// Builds the existence proof of `key`, which must be present.
    fn create_existence_proof(&self, key: &[u8]) -> Result<ExistenceProof, TreeError> {
        let Some(root) = &self.root else {
            return Err(ProofError::InvalidExistence("cannot prove existence in an empty tree".into()).into());
        };
        root.hash_with(self.unsaved_version)?;

        let mut path = Vec::with_capacity(usize::try_from(root.height).unwrap_or_default());
        let mut node: Arc<Node> = root.clone();
        while !node.is_leaf() {
            let node_version = node.effective_version(self.unsaved_version);
            let left = node.left(&self.ndb)?;
            let right = node.right(&self.ndb)?;
            if key < node.key.as_slice() {
                let sibling = right.hash_with(self.unsaved_version)?;
                path.push(InnerOp::iavl(node.height, node.size, node_version, Sibling::Right(&sibling)));
                node = left;
            } else {
                let sibling = left.hash_with(self.unsaved_version)?;
                path.push(InnerOp::iavl(node.height, node.size, node_version, Sibling::Left(&sibling)));
                node = right;
            }
        }
        if node.key != key {
            return Err(ProofError::InvalidExistence(format!(
                "key {} does not exist",
                hex::encode(key)
            ))
            .into());
        }
        path.reverse();
        Ok(ExistenceProof {
            key: node.key.clone(),
            value: node.value.clone().unwrap_or_default(),
            leaf: LeafOp::iavl(node.effective_version(self.unsaved_version)),
            path,
        })
    }

    /// Proves that `key` is in the tree.
    pub fn get_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof, TreeError> {
        Ok(CommitmentProof::Exist(self.create_existence_proof(key)?))
    }

    /// Proves that `key` is not in the tree by proving its neighbours.
    pub fn get_non_membership_proof(&self, key: &[u8]) -> Result<CommitmentProof, TreeError> {
        let (index, value) = self.get_with_index(key)?;
        if value.is_some() {
            return Err(ProofError::InvalidNonExistence(
                "cannot create a non-existence proof for a key in the tree".into(),
            )
            .into());
        }
        let mut nonexist = NonExistenceProof {
            key: key.to_vec(),
            left: None,
            right: None,
        };
        if index >= 1 {
            if let Some((left_key, _)) = self.get_by_index(index - 1)? {
                nonexist.left = Some(self.create_existence_proof(&left_key)?);
            }
        }
        // Absent when nothing sorts after `key`.
        if let Some((right_key, _)) = self.get_by_index(index)? {
            nonexist.right = Some(self.create_existence_proof(&right_key)?);
        }
        Ok(CommitmentProof::Nonexist(nonexist))
    }

    /// A membership proof when `key` is present, otherwise a non-membership proof.
    pub fn get_proof(&self, key: &[u8]) -> Result<CommitmentProof, TreeError> {
        if self.has(key)? {
            self.get_membership_proof(key)
        } else {
            self.get_non_membership_proof(key)
        }
    }

    /// Checks `proof` against this tree's root and its current value for `key`.
    pub fn verify_membership(&self, proof: &CommitmentProof, key: &[u8]) -> Result<bool, TreeError> {
        let value = self.get(key)?.unwrap_or_default();
        let root = self.hash()?;
        Ok(verify_membership(&ProofSpec::iavl(), &root, proof, key, &value))
    }

    /// Checks that `proof` shows `key` absent under this tree's root.
    pub fn verify_non_membership(
        &self,
        proof: &CommitmentProof,
        key: &[u8],
    ) -> Result<bool, TreeError> {
        let root = self.hash()?;
        Ok(verify_non_membership(&ProofSpec::iavl(), &root, proof, key))
    }
}

impl MutableTree {
    /// A commitment proof for `key` against the saved `version`.
    pub fn get_versioned_proof(
        &self,
        key: &[u8],
        version: i64,
    ) -> Result<CommitmentProof, TreeError> {
        self.get_immutable(version)?.get_proof(key)
    }
}
