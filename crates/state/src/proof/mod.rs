// Path: crates/state/src/proof/mod.rs
//! ICS-23 commitment proofs for the IAVL tree.
//!
//! The data structures mirror the ICS-23 protobuf messages and are SCALE-encodable. The
//! verifier is pure and stateless: it recomputes a root from the proof operations, checks
//! every operation against [`ProofSpec::iavl`] and, for absence proofs, checks that the two
//! neighbours are adjacent leaves of the same tree.

mod builder;
pub mod range;

#[cfg(test)]
mod tests;

use crate::node::{sha256, Hash};
use crate::node::encode::{put_varint, read_varint};
use iavl_types::error::ProofError;
use parity_scale_codec::{Decode, Encode};
use std::cmp::Ordering;

pub use range::{PathToLeaf, ProofInnerNode, ProofLeafNode, RangeProof};

/// Length prefix of a SHA-256 digest inside a hash preimage.
const HASH_LENGTH_BYTE: u8 = 0x20;

// --- ICS-23 Hashing Primitives ---

/// Defines the hash operation to apply to a key or value before concatenation.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOp {
    /// Do not hash the data; use it directly.
    NoHash,
    /// Apply SHA-256 to the data.
    Sha256,
}

/// Defines how the length of a key or value is encoded in the preimage.
#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOp {
    /// No length prefix is used.
    NoPrefix,
    /// A protobuf-style varint length prefix is used.
    VarProto,
}

fn apply_hash(op: HashOp, data: &[u8]) -> Vec<u8> {
    match op {
        HashOp::NoHash => data.to_vec(),
        HashOp::Sha256 => sha256(data).to_vec(),
    }
}

fn apply_length(op: LengthOp, data: &[u8]) -> Result<Vec<u8>, ProofError> {
    match op {
        LengthOp::NoPrefix => Ok(data.to_vec()),
        LengthOp::VarProto => {
            let mut len_prefixed =
                Vec::with_capacity(prost::length_delimiter_len(data.len()) + data.len());
            prost::encode_length_delimiter(data.len(), &mut len_prefixed)?;
            len_prefixed.extend_from_slice(data);
            Ok(len_prefixed)
        }
    }
}

/// How a leaf hash is derived from its key and value.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct LeafOp {
    pub hash: HashOp,
    pub prehash_key: HashOp,
    pub prehash_value: HashOp,
    pub length: LengthOp,
    /// `varint(0) ‖ varint(1) ‖ varint(version)` for IAVL leaves.
    pub prefix: Vec<u8>,
}

impl LeafOp {
    /// The leaf operation of an IAVL leaf written at `version`.
    pub fn iavl(version: i64) -> Self {
        let mut prefix = Vec::with_capacity(12);
        put_varint(&mut prefix, 0);
        put_varint(&mut prefix, 1);
        put_varint(&mut prefix, version);
        Self {
            hash: HashOp::Sha256,
            prehash_key: HashOp::NoHash,
            prehash_value: HashOp::Sha256,
            length: LengthOp::VarProto,
            prefix,
        }
    }

    pub fn apply(&self, key: &[u8], value: &[u8]) -> Result<Vec<u8>, ProofError> {
        if key.is_empty() {
            return Err(ProofError::InvalidExistence("leaf op needs key".into()));
        }
        if value.is_empty() {
            return Err(ProofError::InvalidExistence("leaf op needs value".into()));
        }
        let mut data = self.prefix.clone();
        data.extend_from_slice(&apply_length(self.length, &apply_hash(self.prehash_key, key))?);
        data.extend_from_slice(&apply_length(
            self.length,
            &apply_hash(self.prehash_value, value),
        )?);
        Ok(apply_hash(self.hash, &data))
    }

    fn check_against_spec(&self, spec: &ProofSpec) -> Result<(), ProofError> {
        let lspec = &spec.leaf_spec;
        if spec.is_iavl() {
            validate_iavl_prefix(&self.prefix, 0)?;
        }
        if self.hash != lspec.hash {
            return Err(ProofError::SpecMismatch(format!("unexpected leaf hash op {:?}", self.hash)));
        }
        if self.prehash_key != lspec.prehash_key {
            return Err(ProofError::SpecMismatch(format!(
                "unexpected prehash key op {:?}",
                self.prehash_key
            )));
        }
        if self.prehash_value != lspec.prehash_value {
            return Err(ProofError::SpecMismatch(format!(
                "unexpected prehash value op {:?}",
                self.prehash_value
            )));
        }
        if self.length != lspec.length {
            return Err(ProofError::SpecMismatch(format!("unexpected length op {:?}", self.length)));
        }
        if !self.prefix.starts_with(&lspec.prefix) {
            return Err(ProofError::SpecMismatch(format!(
                "leaf prefix {} does not start with {}",
                hex::encode(&self.prefix),
                hex::encode(&lspec.prefix)
            )));
        }
        Ok(())
    }
}

/// One step up the path: `hash(prefix ‖ child ‖ suffix)`.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct InnerOp {
    pub hash: HashOp,
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
}

impl InnerOp {
    /// The step through an IAVL inner node. Exactly one of `left` and `right` is the
    /// sibling hash; the other side is the child being proven.
    pub(crate) fn iavl(height: i8, size: i64, version: i64, sibling: Sibling<'_>) -> Self {
        let mut prefix = Vec::with_capacity(12 + 34);
        put_varint(&mut prefix, i64::from(height));
        put_varint(&mut prefix, size);
        put_varint(&mut prefix, version);
        let mut suffix = Vec::new();
        match sibling {
            Sibling::Left(left) => {
                prefix.push(HASH_LENGTH_BYTE);
                prefix.extend_from_slice(left);
                prefix.push(HASH_LENGTH_BYTE);
            }
            Sibling::Right(right) => {
                prefix.push(HASH_LENGTH_BYTE);
                suffix.reserve(33);
                suffix.push(HASH_LENGTH_BYTE);
                suffix.extend_from_slice(right);
            }
        }
        Self {
            hash: HashOp::Sha256,
            prefix,
            suffix,
        }
    }

    pub fn apply(&self, child: &[u8]) -> Result<Vec<u8>, ProofError> {
        if child.is_empty() {
            return Err(ProofError::InvalidExistence("inner op needs child value".into()));
        }
        let mut preimage = Vec::with_capacity(self.prefix.len() + child.len() + self.suffix.len());
        preimage.extend_from_slice(&self.prefix);
        preimage.extend_from_slice(child);
        preimage.extend_from_slice(&self.suffix);
        Ok(apply_hash(self.hash, &preimage))
    }

    fn check_against_spec(&self, spec: &ProofSpec, layer: usize) -> Result<(), ProofError> {
        let ispec = &spec.inner_spec;
        if self.hash != ispec.hash {
            return Err(ProofError::SpecMismatch(format!("unexpected inner hash op {:?}", self.hash)));
        }
        if spec.is_iavl() {
            validate_iavl_prefix(&self.prefix, layer)?;
        }
        if self.prefix.starts_with(&spec.leaf_spec.prefix) {
            return Err(ProofError::SpecMismatch("inner prefix starts with leaf prefix".into()));
        }
        if self.prefix.len() < (ispec.min_prefix_length as usize) {
            return Err(ProofError::SpecMismatch(format!(
                "inner prefix too short: {}",
                self.prefix.len()
            )));
        }
        let max_left_child_bytes = ispec.child_order.len().saturating_sub(1) * (ispec.child_size as usize);
        if self.prefix.len() > (ispec.max_prefix_length as usize) + max_left_child_bytes {
            return Err(ProofError::SpecMismatch(format!(
                "inner prefix too long: {}",
                self.prefix.len()
            )));
        }
        if (ispec.child_size as usize) == 0 || self.suffix.len() % (ispec.child_size as usize) != 0 {
            return Err(ProofError::SpecMismatch(format!(
                "inner suffix length {} is not a multiple of the child size",
                self.suffix.len()
            )));
        }
        Ok(())
    }
}

/// The sibling recorded by an inner step.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Sibling<'a> {
    Left(&'a [u8]),
    Right(&'a [u8]),
}

/// Checks `varint(height) ‖ varint(size) ‖ varint(version)` at the start of an IAVL
/// prefix, followed by nothing for a leaf and by one or 34 bytes for an inner node.
fn validate_iavl_prefix(prefix: &[u8], min_height: usize) -> Result<(), ProofError> {
    let mut cursor = prefix;
    let mut next = |what: &str| {
        read_varint(&mut cursor)
            .map_err(|_| ProofError::SpecMismatch(format!("cannot read {what} from prefix")))
    };
    let height = next("height")?;
    if height < 0 || height < min_height as i64 {
        return Err(ProofError::SpecMismatch(format!("invalid height in prefix: {height}")));
    }
    let size = next("size")?;
    if size < 0 {
        return Err(ProofError::SpecMismatch(format!("invalid size in prefix: {size}")));
    }
    let version = next("version")?;
    if version < 0 {
        return Err(ProofError::SpecMismatch(format!("invalid version in prefix: {version}")));
    }
    let remaining = cursor.len();
    let ok = if min_height == 0 {
        remaining == 0
    } else {
        remaining == 1 || remaining == 34
    };
    if !ok {
        return Err(ProofError::SpecMismatch(format!(
            "unexpected {remaining} trailing prefix bytes"
        )));
    }
    Ok(())
}

// --- Proof Spec ---

/// Shape of the leaves a spec accepts.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct LeafSpec {
    pub hash: HashOp,
    pub prehash_key: HashOp,
    pub prehash_value: HashOp,
    pub length: LengthOp,
    pub prefix: Vec<u8>,
}

/// Shape of the inner nodes a spec accepts.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct InnerSpec {
    pub child_order: Vec<u32>,
    pub child_size: u32,
    pub min_prefix_length: u32,
    pub max_prefix_length: u32,
    pub hash: HashOp,
}

/// The tree layout a proof is verified against.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProofSpec {
    pub leaf_spec: LeafSpec,
    pub inner_spec: InnerSpec,
    /// Zero means unbounded.
    pub max_depth: u32,
    pub min_depth: u32,
}

impl ProofSpec {
    /// The layout of this tree.
    pub fn iavl() -> Self {
        Self {
            leaf_spec: LeafSpec {
                hash: HashOp::Sha256,
                prehash_key: HashOp::NoHash,
                prehash_value: HashOp::Sha256,
                length: LengthOp::VarProto,
                prefix: vec![0x00],
            },
            inner_spec: InnerSpec {
                child_order: vec![0, 1],
                child_size: 33,
                min_prefix_length: 4,
                max_prefix_length: 12,
                hash: HashOp::Sha256,
            },
            max_depth: 0,
            min_depth: 0,
        }
    }

    fn is_iavl(&self) -> bool {
        *self == Self::iavl()
    }

    /// `(min prefix, max prefix, suffix)` lengths of a step whose child sits at `branch`.
    fn padding(&self, branch: usize) -> (usize, usize, usize) {
        let ispec = &self.inner_spec;
        let idx = ispec
            .child_order
            .iter()
            .position(|&c| c as usize == branch)
            .unwrap_or(branch);
        let prefix = idx * (ispec.child_size as usize);
        let suffix = ispec.child_order.len().saturating_sub(1 + idx) * (ispec.child_size as usize);
        (
            prefix + (ispec.min_prefix_length as usize),
            prefix + (ispec.max_prefix_length as usize),
            suffix,
        )
    }

    fn has_padding(op: &InnerOp, (min_prefix, max_prefix, suffix): (usize, usize, usize)) -> bool {
        (min_prefix..=max_prefix).contains(&op.prefix.len()) && op.suffix.len() == suffix
    }

    fn branch_of(&self, op: &InnerOp) -> Option<usize> {
        (0..self.inner_spec.child_order.len()).find(|&b| Self::has_padding(op, self.padding(b)))
    }

    /// True when every step of `path` descends into the left-most child.
    pub fn is_left_most(&self, path: &[InnerOp]) -> bool {
        let padding = self.padding(0);
        path.iter().all(|step| Self::has_padding(step, padding))
    }

    /// True when every step of `path` descends into the right-most child.
    pub fn is_right_most(&self, path: &[InnerOp]) -> bool {
        let last = self.inner_spec.child_order.len().saturating_sub(1);
        let padding = self.padding(last);
        path.iter().all(|step| Self::has_padding(step, padding))
    }

    /// True when the leaves at the end of `left` and `right` (both ordered leaf to root)
    /// are neighbours.
    pub fn is_left_neighbor(&self, left: &[InnerOp], right: &[InnerOp]) -> bool {
        let (mut left, mut right) = (left, right);
        loop {
            let (Some((top_left, rest_left)), Some((top_right, rest_right))) =
                (left.split_last(), right.split_last())
            else {
                return false;
            };
            if top_left == top_right {
                left = rest_left;
                right = rest_right;
                continue;
            }
            // First divergent step: the paths must split into adjacent children there,
            // then hug the split from either side.
            let adjacent = match (self.branch_of(top_left), self.branch_of(top_right)) {
                (Some(l), Some(r)) => r == l + 1,
                _ => false,
            };
            return adjacent && self.is_right_most(rest_left) && self.is_left_most(rest_right);
        }
    }
}

// --- Proofs ---

/// Proves that `key` maps to `value` under some root.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ExistenceProof {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub leaf: LeafOp,
    /// Ordered from the leaf's parent up to the root.
    pub path: Vec<InnerOp>,
}

impl ExistenceProof {
    /// The root implied by this proof.
    pub fn calculate(&self) -> Result<Hash, ProofError> {
        let mut res = self.leaf.apply(&self.key, &self.value)?;
        for step in &self.path {
            res = step.apply(&res)?;
        }
        res.as_slice()
            .try_into()
            .map_err(|_| ProofError::InvalidHashLength {
                expected: 32,
                got: res.len(),
            })
    }

    fn check_against_spec(&self, spec: &ProofSpec) -> Result<(), ProofError> {
        self.leaf.check_against_spec(spec)?;
        let depth = self.path.len();
        if spec.min_depth > 0 && depth < spec.min_depth as usize {
            return Err(ProofError::SpecMismatch(format!("path too short: {depth}")));
        }
        if spec.max_depth > 0 && depth > spec.max_depth as usize {
            return Err(ProofError::SpecMismatch(format!("path too long: {depth}")));
        }
        for (i, step) in self.path.iter().enumerate() {
            step.check_against_spec(spec, i + 1)?;
        }
        Ok(())
    }

    pub fn verify(
        &self,
        spec: &ProofSpec,
        root: &Hash,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), ProofError> {
        // 1. Spec Check
        self.check_against_spec(spec)?;

        // 2. Key/Value Check
        if self.key != key {
            return Err(ProofError::InvalidExistence(format!(
                "proof is for key {}, not {}",
                hex::encode(&self.key),
                hex::encode(key)
            )));
        }
        if self.value != value {
            return Err(ProofError::InvalidExistence("proof is for a different value".into()));
        }

        // 3. Root Match
        if self.calculate()? != *root {
            return Err(ProofError::RootMismatch);
        }
        Ok(())
    }
}

/// Proves that `key` is absent by exhibiting its neighbours. At least one is present.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct NonExistenceProof {
    pub key: Vec<u8>,
    pub left: Option<ExistenceProof>,
    pub right: Option<ExistenceProof>,
}

impl NonExistenceProof {
    pub fn verify(&self, spec: &ProofSpec, root: &Hash, key: &[u8]) -> Result<(), ProofError> {
        let invalid = |msg: &str| Err(ProofError::InvalidNonExistence(msg.to_string()));

        // 1. Neighbour Existence
        if let Some(left) = &self.left {
            left.verify(spec, root, &left.key, &left.value)?;
        }
        if let Some(right) = &self.right {
            right.verify(spec, root, &right.key, &right.value)?;
        }

        // 2. Ordering
        if let Some(right) = &self.right {
            if key.cmp(&right.key) != Ordering::Less {
                return invalid("key is not left of right proof");
            }
        }
        if let Some(left) = &self.left {
            if key.cmp(&left.key) != Ordering::Greater {
                return invalid("key is not right of left proof");
            }
        }

        // 3. Adjacency
        match (&self.left, &self.right) {
            (None, None) => invalid("both left and right proofs missing"),
            (None, Some(right)) if !spec.is_left_most(&right.path) => {
                invalid("left proof missing, right proof must be left-most")
            }
            (Some(left), None) if !spec.is_right_most(&left.path) => {
                invalid("right proof missing, left proof must be right-most")
            }
            (Some(left), Some(right)) if !spec.is_left_neighbor(&left.path, &right.path) => {
                invalid("left and right proofs are not adjacent")
            }
            _ => Ok(()),
        }
    }
}

/// A membership or non-membership proof.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum CommitmentProof {
    Exist(ExistenceProof),
    Nonexist(NonExistenceProof),
}

/// True when `proof` shows that `key` maps to `value` under `root`.
pub fn verify_membership(
    spec: &ProofSpec,
    root: &Hash,
    proof: &CommitmentProof,
    key: &[u8],
    value: &[u8],
) -> bool {
    match proof {
        CommitmentProof::Exist(exist) => exist.verify(spec, root, key, value).is_ok(),
        CommitmentProof::Nonexist(_) => false,
    }
}

/// True when `proof` shows that `key` is absent under `root`.
pub fn verify_non_membership(
    spec: &ProofSpec,
    root: &Hash,
    proof: &CommitmentProof,
    key: &[u8],
) -> bool {
    match proof {
        CommitmentProof::Nonexist(nonexist) => {
            nonexist.key == key && nonexist.verify(spec, root, key).is_ok()
        }
        CommitmentProof::Exist(_) => false,
    }
}
