// Path: crates/types/src/lib.rs
#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # IAVL Types
//!
//! Foundational definitions shared by every crate of the IAVL workspace: the layered error
//! enums with their stable codes, and the options that configure a tree and its node database.
//!
//! ## Architectural Role
//!
//! As the base crate, `iavl-types` has minimal dependencies and is itself a dependency of the
//! storage, telemetry and state crates. Keeping the error and config definitions here prevents
//! circular dependencies between the storage backend and the tree.

/// A top-level, crate-wide `Result` type alias with a default error type.
pub type Result<T, E = crate::error::TreeError> = std::result::Result<T, E>;

/// Tree and node database configuration (`TreeOptions`).
pub mod config;
/// A unified set of all error types used across the workspace.
pub mod error;
/// A prelude containing useful extension traits like `OptionExt`.
pub mod prelude;
