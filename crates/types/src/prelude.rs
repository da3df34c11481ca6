// Path: crates/types/src/prelude.rs

//! A curated set of commonly used traits and types.

pub use crate::error::{ErrorCode, ProofError, StorageError, TreeError};

/// An extension trait for `Option` that provides a convenient `required` method
/// to convert an `Option` to a `Result` with a specific error.
pub trait OptionExt<T> {
    /// Converts an `Option<T>` to a `Result<T, E>`, returning the provided
    /// error if the option is `None`.
    fn required<E>(self, err: E) -> Result<T, E>;

    /// Like [`OptionExt::required`], but builds the error lazily. Used on hot paths
    /// where the error carries a formatted key.
    fn required_with<E, F: FnOnce() -> E>(self, err: F) -> Result<T, E>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required<E>(self, err: E) -> Result<T, E> {
        self.ok_or(err)
    }

    fn required_with<E, F: FnOnce() -> E>(self, err: F) -> Result<T, E> {
        self.ok_or_else(err)
    }
}
