//! Error taxonomy for document operations.
//!
//! Validation failures (`InvalidValue`, `PathTypeConflict`, `InvalidIndex`)
//! surface synchronously to the caller and leave the tree untouched.
//! `Decode`/`Merge` describe corrupt change-sets; the channel logs and drops
//! those frames instead of propagating them to consumers.

use thiserror::Error;

use crate::path::{NodeKind, Path};

/// Errors produced by the replicated document and its adapters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    /// The value cannot be represented in the replicated tree.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// An existing node has a kind incompatible with the requested one.
    #[error("path {path} holds a {found}, expected a {expected}")]
    PathTypeConflict {
        path: Path,
        expected: NodeKind,
        found: NodeKind,
    },

    /// A mutation was issued while a transaction on the same document was open.
    #[error("document is already inside a transaction")]
    ConcurrentMutation,

    /// Index outside the container bounds, or not on a char boundary.
    #[error("index {index} out of range for length {len}")]
    InvalidIndex { index: usize, len: usize },

    /// Bytes could not be decoded into a change-set or update.
    #[error("decode error: {0}")]
    Decode(String),

    /// A change-set could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// The CRDT rejected a decoded update.
    #[error("merge error: {0}")]
    Merge(String),

    /// The document or adapter has been disposed.
    #[error("document has been disposed")]
    Disposed,
}

impl From<yrs::encoding::read::Error> for CollabError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        CollabError::Decode(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = CollabError> = std::result::Result<T, E>;
