//! Error types surfaced at the operation boundary.

use crate::store::BlobId;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TreeError> = std::result::Result<T, E>;

/// Errors reported by tree operations.
///
/// None of these are retried internally; a failed operation leaves the tree
/// structurally intact unless documented otherwise on the operation.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The comparator could not order a key, e.g. NaN under a partial order.
    /// The operation is aborted with no structural change.
    #[error("key is not orderable under the tree's comparator")]
    UnorderableKey,

    /// `diff_against` was called on trees constructed with different
    /// comparator instances.
    #[error("trees do not share a comparator")]
    ComparatorMismatch,

    /// A mutating operation was called on a frozen tree.
    #[error("tree is frozen")]
    FrozenTree,

    /// An operation required blob-store access but the tree has no store
    /// attached.
    #[error("no blob store attached to this tree")]
    NoStore,

    /// A failure propagated unchanged from the blob store. A partial commit
    /// may have written some nodes; writes are idempotent and safe to retry.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Deserialization produced a record that violates the node invariants.
    #[error("corrupt node blob: {reason}")]
    CorruptNode { reason: String },

    /// Reported by `check_valid` when an in-memory invariant does not hold.
    #[error("tree invariant violated: {0}")]
    InvariantViolation(String),
}

/// Errors from a blob store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A blob required for lazy load was missing from the store.
    #[error("blob {0} not found in store")]
    NotFound(BlobId),

    /// A blob id string did not parse as lowercase hex of a 256-bit hash.
    #[error("malformed blob id: {0}")]
    MalformedId(String),

    /// Node (de)serialization failed at the store boundary.
    #[error("node codec failed: {0}")]
    Codec(#[from] serde_json::Error),
}
