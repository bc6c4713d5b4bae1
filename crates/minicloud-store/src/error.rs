//! Error types for the storage layer.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
///
/// Missing records are not errors: lookups return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// RocksDB rejected the read or write.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be encoded or decoded as CBOR.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The write would break an invariant of the persisted layout: an event
    /// out of sequence, or host counters above their totals.
    #[error("conflict: {0}")]
    Conflict(String),
}
