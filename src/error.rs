//! Error types for the taxus crate.

use thiserror::Error;

/// Errors reported by index construction, build, query, and persistence
/// operations.
///
/// Every failure is reported synchronously at the offending call; the crate
/// performs no internal retries beyond the bounded split re-sampling during
/// tree construction.
#[derive(Debug, Error)]
pub enum TaxusError {
    /// A constructor, build, or search parameter was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A vector's length does not match the index dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Item ids must be non-negative.
    #[error("invalid item id: {0}")]
    InvalidId(i64),

    /// The item id is not present in the index.
    #[error("item not found: {0}")]
    NotFound(i64),

    /// A query operation was invoked before `build()`.
    #[error("index is not built")]
    NotBuilt,

    /// The operation is not valid in the index's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The forest could not be built.
    #[error("build failed: {0}")]
    Build(String),

    /// The index file failed magic, version, checksum, or layout validation.
    #[error("corrupt index file: {0}")]
    CorruptFile(String),

    /// Filesystem-level failure while saving or loading an index.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The index backing storage has been released; the handle is no longer
    /// queryable.
    #[error("index has been unloaded")]
    Unloaded,
}

impl TaxusError {
    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        TaxusError::InvalidArgument(msg.into())
    }

    /// Create an `InvalidState` error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        TaxusError::InvalidState(msg.into())
    }

    /// Create a `Build` error.
    pub fn build(msg: impl Into<String>) -> Self {
        TaxusError::Build(msg.into())
    }

    /// Create a `CorruptFile` error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        TaxusError::CorruptFile(msg.into())
    }
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, TaxusError>;
