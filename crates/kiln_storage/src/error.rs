//! Storage errors.

use thiserror::Error;

/// Storage result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error
#[derive(Debug, Error)]
pub enum StoreError {
    /// Blob not found
    #[error("Blob not found: {digest}")]
    NotFound {
        /// Digest that was looked up
        digest: String,
    },

    /// Blob content did not hash to its digest
    #[error("Digest didn't match, expected {expected} got {actual}")]
    DigestMismatch {
        /// Digest the blob was written under
        expected: String,
        /// Digest of the bytes actually seen
        actual: String,
    },

    /// Index entry could not be decoded
    #[error("Corrupt cache entry: {reason}")]
    Corrupt {
        /// Decoder message
        reason: String,
    },

    /// Index entry could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this is a plain miss rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
