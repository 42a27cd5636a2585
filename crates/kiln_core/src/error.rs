//! Core error types for kiln.

use thiserror::Error;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Digest string could not be parsed
    #[error("Invalid digest: {reason}")]
    InvalidDigest {
        /// What was wrong with it
        reason: String,
    },

    /// Digest names an algorithm we don't implement
    #[error("Unknown digest algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Digest didn't match the content it is supposed to address
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest that was asked for
        expected: String,
        /// Digest of the content we actually saw
        actual: String,
    },

    /// A value could not be canonically encoded
    #[error("Encoding failed: {reason}")]
    Encoding {
        /// Encoder message
        reason: String,
    },
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::UnknownAlgorithm("md5".to_string());
        assert_eq!(format!("{}", err), "Unknown digest algorithm: md5");

        let err = CoreError::InvalidDigest {
            reason: "missing ':'".to_string(),
        };
        assert_eq!(format!("{}", err), "Invalid digest: missing ':'");
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = CoreError::DigestMismatch {
            expected: "sha256:abc123".to_string(),
            actual: "sha256:def456".to_string(),
        };
        let s = format!("{}", err);
        assert!(s.contains("abc123"));
        assert!(s.contains("def456"));
    }
}
