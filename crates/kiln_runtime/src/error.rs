//! Runtime errors.

use std::sync::Arc;
use thiserror::Error;

/// Compute result type
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Failure of a computation.
///
/// Cloneable so a single failure can be handed to every waiter of a promise.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// A node's own compute function failed
    #[error("{type_name}: {error:#}")]
    Compute {
        /// Type of the failing node
        type_name: String,
        /// Error returned by the compute function
        error: Arc<anyhow::Error>,
    },

    /// A declared dependency failed
    #[error("dependency {key:?} ({type_name}) failed: {source}")]
    DependencyFailed {
        /// Input name the dependency was declared under
        key: String,
        /// Type of the failing dependency
        type_name: String,
        /// Underlying failure
        source: Box<ComputeError>,
    },

    /// An input could not be digested
    #[error("input {name:?}: {reason}")]
    Input {
        /// Input name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// The surrounding context was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Could not obtain a throttle lease
    #[error("throttle: {reason}")]
    Throttle {
        /// What went wrong
        reason: String,
    },

    /// Programming defect
    #[error("internal error: {reason}")]
    Internal {
        /// What went wrong
        reason: String,
    },
}

impl ComputeError {
    /// Wrap an error returned by a compute function.
    ///
    /// A `ComputeError` travelling inside the `anyhow::Error` is unwrapped
    /// rather than nested.
    #[must_use]
    pub fn compute(type_name: impl Into<String>, error: anyhow::Error) -> Self {
        match error.downcast::<ComputeError>() {
            Ok(err) => err,
            Err(error) => Self::Compute {
                type_name: type_name.into(),
                error: Arc::new(error),
            },
        }
    }

    /// Programming defect
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Attribute this failure to the dependency `key`
    #[must_use]
    pub fn dependency(key: impl Into<String>, type_name: impl Into<String>, source: Self) -> Self {
        Self::DependencyFailed {
            key: key.into(),
            type_name: type_name.into(),
            source: Box::new(source),
        }
    }

    /// Whether this failure is (or was caused by) a cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::DependencyFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Name of the dependency that failed, if this is a dependency failure
    #[must_use]
    pub fn failed_dependency(&self) -> Option<&str> {
        match self {
            Self::DependencyFailed { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Innermost error, following dependency chains
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::DependencyFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Configuration loading error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read a configuration file
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed configuration
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File that was parsed
        path: String,
        /// Underlying error
        source: serde_json::Error,
    },

    /// Invalid environment override
    #[error("invalid value for {var}: {value:?}")]
    Env {
        /// Environment variable
        var: String,
        /// Offending value
        value: String,
    },
}
