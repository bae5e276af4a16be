//! Error types for lbsync
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context needed to decide who handles it: configuration
//! problems surface to the operator, remote failures are classified by the
//! REST layer, and everything else is reported upward without panicking.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for lbsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or inconsistent configuration
    #[error("configuration error [{field}]: {message}")]
    Config {
        /// Configuration field (or remote object) that is wrong
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// A change key could not be parsed
    #[error("invalid change key '{key}': {message}")]
    InvalidKey {
        /// The raw key text
        key: String,
        /// Why it was rejected
        message: String,
    },

    /// Remote-state cache could not be populated
    #[error("cache error for kind {kind}: {message}")]
    Cache {
        /// Remote object kind being scanned
        kind: String,
        /// Description of what failed
        message: String,
        /// Whether a later attempt may succeed
        retryable: bool,
    },

    /// Remote controller call failed before it could be classified
    #[error("remote error [{status}]: {message}")]
    Remote {
        /// HTTP status code, or 0 for transport failures
        status: u16,
        /// Error text returned by the controller or the transport
        message: String,
    },

    /// A resource could not be turned into a desired-state model
    #[error("translation error for {key}: {message}")]
    Translation {
        /// Change key being translated
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Status could not be written back to the origin resource
    #[error("status error for {key}: {message}")]
    Status {
        /// Change key of the origin resource
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The pipeline is shutting down and refuses new work
    #[error("shutting down: {reason}")]
    Shutdown {
        /// Why the pipeline stopped
        reason: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "ingestion", "rest", "status")
        context: String,
    },
}

impl Error {
    /// Create a configuration error for a specific field
    pub fn config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-key error
    pub fn invalid_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable cache error
    pub fn cache(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a cache error that needs operator intervention
    pub fn cache_permanent(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cache {
            kind: kind.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a remote error
    pub fn remote(status: u16, msg: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: msg.into(),
        }
    }

    /// Create a translation error
    pub fn translation(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::Translation {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a status error
    pub fn status(key: impl ToString, msg: impl Into<String>) -> Self {
        Self::Status {
            key: key.to_string(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, key and serialization errors require a fix and are not
    /// retried. Kubernetes 4xx errors are not retried either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Config { .. } => false,
            Error::InvalidKey { .. } => false,
            Error::Cache { retryable, .. } => *retryable,
            Error::Remote { status, .. } => *status == 0 || *status >= 500,
            Error::Translation { .. } => true,
            Error::Status { .. } => true,
            Error::Serialization { .. } => false,
            Error::Shutdown { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
