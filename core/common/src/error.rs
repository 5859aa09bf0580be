//! Common error types for FieldSync.

use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote transport failed (connectivity, server error).
    #[error("Network error: {0}")]
    Network(String),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Resource not found.
    ///
    /// Returned by remote transports to signal absence. It is a valid
    /// reconciliation input, not a failure.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local cache operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Conflict descriptor whose presence flags do not match its type.
    #[error("Malformed conflict descriptor: {0}")]
    MalformedDescriptor(String),

    /// Manual conflict resolver failed.
    #[error("Manual resolution failed: {0}")]
    ManualResolution(String),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a transport failure.
    ///
    /// Transport failures defer an entity instead of classifying a conflict.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Whether this error signals remote absence.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
