//! Error types for tidelog-core
//!
//! [`LogError`] is returned by every collaborator trait (chunk reading and
//! writing, index lookups, scavenge point management).

use thiserror::Error;

/// Errors raised by the log, its chunks, or its index
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error while touching chunk files
    #[error("I/O error: {0}")]
    Io(String),

    /// A record could not be decoded or violates a structural limit
    #[error("Corrupt record at position {position}: {reason}")]
    Corruption { position: u64, reason: String },

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The caller asked for something the log cannot do in its current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}

impl From<postcard::Error> for LogError {
    fn from(err: postcard::Error) -> Self {
        LogError::Deserialization(err.to_string())
    }
}

impl LogError {
    /// Create a new Corruption error
    pub fn corruption(position: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            position,
            reason: reason.into(),
        }
    }

    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new InvalidOperation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Whether the error indicates damaged data rather than a transient failure
    pub fn is_corruption(&self) -> bool {
        matches!(self, LogError::Corruption { .. } | LogError::Deserialization(_))
    }
}
