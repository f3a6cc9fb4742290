//! Error types for tidelog-scavenge
//!
//! Errors are split by how a run must react to them: corruption, invariant
//! violations and resource contention are fatal and need an operator, while
//! state-store and log failures leave the last committed checkpoint intact and
//! a later run resumes from it.

use thiserror::Error;

use tidelog_core::LogError;

/// Errors raised by the scavenge engine
#[derive(Debug, Error)]
pub enum ScavengeError {
    /// A record could not be decoded or exceeds the maximum record size
    #[error("Corrupt data at position {position}: {reason}")]
    Corruption { position: u64, reason: String },

    /// Internal state contradicts itself
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    /// A reusable resource was acquired while not free
    #[error("Resource contention: {0}")]
    ResourceContention(String),

    /// The state store failed to read, write, or commit
    #[error("State store error: {0}")]
    State(String),

    /// A log collaborator failed
    #[error("Log error: {0}")]
    Log(LogError),

    /// I/O error outside the log
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<LogError> for ScavengeError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Corruption { position, reason } => Self::Corruption { position, reason },
            other => Self::Log(other),
        }
    }
}

impl From<postcard::Error> for ScavengeError {
    fn from(err: postcard::Error) -> Self {
        ScavengeError::State(format!("encoding: {err}"))
    }
}

impl From<std::io::Error> for ScavengeError {
    fn from(err: std::io::Error) -> Self {
        ScavengeError::Io(err.to_string())
    }
}

impl ScavengeError {
    /// Create a new Corruption error
    pub fn corruption(position: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            position,
            reason: reason.into(),
        }
    }

    /// Create a new InvariantViolation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    /// Create a new ResourceContention error
    pub fn contention(message: impl Into<String>) -> Self {
        Self::ResourceContention(message.into())
    }

    /// Create a new State error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    /// Whether the error needs intervention before scavenging can continue
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Corruption { .. } | Self::InvariantViolation(_) | Self::ResourceContention(_) => {
                true
            }
            Self::Log(inner) => inner.is_corruption(),
            Self::State(_) | Self::Io(_) => false,
        }
    }
}

/// Result alias for scavenge operations
pub type Result<T> = std::result::Result<T, ScavengeError>;
