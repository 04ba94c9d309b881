use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, YggdrasilError>;

/// Error taxonomy for coordination-layer operations.
///
/// Backend adapters map their native failures into [`YggdrasilError::Backend`];
/// everything else originates inside the core.
#[derive(Debug, Error)]
pub enum YggdrasilError {
    /// A required capability is not advertised by the backend.
    #[error("capability not supported by {system}: {capability}")]
    CapabilityMissing {
        /// Identifier of the backend that was asked.
        system: String,
        /// Name of the missing capability contract.
        capability: &'static str,
    },
    /// A backend-native operation failed.
    #[error("backend error: {0}")]
    Backend(String),
    /// A snapshot, branch, or system identifier is unknown.
    #[error("{0} not found")]
    NotFound(String),
    /// Registry corruption, malformed persisted node, or unexpected state.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// The durable key-value store failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// A persisted payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Two writers raced on the same branch and the backend refused to serialize them.
    #[error("concurrent conflict: {0}")]
    ConcurrentConflict(String),
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A configuration or argument value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl YggdrasilError {
    /// Builds a [`YggdrasilError::CapabilityMissing`] for the given system.
    pub fn capability(system: impl Into<String>, capability: &'static str) -> Self {
        YggdrasilError::CapabilityMissing {
            system: system.into(),
            capability,
        }
    }
}

impl From<serde_json::Error> for YggdrasilError {
    fn from(err: serde_json::Error) -> Self {
        YggdrasilError::Serialization(err.to_string())
    }
}
