//! Error types for the nodecap resource model.

use thiserror::Error;

/// Result type alias for resource model operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Invariant violations and malformed input.
///
/// `validate()` on a [`NodeResourceInfo`](crate::NodeResourceInfo) returns the
/// first violation it finds; callers must not persist state that failed it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid capacity")]
    InvalidCapacity,

    #[error("invalid usage")]
    InvalidUsage,

    #[error("invalid cpu map")]
    InvalidCpuMap,

    #[error("invalid numa")]
    InvalidNuma,

    #[error("invalid numa memory")]
    InvalidNumaMemory,

    #[error("invalid memory")]
    InvalidMemory,

    #[error("invalid cpu")]
    InvalidCpu,

    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("invalid volume binding: {0}")]
    InvalidBinding(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("invalid size: {0}")]
    InvalidSize(String),
}
