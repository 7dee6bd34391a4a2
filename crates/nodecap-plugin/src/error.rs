//! Plugin error types.

use nodecap_core::CoreError;
use nodecap_store::StoreError;
use thiserror::Error;

/// Errors returned by resource plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("insufficient resource")]
    InsufficientResource,

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("store call timed out")]
    Timeout,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;
