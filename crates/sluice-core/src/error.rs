//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The request line or target could not be turned into a host and port.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// Configuration could not be read or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session could not be persisted.
    #[error("session store error: {0}")]
    Store(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
