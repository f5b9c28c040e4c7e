//! Error types for the Bookvault server

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type for object store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Application error type (bootstrap and configuration)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 SDK error: {0}")]
    SdkError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Map an IO error, turning `NotFound` into [`StorageError::ObjectNotFound`]
    pub fn from_io(err: std::io::Error, key: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::ObjectNotFound(key.to_string())
        } else {
            StorageError::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::ObjectNotFound(_))
    }
}
