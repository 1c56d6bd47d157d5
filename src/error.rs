//! WolfCache Error Types

use thiserror::Error;

/// Result type alias for WolfCache operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCache error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Value errors
    #[error("Value is not serializable: {0}")]
    Serialization(String),

    #[error("Invalid path '{path}': {reason}")]
    Path { path: String, reason: String },

    // Lifecycle errors
    #[error("Storage '{0}' is closed")]
    Closed(String),

    // Persistence errors
    #[error("Persistence error on {path}: {reason}")]
    Persistence { path: String, reason: String },

    // Sync errors
    #[error("Sync timed out after {0}ms waiting for the manager")]
    SyncTimeout(u64),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a persistence error for the given file
    pub fn persistence(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Error::Persistence {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a path error
    pub fn path(path: &str, reason: impl Into<String>) -> Self {
        Error::Path {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SyncTimeout(_) | Error::Transport(_))
    }

    /// Check if this error comes from a closed or destroyed instance
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
