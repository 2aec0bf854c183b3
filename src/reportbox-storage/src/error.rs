//! Error types for reportbox-storage.

use std::path::PathBuf;
use thiserror::Error;

/// Storage error types.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote blob fetch failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Record not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind ("report", "task", "user").
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },

    /// The operation conflicts with existing records.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid path.
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    /// The backend cannot perform this operation.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Home directory not found.
    #[error("Could not determine home/data directory")]
    HomeDirNotFound,
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
