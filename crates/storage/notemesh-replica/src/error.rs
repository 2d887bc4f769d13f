//! Error types for replica and persistence operations

use thiserror::Error;

/// Replica operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    #[error("Note not found: {id}")]
    NoteNotFound { id: String },

    #[error("Invalid note: {0}")]
    InvalidNote(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Persistence backend errors.
///
/// A failed save never invalidates the in-memory replica; callers surface it
/// as a failed snapshot and carry on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Result type for replica operations
pub type Result<T> = std::result::Result<T, ReplicaError>;
