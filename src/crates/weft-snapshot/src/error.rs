//! Error types for snapshot operations

use thiserror::Error;

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur while persisting or loading run snapshots
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No snapshot exists for the requested run id
    #[error("Snapshot not found for run: {0}")]
    NotFound(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Backend-specific storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A write raced another writer for the same run id
    #[error("Write conflict for run: {0}")]
    Conflict(String),

    /// Stored data could not be interpreted as a snapshot
    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
