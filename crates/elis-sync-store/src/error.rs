//! Error types for the store module.

use elis_sync_core::{CoreError, EventId, TransitionError};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload or subject (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Event not found.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// The requested operation is not a legal transition for the event.
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(#[from] CoreError),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking worker running a SQLite call failed.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
