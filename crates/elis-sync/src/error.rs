//! Error types for the retry queue.

use elis_sync_core::EventId;
use elis_sync_store::StoreError;
use thiserror::Error;

/// Errors that can occur during queue operations.
///
/// Delivery failures are not errors here: they are recorded on the event and
/// counted in the [`crate::RetryReport`]. Only contract violations and
/// storage failures surface.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Event not found.
    #[error("event not found: {0}")]
    EventNotFound(EventId),

    /// Another attempt already holds the event.
    #[error("event {0} is already retrying")]
    AlreadyRetrying(EventId),

    /// A scheduled retry found the event no longer due.
    #[error("event {0} is not due for a scheduled retry")]
    NotDue(EventId),

    /// The operation is not legal for the event's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The background scheduler task failed.
    #[error("scheduler task failed: {0}")]
    TaskFailed(String),
}

impl QueueError {
    /// Convert a store error raised by an operator call, reporting illegal
    /// transitions as invalid operations.
    pub(crate) fn from_operator(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition(t) => QueueError::InvalidOperation(t.to_string()),
            StoreError::NotFound(id) => QueueError::EventNotFound(id),
            other => QueueError::Store(other),
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
