//! Error types for the ELIS Sync Core.

use thiserror::Error;

use crate::event::EventState;
use crate::types::{DedupKey, EventId, EventType};

/// Errors decoding persisted event fields.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown event state: {0}")]
    UnknownState(String),

    #[error("unknown error kind: {0}")]
    UnknownErrorKind(String),
}

/// An operation tried to move an event along an edge the state machine does
/// not have.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event {0} is already being retried")]
    AlreadyRetrying(EventId),

    #[error("event {0} has already been successfully processed")]
    AlreadyResolved(EventId),

    #[error("event {0} is not due for a scheduled retry")]
    NotDue(EventId),

    #[error("event {0} was not refreshed during its retry")]
    NotRefreshed(EventId),

    #[error("event {id} is {state}, expected retrying")]
    NotRetrying { id: EventId, state: EventState },

    #[error("event {id} belongs to {expected_type}/{expected_key}, not {got_type}/{got_key}")]
    SubjectMismatch {
        id: EventId,
        expected_type: EventType,
        expected_key: DedupKey,
        got_type: EventType,
        got_key: DedupKey,
    },
}
