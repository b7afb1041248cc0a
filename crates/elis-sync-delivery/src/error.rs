//! Error types for the delivery module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use elis_sync_core::ErrorKind;

/// A failed delivery attempt or subject lookup, classified for the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DeliveryFailure {
    /// Human-readable diagnostic stored on the event.
    pub message: String,
    /// Coarse classification driving retry behaviour.
    pub kind: ErrorKind,
}

impl DeliveryFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// The LIS could not be reached.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailure, message)
    }

    /// The call did not complete in time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The LIS answered with a non-success status.
    pub fn http(status: u16, body: impl AsRef<str>) -> Self {
        let body = body.as_ref().trim();
        let message = if body.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, body)
        };
        Self::new(ErrorKind::HttpError(status), message)
    }

    /// The subject the event belongs to no longer exists.
    pub fn subject_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SubjectMissing, message)
    }

    /// Anything the attempter could not classify.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryFailure>;
