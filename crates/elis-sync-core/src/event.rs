//! FailedEvent: one undelivered sync payload awaiting retry.
//!
//! A failed event is transient evidence of a failure, not an audit record.
//! It is created on the first failure for a subject, refreshed by later
//! failures for the same subject, and deleted once delivery succeeds.
//!
//! Fields are private. The only way to change an event is through the
//! transition methods below, each of which checks the current state and bumps
//! the revision. Construction and transitions are driven by the storage
//! backends and hidden from the rendered docs; everything else reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::backoff::LinearBackoff;
use crate::error::{CoreError, TransitionError};
use crate::subject::SubjectRef;
use crate::types::{DedupKey, EventId, EventType};

/// Position of an event in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Admitted, never retried since the last admission.
    Pending,
    /// A delivery attempt is in flight.
    Retrying,
    /// The last retry failed; due again at `next_retry_at`.
    Failed,
    /// Delivered. Only ever observed transiently before deletion.
    Success,
}

impl EventState {
    /// Stable string form used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            EventState::Pending => "pending",
            EventState::Retrying => "retrying",
            EventState::Failed => "failed",
            EventState::Success => "success",
        }
    }

    /// Pending, Retrying or Failed.
    pub fn is_unresolved(self) -> bool {
        !matches!(self, EventState::Success)
    }

    /// Whether a retry may start from this state.
    pub fn is_claimable(self) -> bool {
        matches!(self, EventState::Pending | EventState::Failed)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventState::Pending),
            "retrying" => Ok(EventState::Retrying),
            "failed" => Ok(EventState::Failed),
            "success" => Ok(EventState::Success),
            other => Err(CoreError::UnknownState(other.to_string())),
        }
    }
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum ErrorKind {
    /// The LIS could not be reached.
    ConnectionFailure,
    /// The call did not complete in time.
    Timeout,
    /// The LIS answered with a non-success status.
    HttpError(u16),
    /// The subject no longer exists locally. Not retryable.
    SubjectMissing,
    /// Anything else.
    Unclassified,
}

impl ErrorKind {
    /// All kinds except `SubjectMissing` are worth retrying.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::SubjectMissing)
    }

    /// Stable code used for persistence. The HTTP status is stored apart.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HttpError(_) => "http",
            ErrorKind::SubjectMissing => "subject_missing",
            ErrorKind::Unclassified => "unclassified",
        }
    }

    /// HTTP status, for `HttpError`.
    pub fn http_status(self) -> Option<u16> {
        match self {
            ErrorKind::HttpError(status) => Some(status),
            _ => None,
        }
    }

    /// Rebuild from the persisted code and status.
    pub fn from_code(code: &str, http_status: Option<u16>) -> Result<Self, CoreError> {
        match (code, http_status) {
            ("connection", _) => Ok(ErrorKind::ConnectionFailure),
            ("timeout", _) => Ok(ErrorKind::Timeout),
            ("http", Some(status)) => Ok(ErrorKind::HttpError(status)),
            ("subject_missing", _) => Ok(ErrorKind::SubjectMissing),
            ("unclassified", _) => Ok(ErrorKind::Unclassified),
            (other, status) => Err(CoreError::UnknownErrorKind(format!(
                "{} (status {:?})",
                other, status
            ))),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConnectionFailure => f.write_str("ConnectionError"),
            ErrorKind::Timeout => f.write_str("Timeout"),
            ErrorKind::HttpError(status) => write!(f, "HTTP {}", status),
            ErrorKind::SubjectMissing => f.write_str("SubjectMissing"),
            ErrorKind::Unclassified => f.write_str("Unclassified"),
        }
    }
}

/// A failure to record: the subject, the exact payload, and why it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub subject: SubjectRef,
    pub payload: Value,
    pub error_message: String,
    pub error_kind: ErrorKind,
}

impl Admission {
    pub fn new(
        subject: SubjectRef,
        payload: Value,
        error_message: impl Into<String>,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            subject,
            payload,
            error_message: error_message.into(),
            error_kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.subject.event_type()
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.subject.dedup_key()
    }
}

/// Raw persisted fields, for storage backends rebuilding an event.
#[doc(hidden)]
#[derive(Debug, Clone, PartialEq)]
pub struct EventParts {
    pub id: EventId,
    pub sequence_number: u64,
    pub subject: SubjectRef,
    pub payload: Value,
    pub error_message: String,
    pub error_kind: ErrorKind,
    pub retry_count: u32,
    pub state: EventState,
    pub last_retry_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub revision: u64,
    pub refreshed_in_flight: bool,
}

/// One undelivered or previously failed sync unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedEvent {
    id: EventId,
    sequence_number: u64,
    subject: SubjectRef,
    payload: Value,
    error_message: String,
    error_kind: ErrorKind,
    retry_count: u32,
    state: EventState,
    last_retry_at: Option<i64>,
    next_retry_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    revision: u64,
    /// A newer failure was admitted while this event was `Retrying`.
    refreshed_in_flight: bool,
}

impl FailedEvent {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new pending event for a first failure.
    #[doc(hidden)]
    pub fn admit(id: EventId, sequence_number: u64, admission: Admission, now: i64) -> Self {
        Self {
            id,
            sequence_number,
            subject: admission.subject,
            payload: admission.payload,
            error_message: admission.error_message,
            error_kind: admission.error_kind,
            retry_count: 0,
            state: EventState::Pending,
            last_retry_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            revision: 1,
            refreshed_in_flight: false,
        }
    }

    /// Rebuild an event read back from storage.
    #[doc(hidden)]
    pub fn restore(parts: EventParts) -> Self {
        Self {
            id: parts.id,
            sequence_number: parts.sequence_number,
            subject: parts.subject,
            payload: parts.payload,
            error_message: parts.error_message,
            error_kind: parts.error_kind,
            retry_count: parts.retry_count,
            state: parts.state,
            last_retry_at: parts.last_retry_at,
            next_retry_at: parts.next_retry_at,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            revision: parts.revision,
            refreshed_in_flight: parts.refreshed_in_flight,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Refresh an unresolved event with a newer failure for the same subject.
    ///
    /// Replaces payload and error, resets the retry state, and keeps the
    /// sequence number so the event keeps its original FIFO position.
    ///
    /// An event whose attempt is in flight stays `Retrying` so no second
    /// delivery can start for the subject; the attempt's completion then
    /// requeues it as `Pending` (see [`FailedEvent::requeue_refreshed`]).
    #[doc(hidden)]
    pub fn readmit(&mut self, admission: Admission, now: i64) -> Result<(), TransitionError> {
        if !self.state.is_unresolved() {
            return Err(TransitionError::AlreadyResolved(self.id));
        }
        let (got_type, got_key) = (admission.event_type(), admission.dedup_key());
        if got_type != self.event_type() || got_key != self.dedup_key() {
            return Err(TransitionError::SubjectMismatch {
                id: self.id,
                expected_type: self.event_type(),
                expected_key: self.dedup_key(),
                got_type,
                got_key,
            });
        }

        self.subject = admission.subject;
        self.payload = admission.payload;
        self.error_message = admission.error_message;
        self.error_kind = admission.error_kind;
        self.retry_count = 0;
        self.last_retry_at = None;
        self.next_retry_at = None;
        if self.state == EventState::Retrying {
            self.refreshed_in_flight = true;
        } else {
            self.state = EventState::Pending;
        }
        self.touch(now);
        Ok(())
    }

    /// Claim the event for a delivery attempt: `Pending|Failed -> Retrying`.
    #[doc(hidden)]
    pub fn begin_retry(&mut self, now: i64) -> Result<(), TransitionError> {
        match self.state {
            EventState::Pending | EventState::Failed => {
                self.state = EventState::Retrying;
                self.refreshed_in_flight = false;
                self.retry_count = self.retry_count.saturating_add(1);
                self.last_retry_at = Some(now);
                self.touch(now);
                Ok(())
            }
            EventState::Retrying => Err(TransitionError::AlreadyRetrying(self.id)),
            EventState::Success => Err(TransitionError::AlreadyResolved(self.id)),
        }
    }

    /// Claim for a scheduled cycle: like [`FailedEvent::begin_retry`], but
    /// refuses an event that is no longer due at `now`.
    #[doc(hidden)]
    pub fn begin_due_retry(&mut self, now: i64) -> Result<(), TransitionError> {
        if self.state.is_claimable() && !self.is_due(now) {
            return Err(TransitionError::NotDue(self.id));
        }
        self.begin_retry(now)
    }

    /// Swap in a payload rebuilt from the live subject during a retry.
    #[doc(hidden)]
    pub fn replace_payload(&mut self, payload: Value, now: i64) -> Result<(), TransitionError> {
        self.expect_retrying()?;
        self.payload = payload;
        self.touch(now);
        Ok(())
    }

    /// Record a failed attempt: `Retrying -> Failed`.
    ///
    /// Retryable failures become due again after the linear backoff. A
    /// missing subject parks the event: no next-due time, skipped by
    /// scheduled cycles until re-admitted or handled by an operator.
    #[doc(hidden)]
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        kind: ErrorKind,
        now: i64,
        backoff: &LinearBackoff,
    ) -> Result<(), TransitionError> {
        self.expect_retrying()?;
        self.state = EventState::Failed;
        self.error_message = message.into();
        self.error_kind = kind;
        self.next_retry_at = if kind.is_retryable() {
            Some(backoff.next_retry_at(now, self.retry_count))
        } else {
            None
        };
        self.touch(now);
        Ok(())
    }

    /// Record a successful delivery: `Retrying -> Success`. The caller deletes.
    #[doc(hidden)]
    pub fn mark_delivered(&mut self, now: i64) -> Result<(), TransitionError> {
        self.expect_retrying()?;
        self.state = EventState::Success;
        self.next_retry_at = None;
        self.touch(now);
        Ok(())
    }

    /// Force success for an event fixed out-of-band. The caller deletes.
    #[doc(hidden)]
    pub fn resolve_externally(&mut self, now: i64) -> Result<(), TransitionError> {
        if !self.state.is_unresolved() {
            return Err(TransitionError::AlreadyResolved(self.id));
        }
        self.state = EventState::Success;
        self.next_retry_at = None;
        self.refreshed_in_flight = false;
        self.touch(now);
        Ok(())
    }

    /// End an attempt overtaken by a newer admission: `Retrying -> Pending`,
    /// keeping the fresh payload and error. The attempt's own result is
    /// dropped.
    #[doc(hidden)]
    pub fn requeue_refreshed(&mut self, now: i64) -> Result<(), TransitionError> {
        self.expect_retrying()?;
        if !self.refreshed_in_flight {
            return Err(TransitionError::NotRefreshed(self.id));
        }
        self.state = EventState::Pending;
        self.refreshed_in_flight = false;
        self.touch(now);
        Ok(())
    }

    /// Release an attempt that never completed (e.g. the process died or
    /// its result could not be stored), eligible immediately.
    ///
    /// `Retrying -> Failed`, or `Retrying -> Pending` when a newer failure
    /// was admitted meanwhile.
    #[doc(hidden)]
    pub fn interrupt(&mut self, now: i64) -> Result<(), TransitionError> {
        if self.refreshed_in_flight {
            return self.requeue_refreshed(now);
        }
        self.expect_retrying()?;
        self.state = EventState::Failed;
        self.error_message = "retry interrupted before completion".to_string();
        self.error_kind = ErrorKind::Unclassified;
        self.next_retry_at = None;
        self.touch(now);
        Ok(())
    }

    fn expect_retrying(&self) -> Result<(), TransitionError> {
        if self.state == EventState::Retrying {
            Ok(())
        } else {
            Err(TransitionError::NotRetrying {
                id: self.id,
                state: self.state,
            })
        }
    }

    fn touch(&mut self, now: i64) {
        self.updated_at = now;
        self.revision += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether a scheduled cycle should pick this event up at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.state.is_claimable()
            && !self.is_parked()
            && self.next_retry_at.map_or(true, |due| due <= now)
    }

    /// Failed because its subject is gone; waits for an operator or a new
    /// admission.
    pub fn is_parked(&self) -> bool {
        self.state == EventState::Failed && self.error_kind == ErrorKind::SubjectMissing
    }

    /// FIFO ordering key: sequence number, then creation time.
    pub fn fifo_key(&self) -> (u64, i64) {
        (self.sequence_number, self.created_at)
    }

    /// Operator-facing name, e.g. `Patient Sync - P-001 [failed]`.
    pub fn display_name(&self) -> String {
        let subject = match &self.subject {
            SubjectRef::LabTest { .. } => self
                .payload
                .get("name")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| "N/A".to_string()),
            other => other.label(),
        };
        format!("{} - {} [{}]", self.event_type().label(), subject, self.state)
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> EventType {
        self.subject.event_type()
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.subject.dedup_key()
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.error_kind
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn last_retry_at(&self) -> Option<i64> {
        self.last_retry_at
    }

    pub fn next_retry_at(&self) -> Option<i64> {
        self.next_retry_at
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Bumped on every transition; completions are conditional on it.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a newer failure arrived while the current attempt was in
    /// flight. Only ever set on `Retrying` events.
    pub fn is_refreshed_in_flight(&self) -> bool {
        self.refreshed_in_flight
    }
}
