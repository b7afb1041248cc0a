//! EventStore trait: the abstract interface for failed-event persistence.
//!
//! The trait exposes semantic operations only. There is no generic update:
//! every mutation is one of admission, claim, completion, resolution,
//! discard, cascade purge or crash recovery, and each runs atomically with
//! respect to the others.

use async_trait::async_trait;
use serde_json::Value;

use elis_sync_core::{
    Admission, DedupKey, ErrorKind, EventId, EventState, EventType, FailedEvent, LinearBackoff,
    SubjectRef,
};

use crate::error::Result;

/// Result of admitting a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// No unresolved event existed for the subject; a new one was created.
    Created(FailedEvent),
    /// The unresolved event for the subject was refreshed in place.
    Refreshed(FailedEvent),
}

impl AdmitOutcome {
    /// The event after admission.
    pub fn event(&self) -> &FailedEvent {
        match self {
            AdmitOutcome::Created(event) | AdmitOutcome::Refreshed(event) => event,
        }
    }

    /// Take the event.
    pub fn into_event(self) -> FailedEvent {
        match self {
            AdmitOutcome::Created(event) | AdmitOutcome::Refreshed(event) => event,
        }
    }

    /// Whether a new event was created.
    pub fn is_created(&self) -> bool {
        matches!(self, AdmitOutcome::Created(_))
    }
}

/// Result of trying to claim an event for a delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The event moved to `Retrying`; this is the claimed snapshot.
    Claimed(FailedEvent),
    /// Another attempt already holds the event.
    Busy,
    /// The event is not due at the claim time (backed off or parked). Only
    /// returned by [`EventStore::claim_due`].
    NotDue,
    /// No such event.
    NotFound,
}

/// How a delivery attempt ended, as recorded by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub message: String,
    pub kind: ErrorKind,
    /// The payload that was actually sent, when it differs from the stored one.
    pub sent_payload: Option<Value>,
}

impl FailureRecord {
    pub fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
            sent_payload: None,
        }
    }

    pub fn with_sent_payload(mut self, payload: Value) -> Self {
        self.sent_payload = Some(payload);
        self
    }
}

/// Result of completing a claimed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Delivery succeeded and the event was deleted.
    Deleted,
    /// Delivery failed and the event is now `Failed`.
    Updated(FailedEvent),
    /// A newer failure was admitted while the attempt was in flight. The
    /// attempt's result was dropped and the event is `Pending` again with
    /// the fresh payload.
    Requeued(FailedEvent),
    /// The event was resolved or discarded while the attempt was in flight;
    /// the newer state was kept.
    Superseded,
}

/// Selection of events due for a scheduled retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueQuery {
    /// Events with `next_retry_at <= now` (or unset) are due.
    pub now: i64,
    /// Maximum number of events returned.
    pub limit: usize,
    /// Event types eligible in this cycle.
    pub event_types: Vec<EventType>,
}

impl DueQuery {
    /// All event types, up to `limit` events.
    pub fn new(now: i64, limit: usize) -> Self {
        Self {
            now,
            limit,
            event_types: EventType::ALL.to_vec(),
        }
    }

    /// Restrict to the given event types.
    pub fn with_event_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = event_types;
        self
    }
}

/// Filter for operator listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub state: Option<EventState>,
    pub event_type: Option<EventType>,
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: EventState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes the state and type filters.
    pub fn matches(&self, event: &FailedEvent) -> bool {
        self.state.map_or(true, |s| event.state() == s)
            && self.event_type.map_or(true, |t| event.event_type() == t)
    }
}

/// The EventStore trait: async interface for failed-event persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **One unresolved event per subject**: `admit` looks up and writes in one
///   atomic step, so concurrent admissions for a subject never create two rows.
/// - **Conditional claim**: `claim` only succeeds from `Pending` or `Failed`;
///   `claim_due` additionally re-checks the schedule under the same lock.
/// - **Conditional completion**: completions carry the revision returned by
///   `claim` and are dropped as `Superseded` if the event moved on. A
///   re-admission during the attempt keeps the event claimed until the
///   completion requeues it.
/// - **No success rows**: successful completion deletes.
#[async_trait]
pub trait EventStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Sequence
    // ─────────────────────────────────────────────────────────────────────────

    /// Allocate the next FIFO sequence number.
    async fn next_sequence(&self) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the event for a first failure, or refresh the unresolved event
    /// for the same `(event_type, dedup_key)`.
    async fn admit(&self, admission: Admission, now: i64) -> Result<AdmitOutcome>;

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Get an event by id.
    async fn get_event(&self, id: EventId) -> Result<Option<FailedEvent>>;

    /// Get the unresolved event for a subject key.
    async fn find_unresolved(
        &self,
        event_type: EventType,
        dedup_key: &DedupKey,
    ) -> Result<Option<FailedEvent>>;

    /// List events ordered by `(sequence_number, created_at)`.
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FailedEvent>>;

    /// Events due for a scheduled retry, ordered by
    /// `(sequence_number, created_at)`. Parked events are never due.
    async fn select_due(&self, query: &DueQuery) -> Result<Vec<FailedEvent>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Retry lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Atomically move an event from `Pending|Failed` to `Retrying`.
    async fn claim(&self, id: EventId, now: i64) -> Result<ClaimOutcome>;

    /// Like [`EventStore::claim`], but for scheduled cycles: returns
    /// [`ClaimOutcome::NotDue`] unless the event is due at `now` when the
    /// claim is taken.
    async fn claim_due(&self, id: EventId, now: i64) -> Result<ClaimOutcome>;

    /// Give back a claim whose completion could not be recorded.
    ///
    /// Applies the interrupt transition if the event is still held by the
    /// claim at `revision` (or was refreshed during it), so the event is
    /// eligible again. Returns the released snapshot, or `None` if the claim
    /// was no longer held.
    async fn release_claim(
        &self,
        id: EventId,
        revision: u64,
        now: i64,
    ) -> Result<Option<FailedEvent>>;

    /// Delete a claimed event after successful delivery.
    async fn complete_success(&self, id: EventId, revision: u64, now: i64) -> Result<Completion>;

    /// Record a failed attempt on a claimed event.
    async fn complete_failure(
        &self,
        id: EventId,
        revision: u64,
        failure: FailureRecord,
        backoff: LinearBackoff,
        now: i64,
    ) -> Result<Completion>;

    // ─────────────────────────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Force success and delete. Returns the resolved snapshot, or `None` if
    /// the event does not exist.
    async fn resolve_externally(&self, id: EventId, now: i64) -> Result<Option<FailedEvent>>;

    /// Delete without delivery. Returns the deleted snapshot, if any.
    async fn discard(&self, id: EventId) -> Result<Option<FailedEvent>>;

    /// Delete every event owned by a deleted subject. Returns how many.
    async fn purge_subject(&self, subject: &SubjectRef) -> Result<usize>;

    /// Release events left `Retrying` by a crash. Returns their ids.
    async fn recover_interrupted(&self, now: i64) -> Result<Vec<EventId>>;
}
