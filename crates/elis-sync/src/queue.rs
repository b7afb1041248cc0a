//! The RetryQueue: admission, single-event retries and operator actions.
//!
//! The queue brings together the event store, the delivery attempter and
//! the subject resolver. Scheduled cycles and batches live in
//! [`crate::cycle`]; batches go through [`RetryQueue::retry_one`], cycles
//! through its due-only variant.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use elis_sync_core::{
    Admission, Clock, ErrorKind, EventId, FailedEvent, SubjectRef, SystemClock,
};
use elis_sync_delivery::{resolve, DeliveryAttempter, DeliveryFailure, Resolution, SubjectResolver};
use elis_sync_store::{
    AdmitOutcome, ClaimOutcome, Completion, EventFilter, EventStore, FailureRecord, StoreError,
};

use crate::config::RetryConfig;
use crate::error::{QueueError, Result};

/// How a single retry ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Delivered; the event was deleted.
    Delivered(EventId),
    /// Delivery failed; the event is `Failed` and due again later.
    Failed(FailedEvent),
    /// The subject is gone; the event is parked until an operator acts or a
    /// new failure is admitted for it.
    SubjectMissing(FailedEvent),
    /// A newer failure was admitted while the attempt was in flight. The
    /// attempt's result was dropped and the event is `Pending` again with
    /// the fresh payload.
    Requeued(FailedEvent),
    /// The event was resolved or discarded while the attempt was in flight;
    /// the attempt's result was dropped.
    Superseded(EventId),
}

impl RetryOutcome {
    pub fn id(&self) -> EventId {
        match self {
            RetryOutcome::Delivered(id) | RetryOutcome::Superseded(id) => *id,
            RetryOutcome::Failed(event)
            | RetryOutcome::SubjectMissing(event)
            | RetryOutcome::Requeued(event) => event.id(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryOutcome::Delivered(_))
    }
}

/// Result of one resolve-and-deliver run, before it is recorded.
enum Attempt {
    Delivered,
    Failed {
        failure: DeliveryFailure,
        sent_payload: Option<Value>,
    },
}

/// The failed-event retry queue.
///
/// Holds shared handles so each delivery attempt can run on its own task,
/// isolated from the cycle that started it.
pub struct RetryQueue<S, A, R> {
    store: Arc<S>,
    attempter: Arc<A>,
    resolver: Arc<R>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
    /// Single-flight guard for scheduled cycles.
    pub(crate) cycle_lock: Mutex<()>,
}

impl<S, A, R> RetryQueue<S, A, R>
where
    S: EventStore + 'static,
    A: DeliveryAttempter + 'static,
    R: SubjectResolver + 'static,
{
    /// Create a queue over the given store and collaborators.
    pub fn new(store: S, attempter: A, resolver: R, config: RetryConfig) -> Self {
        Self {
            store: Arc::new(store),
            attempter: Arc::new(attempter),
            resolver: Arc::new(resolver),
            clock: Arc::new(SystemClock),
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Replace the clock used for timestamps and backoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a failed sync for `subject`.
    ///
    /// Creates the event on the first failure; later failures for the same
    /// subject refresh it in place and reset its retry state, keeping its
    /// position in the FIFO order.
    pub async fn admit_failure(
        &self,
        subject: SubjectRef,
        payload: Value,
        error_message: impl Into<String>,
        error_kind: ErrorKind,
    ) -> Result<FailedEvent> {
        self.admit(Admission::new(subject, payload, error_message, error_kind))
            .await
    }

    /// Record a failed sync described by `admission`.
    pub async fn admit(&self, admission: Admission) -> Result<FailedEvent> {
        let outcome = self
            .store
            .admit(admission, self.now())
            .await
            .map_err(QueueError::from_operator)?;

        let event = outcome.event();
        match &outcome {
            AdmitOutcome::Created(_) => info!(
                event_id = %event.id(),
                sequence = event.sequence_number(),
                event_type = %event.event_type(),
                error = %event.error_message(),
                "admitted failed event"
            ),
            AdmitOutcome::Refreshed(_) => info!(
                event_id = %event.id(),
                sequence = event.sequence_number(),
                event_type = %event.event_type(),
                error = %event.error_message(),
                "refreshed failed event"
            ),
        }

        Ok(outcome.into_event())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Retries
    // ─────────────────────────────────────────────────────────────────────────

    /// Retry one event now, regardless of its next-due time.
    ///
    /// Fails with [`QueueError::EventNotFound`] if the event does not exist
    /// and [`QueueError::AlreadyRetrying`] if another attempt holds it.
    /// Delivery failures are not errors: they come back as an outcome.
    pub async fn retry_one(&self, id: EventId) -> Result<RetryOutcome> {
        let claim = self
            .store
            .claim(id, self.now())
            .await
            .map_err(QueueError::from_operator)?;
        self.retry_claim(id, claim).await
    }

    /// Retry one event selected by a scheduled cycle.
    ///
    /// The selection may be stale by the time the event comes up, so the
    /// claim re-checks that it is still due; if not, this fails with
    /// [`QueueError::NotDue`] and nothing is attempted.
    pub(crate) async fn retry_due(&self, id: EventId) -> Result<RetryOutcome> {
        let claim = self
            .store
            .claim_due(id, self.now())
            .await
            .map_err(QueueError::from_operator)?;
        self.retry_claim(id, claim).await
    }

    async fn retry_claim(&self, id: EventId, claim: ClaimOutcome) -> Result<RetryOutcome> {
        match claim {
            ClaimOutcome::Claimed(event) => self.retry_claimed(event).await,
            ClaimOutcome::Busy => Err(QueueError::AlreadyRetrying(id)),
            ClaimOutcome::NotDue => Err(QueueError::NotDue(id)),
            ClaimOutcome::NotFound => Err(QueueError::EventNotFound(id)),
        }
    }

    async fn retry_claimed(&self, event: FailedEvent) -> Result<RetryOutcome> {
        let id = event.id();
        let revision = event.revision();
        debug!(
            event_id = %id,
            sequence = event.sequence_number(),
            event_type = %event.event_type(),
            retry_count = event.retry_count(),
            "claimed event for retry"
        );

        let attempt = self
            .bounded_attempt(event.subject().clone(), event.payload().clone())
            .await;
        let now = self.now();

        let completion = match attempt {
            Attempt::Delivered => self.store.complete_success(id, revision, now).await,
            Attempt::Failed {
                failure,
                sent_payload,
            } => {
                let mut record = FailureRecord::new(failure.message, failure.kind);
                if let Some(payload) = sent_payload {
                    record = record.with_sent_payload(payload);
                }
                self.store
                    .complete_failure(id, revision, record, self.config.backoff(), now)
                    .await
            }
        };
        let completion = match completion {
            Ok(completion) => completion,
            Err(e) => {
                self.release_after_error(id, revision, &e).await;
                return Err(e.into());
            }
        };

        match completion {
            Completion::Deleted => {
                info!(
                    event_id = %id,
                    sequence = event.sequence_number(),
                    event_type = %event.event_type(),
                    retry_count = event.retry_count(),
                    "delivered failed event"
                );
                Ok(RetryOutcome::Delivered(id))
            }
            Completion::Updated(event) if event.is_parked() => {
                warn!(
                    event_id = %id,
                    event_type = %event.event_type(),
                    subject = %event.subject().label(),
                    "subject missing, event parked"
                );
                Ok(RetryOutcome::SubjectMissing(event))
            }
            Completion::Updated(event) => {
                warn!(
                    event_id = %id,
                    sequence = event.sequence_number(),
                    event_type = %event.event_type(),
                    retry_count = event.retry_count(),
                    error = %event.error_message(),
                    next_retry_at = ?event.next_retry_at(),
                    "retry failed"
                );
                Ok(RetryOutcome::Failed(event))
            }
            Completion::Requeued(event) => {
                info!(
                    event_id = %id,
                    sequence = event.sequence_number(),
                    event_type = %event.event_type(),
                    "newer failure admitted during retry, event requeued"
                );
                Ok(RetryOutcome::Requeued(event))
            }
            Completion::Superseded => {
                debug!(event_id = %id, "event resolved during retry, result dropped");
                Ok(RetryOutcome::Superseded(id))
            }
        }
    }

    /// Give the claim back when the attempt's result could not be stored,
    /// so the event is eligible again instead of sitting in `Retrying`
    /// until the next restart. Best effort.
    async fn release_after_error(&self, id: EventId, revision: u64, cause: &StoreError) {
        warn!(event_id = %id, error = %cause, "could not record retry result, releasing claim");
        match self.store.release_claim(id, revision, self.now()).await {
            Ok(Some(event)) => debug!(event_id = %id, state = %event.state(), "claim released"),
            Ok(None) => debug!(event_id = %id, "claim already gone"),
            Err(e) => error!(
                event_id = %id,
                error = %e,
                "could not release claim, event stays retrying until recovery"
            ),
        }
    }

    /// Resolve and deliver on a separate task, bounded by the attempt
    /// timeout. Panics and timeouts become classified failures.
    async fn bounded_attempt(&self, subject: SubjectRef, payload: Value) -> Attempt {
        let timeout = self.config.attempt_timeout;
        let mut handle = tokio::spawn(resolve_and_deliver(
            Arc::clone(&self.attempter),
            Arc::clone(&self.resolver),
            subject,
            payload,
        ));

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(attempt)) => attempt,
            Ok(Err(join)) => {
                let message = if join.is_panic() {
                    "delivery attempt panicked"
                } else {
                    "delivery attempt was cancelled"
                };
                Attempt::Failed {
                    failure: DeliveryFailure::unclassified(message),
                    sent_payload: None,
                }
            }
            Err(_) => {
                handle.abort();
                Attempt::Failed {
                    failure: DeliveryFailure::timeout(format!(
                        "delivery attempt exceeded {:?}",
                        timeout
                    )),
                    sent_payload: None,
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resolution
    // ─────────────────────────────────────────────────────────────────────────

    /// Force success for an event fixed out-of-band and delete it.
    pub async fn mark_resolved_externally(&self, id: EventId) -> Result<FailedEvent> {
        let event = self
            .store
            .resolve_externally(id, self.now())
            .await
            .map_err(QueueError::from_operator)?
            .ok_or(QueueError::EventNotFound(id))?;

        info!(
            event_id = %id,
            event_type = %event.event_type(),
            "event resolved externally"
        );
        Ok(event)
    }

    /// Delete an event without attempting delivery.
    pub async fn discard(&self, id: EventId) -> Result<FailedEvent> {
        let event = self
            .store
            .discard(id)
            .await
            .map_err(QueueError::from_operator)?
            .ok_or(QueueError::EventNotFound(id))?;

        info!(
            event_id = %id,
            event_type = %event.event_type(),
            retry_count = event.retry_count(),
            "event discarded"
        );
        Ok(event)
    }

    /// Delete every event owned by a deleted patient, order or product.
    pub async fn purge_subject(&self, subject: &SubjectRef) -> Result<usize> {
        let removed = self.store.purge_subject(subject).await?;
        if removed > 0 {
            info!(
                event_type = %subject.event_type(),
                subject = %subject.label(),
                removed,
                "purged events of deleted subject"
            );
        }
        Ok(removed)
    }

    /// Release events left `Retrying` by a previous process. Call at startup.
    pub async fn recover_interrupted(&self) -> Result<Vec<EventId>> {
        let recovered = self.store.recover_interrupted(self.now()).await?;
        if !recovered.is_empty() {
            warn!(
                count = recovered.len(),
                "released events left retrying by an interrupted run"
            );
        }
        Ok(recovered)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_event(&self, id: EventId) -> Result<Option<FailedEvent>> {
        Ok(self.store.get_event(id).await?)
    }

    /// List events in FIFO order.
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FailedEvent>> {
        Ok(self.store.list_events(filter).await?)
    }
}

async fn resolve_and_deliver<A, R>(
    attempter: Arc<A>,
    resolver: Arc<R>,
    subject: SubjectRef,
    payload: Value,
) -> Attempt
where
    A: DeliveryAttempter,
    R: SubjectResolver,
{
    let event_type = subject.event_type();

    let (payload, rebuilt) = match resolve(resolver.as_ref(), &subject, &payload).await {
        Ok(Resolution::Live) => (payload, false),
        Ok(Resolution::Rebuilt(rebuilt)) => (rebuilt, true),
        Ok(Resolution::NotFound) => {
            return Attempt::Failed {
                failure: DeliveryFailure::subject_missing(format!(
                    "{} subject {} no longer exists",
                    event_type.label(),
                    subject.label()
                )),
                sent_payload: None,
            }
        }
        Err(failure) => {
            return Attempt::Failed {
                failure,
                sent_payload: None,
            }
        }
    };

    match attempter.attempt(event_type, &payload).await {
        Ok(_) => Attempt::Delivered,
        Err(failure) => Attempt::Failed {
            failure,
            sent_payload: rebuilt.then_some(payload),
        },
    }
}
