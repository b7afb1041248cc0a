//! Scheduled retry cycles and operator batches.
//!
//! Both process events strictly serially in `(sequence_number, created_at)`
//! order. A failure of one event, whatever its cause, is recorded in the
//! report and the batch moves on.

use std::collections::BTreeSet;

use tracing::{debug, error, info};

use elis_sync_core::{EventId, FailedEvent};
use elis_sync_delivery::{DeliveryAttempter, SubjectResolver};
use elis_sync_store::{DueQuery, EventStore};

use crate::error::{QueueError, Result};
use crate::queue::{RetryOutcome, RetryQueue};

/// Why a cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Scheduled retries are switched off in the configuration.
    Disabled,
    /// Another cycle is still running.
    CycleInProgress,
}

/// Tally of a retry cycle or batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Events attempted, in processing order.
    pub processed: Vec<EventId>,
    pub succeeded: usize,
    pub failed: usize,
    /// Attempts that found their subject deleted.
    pub subject_missing: usize,
    /// Attempts overtaken by a newer admission; the event is pending again.
    pub requeued: usize,
    /// Attempts whose result was dropped because the event was resolved or
    /// discarded meanwhile.
    pub superseded: usize,
    /// Events held by another attempt and left alone.
    pub busy: Vec<EventId>,
    /// Selected events that were no longer due when their turn came (e.g.
    /// retried by an operator mid-cycle). Not attempted.
    pub not_due: Vec<EventId>,
    /// Requested or selected events that no longer exist.
    pub not_found: Vec<EventId>,
    /// Events whose retry hit a storage error.
    pub errors: Vec<(EventId, String)>,
    /// Set when the cycle did not run at all.
    pub skipped: Option<SkipReason>,
}

impl RetryReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// Number of delivery attempts made.
    pub fn attempted(&self) -> usize {
        self.processed.len()
    }

    fn record(&mut self, id: EventId, result: Result<RetryOutcome>) {
        match result {
            Ok(outcome) => {
                self.processed.push(id);
                match outcome {
                    RetryOutcome::Delivered(_) => self.succeeded += 1,
                    RetryOutcome::Failed(_) => self.failed += 1,
                    RetryOutcome::SubjectMissing(_) => self.subject_missing += 1,
                    RetryOutcome::Requeued(_) => self.requeued += 1,
                    RetryOutcome::Superseded(_) => self.superseded += 1,
                }
            }
            Err(QueueError::AlreadyRetrying(_)) => self.busy.push(id),
            Err(QueueError::NotDue(_)) => self.not_due.push(id),
            Err(QueueError::EventNotFound(_)) => self.not_found.push(id),
            Err(e) => {
                error!(event_id = %id, error = %e, "retry aborted by storage error");
                self.errors.push((id, e.to_string()));
            }
        }
    }
}

impl<S, A, R> RetryQueue<S, A, R>
where
    S: EventStore + 'static,
    A: DeliveryAttempter + 'static,
    R: SubjectResolver + 'static,
{
    /// Run one scheduled cycle: select due events and retry them in order.
    ///
    /// Safe to call while another cycle runs; the overlapping call returns
    /// at once with [`SkipReason::CycleInProgress`].
    pub async fn run_retry_cycle(&self) -> Result<RetryReport> {
        if !self.config().enabled {
            info!("scheduled retries disabled, skipping cycle");
            return Ok(RetryReport::skipped(SkipReason::Disabled));
        }

        let Ok(_guard) = self.cycle_lock.try_lock() else {
            debug!("retry cycle already running, skipping");
            return Ok(RetryReport::skipped(SkipReason::CycleInProgress));
        };

        let query = DueQuery::new(self.now(), self.config().batch_size)
            .with_event_types(self.config().scheduled_event_types());
        let due = self.store().select_due(&query).await?;
        info!(due = due.len(), "starting retry cycle");

        let mut report = RetryReport::default();
        for event in &due {
            let result = self.retry_due(event.id()).await;
            report.record(event.id(), result);
        }

        info!(
            attempted = report.attempted(),
            succeeded = report.succeeded,
            failed = report.failed,
            subject_missing = report.subject_missing,
            requeued = report.requeued,
            superseded = report.superseded,
            busy = report.busy.len(),
            not_due = report.not_due.len(),
            errors = report.errors.len(),
            "retry cycle finished"
        );
        Ok(report)
    }

    /// Retry the given events now, in FIFO order, regardless of due time.
    ///
    /// Unknown ids are reported in [`RetryReport::not_found`].
    pub async fn retry_batch(&self, ids: &[EventId]) -> Result<RetryReport> {
        let mut report = RetryReport::default();
        let mut events = Vec::with_capacity(ids.len());

        let unique: BTreeSet<EventId> = ids.iter().copied().collect();
        for id in unique {
            match self.store().get_event(id).await? {
                Some(event) => events.push(event),
                None => report.not_found.push(id),
            }
        }
        events.sort_by_key(FailedEvent::fifo_key);

        for event in &events {
            let result = self.retry_one(event.id()).await;
            report.record(event.id(), result);
        }

        info!(
            requested = ids.len(),
            attempted = report.attempted(),
            succeeded = report.succeeded,
            failed = report.failed,
            not_found = report.not_found.len(),
            "manual retry batch finished"
        );
        Ok(report)
    }
}
