//! End-to-end behaviour of the retry queue, run against both backends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use elis_sync::core::{DedupKey, LinearBackoff};
use elis_sync::store::{
    self, AdmitOutcome, ClaimOutcome, Completion, DueQuery, EventStore, FailureRecord,
    MemoryStore, StoreError,
};
use elis_sync::{
    Admission, EventFilter, EventId, EventState, EventType, ErrorKind, FailedEvent, QueueError,
    RetryConfig, RetryOutcome, RetryQueue, SkipReason, SubjectRef,
};
use elis_sync_delivery::DeliveryFailure;
use elis_sync_testkit::{
    memory_store, sqlite_store, MapResolver, ScriptedAttempter, Step, TestFixture,
};

const MINUTE: i64 = 60_000;

type Queue<S> = RetryQueue<S, ScriptedAttempter, MapResolver>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn queue<S: EventStore + 'static>(store: S, fx: &TestFixture, config: RetryConfig) -> Queue<S> {
    init_tracing();
    RetryQueue::new(store, fx.attempter.clone(), fx.resolver.clone(), config)
        .with_clock(fx.clock())
}

fn slow_config() -> RetryConfig {
    RetryConfig {
        attempt_timeout: Duration::from_secs(5),
        ..RetryConfig::default()
    }
}

async fn events<S: EventStore + 'static>(queue: &Queue<S>) -> anyhow::Result<Vec<elis_sync::FailedEvent>> {
    Ok(queue.list_events(&EventFilter::all()).await?)
}

/// Store whose next completion fails once armed, as if the disk went away
/// between the delivery and its bookkeeping.
struct FlakyStore<S> {
    inner: S,
    fail_completion: AtomicBool,
}

impl<S> FlakyStore<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            fail_completion: AtomicBool::new(false),
        }
    }

    fn fail_next_completion(&self) {
        self.fail_completion.store(true, Ordering::SeqCst);
    }

    fn tripped(&self) -> store::Result<()> {
        if self.fail_completion.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Task("disk I/O error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: EventStore> EventStore for FlakyStore<S> {
    async fn next_sequence(&self) -> store::Result<u64> {
        self.inner.next_sequence().await
    }

    async fn admit(&self, admission: Admission, now: i64) -> store::Result<AdmitOutcome> {
        self.inner.admit(admission, now).await
    }

    async fn get_event(&self, id: EventId) -> store::Result<Option<FailedEvent>> {
        self.inner.get_event(id).await
    }

    async fn find_unresolved(
        &self,
        event_type: EventType,
        dedup_key: &DedupKey,
    ) -> store::Result<Option<FailedEvent>> {
        self.inner.find_unresolved(event_type, dedup_key).await
    }

    async fn list_events(&self, filter: &EventFilter) -> store::Result<Vec<FailedEvent>> {
        self.inner.list_events(filter).await
    }

    async fn select_due(&self, query: &DueQuery) -> store::Result<Vec<FailedEvent>> {
        self.inner.select_due(query).await
    }

    async fn claim(&self, id: EventId, now: i64) -> store::Result<ClaimOutcome> {
        self.inner.claim(id, now).await
    }

    async fn claim_due(&self, id: EventId, now: i64) -> store::Result<ClaimOutcome> {
        self.inner.claim_due(id, now).await
    }

    async fn release_claim(
        &self,
        id: EventId,
        revision: u64,
        now: i64,
    ) -> store::Result<Option<FailedEvent>> {
        self.inner.release_claim(id, revision, now).await
    }

    async fn complete_success(
        &self,
        id: EventId,
        revision: u64,
        now: i64,
    ) -> store::Result<Completion> {
        self.tripped()?;
        self.inner.complete_success(id, revision, now).await
    }

    async fn complete_failure(
        &self,
        id: EventId,
        revision: u64,
        failure: FailureRecord,
        backoff: LinearBackoff,
        now: i64,
    ) -> store::Result<Completion> {
        self.tripped()?;
        self.inner
            .complete_failure(id, revision, failure, backoff, now)
            .await
    }

    async fn resolve_externally(&self, id: EventId, now: i64) -> store::Result<Option<FailedEvent>> {
        self.inner.resolve_externally(id, now).await
    }

    async fn discard(&self, id: EventId) -> store::Result<Option<FailedEvent>> {
        self.inner.discard(id).await
    }

    async fn purge_subject(&self, subject: &SubjectRef) -> store::Result<usize> {
        self.inner.purge_subject(subject).await
    }

    async fn recover_interrupted(&self, now: i64) -> store::Result<Vec<EventId>> {
        self.inner.recover_interrupted(now).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

async fn readmission_keeps_first_sequence<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let first = queue.admit(fx.patient(1, "P-001", 1)).await?;
    fx.clock.advance(Duration::from_secs(60));
    let second = queue.admit(fx.patient(1, "P-001", 2)).await?;

    let all = events(&queue).await?;
    assert_eq!(all.len(), 1);
    let event = &all[0];
    assert_eq!(event.id(), first.id());
    assert_eq!(second.id(), first.id());
    assert_eq!(event.sequence_number(), first.sequence_number());
    assert_eq!(event.payload()["version"], json!(2));
    assert_eq!(event.retry_count(), 0);
    assert_eq!(event.state(), EventState::Pending);
    assert_eq!(event.display_name(), "Patient Sync - P-001 [pending]");
    Ok(())
}

async fn cycle_isolates_failures_in_fifo_order<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    // Burn sequence numbers 1-4 so the events below get 5, 6 and 7.
    for _ in 0..4 {
        queue.store().next_sequence().await?;
    }
    let e5 = queue.admit(fx.patient(5, "P-005", 1)).await?;
    let e6 = queue.admit(fx.patient(6, "P-006", 1)).await?;
    let e7 = queue.admit(fx.patient(7, "P-007", 1)).await?;
    assert_eq!(
        [e5.sequence_number(), e6.sequence_number(), e7.sequence_number()],
        [5, 6, 7]
    );

    fx.attempter
        .then_succeed()
        .then_fail(DeliveryFailure::connection("connection reset"))
        .then_succeed();

    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.processed, vec![e5.id(), e6.id(), e7.id()]);
    assert_eq!(
        fx.attempter.called_with("ref"),
        vec![json!("P-005"), json!("P-006"), json!("P-007")]
    );

    let left = events(&queue).await?;
    assert_eq!(left.len(), 1);
    let failed = &left[0];
    assert_eq!(failed.id(), e6.id());
    assert_eq!(failed.state(), EventState::Failed);
    assert_eq!(failed.retry_count(), 1);
    assert_eq!(failed.error_kind(), ErrorKind::ConnectionFailure);
    assert_eq!(failed.error_message(), "connection reset");
    assert_eq!(failed.last_retry_at(), Some(fx.now()));
    assert_eq!(failed.next_retry_at(), Some(fx.now() + 15 * MINUTE));
    Ok(())
}

async fn resolved_event_is_gone<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture {
        attempter: ScriptedAttempter::failing(DeliveryFailure::http(500, "boom")),
        ..TestFixture::new()
    };
    let queue = queue(store, &fx, RetryConfig::default());

    let event = queue.admit(fx.test_order(3)).await?;
    let outcome = queue.retry_one(event.id()).await?;
    assert!(matches!(outcome, RetryOutcome::Failed(ref e) if e.state() == EventState::Failed));

    let resolved = queue.mark_resolved_externally(event.id()).await?;
    assert_eq!(resolved.state(), EventState::Success);
    assert!(queue.get_event(event.id()).await?.is_none());

    let err = queue.retry_one(event.id()).await.unwrap_err();
    assert!(matches!(err, QueueError::EventNotFound(id) if id == event.id()));

    let err = queue.mark_resolved_externally(event.id()).await.unwrap_err();
    assert!(matches!(err, QueueError::EventNotFound(_)));
    Ok(())
}

async fn backoff_grows_linearly<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture {
        attempter: ScriptedAttempter::failing(DeliveryFailure::timeout("read timed out")),
        ..TestFixture::new()
    };
    let queue = queue(store, &fx, RetryConfig::default());
    let id = queue.admit(fx.lab_test(2, "Lipid Panel")).await?.id();

    for k in 1..=4u32 {
        let report = queue.run_retry_cycle().await?;
        assert_eq!(report.failed, 1, "cycle {}", k);

        let event = queue.get_event(id).await?.expect("event kept");
        assert_eq!(event.retry_count(), k);
        let last = event.last_retry_at().expect("last retry recorded");
        assert_eq!(event.next_retry_at(), Some(last + 15 * MINUTE * k as i64));

        // Not due a millisecond early.
        fx.clock.set(last + 15 * MINUTE * k as i64 - 1);
        assert_eq!(queue.run_retry_cycle().await?.attempted(), 0);
        fx.clock.advance(Duration::from_millis(1));
    }
    Ok(())
}

async fn panicking_attempt_does_not_stop_batch<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let first = queue.admit(fx.test_order(1)).await?;
    let second = queue.admit(fx.test_order(2)).await?;
    fx.attempter.push(Step::Panic);

    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.processed, vec![first.id(), second.id()]);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);

    let event = queue.get_event(first.id()).await?.expect("failed event kept");
    assert_eq!(event.error_kind(), ErrorKind::Unclassified);
    assert_eq!(event.error_message(), "delivery attempt panicked");
    assert!(queue.get_event(second.id()).await?.is_none());
    Ok(())
}

async fn hung_attempt_times_out<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let config = RetryConfig {
        attempt_timeout: Duration::from_millis(50),
        ..RetryConfig::default()
    };
    let queue = queue(store, &fx, config);

    let id = queue.admit(fx.lab_test(1, "CBC")).await?.id();
    fx.attempter.push(Step::Hang(Duration::from_secs(10)));

    let RetryOutcome::Failed(event) = queue.retry_one(id).await? else {
        panic!("expected a failed retry");
    };
    assert_eq!(event.error_kind(), ErrorKind::Timeout);
    assert_eq!(event.retry_count(), 1);
    assert!(event.next_retry_at().is_some());
    Ok(())
}

async fn missing_subject_parks_event<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let order = SubjectRef::test_order(9, None);
    let id = queue.admit(fx.test_order(9)).await?.id();
    fx.resolver.missing(&order);

    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.subject_missing, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(fx.attempter.call_count(), 0);

    let parked = queue.get_event(id).await?.expect("parked event kept");
    assert!(parked.is_parked());
    assert_eq!(parked.error_kind(), ErrorKind::SubjectMissing);
    assert_eq!(parked.next_retry_at(), None);

    // Never picked up by a schedule.
    fx.clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(queue.run_retry_cycle().await?.attempted(), 0);

    // A new failure for the same order un-parks it in place.
    let refreshed = queue.admit(fx.test_order(9)).await?;
    assert_eq!(refreshed.id(), id);
    assert_eq!(refreshed.state(), EventState::Pending);

    fx.resolver.restore(&order);
    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.succeeded, 1);
    assert!(events(&queue).await?.is_empty());
    Ok(())
}

async fn operator_can_retry_parked_event<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let patient = SubjectRef::patient(4, Some("P-004"));
    let id = queue.admit(fx.patient(4, "P-004", 1)).await?.id();
    fx.resolver.missing(&patient);
    assert!(matches!(
        queue.retry_one(id).await?,
        RetryOutcome::SubjectMissing(_)
    ));

    fx.resolver.restore(&patient);
    assert_eq!(queue.retry_one(id).await?, RetryOutcome::Delivered(id));
    Ok(())
}

async fn rebuilt_payload_is_sent_and_kept<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let subject = SubjectRef::patient(3, Some("P-003"));
    let id = queue.admit(fx.patient(3, "P-003", 1)).await?.id();
    let rebuilt = json!({ "id": 3, "ref": "P-003", "version": 7, "rebuilt": true });
    fx.resolver.rebuild(&subject, rebuilt.clone());
    fx.attempter.then_fail(DeliveryFailure::http(502, "Bad Gateway"));

    let RetryOutcome::Failed(event) = queue.retry_one(id).await? else {
        panic!("expected a failed retry");
    };
    assert_eq!(fx.attempter.calls()[0].payload, rebuilt);
    assert_eq!(event.payload(), &rebuilt);
    assert_eq!(event.error_kind(), ErrorKind::HttpError(502));
    assert_eq!(event.error_message(), "HTTP 502: Bad Gateway");
    Ok(())
}

async fn overlapping_cycle_is_skipped<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, slow_config());

    queue.admit(fx.lab_test(1, "CBC")).await?;
    fx.attempter.push(Step::Hang(Duration::from_millis(300)));

    let (first, second) = tokio::join!(queue.run_retry_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.run_retry_cycle().await
    });

    let (first, second) = (first?, second?);
    assert_eq!(first.succeeded, 1);
    assert_eq!(second.skipped, Some(SkipReason::CycleInProgress));
    assert_eq!(second.attempted(), 0);
    assert_eq!(fx.attempter.call_count(), 1);
    Ok(())
}

async fn manual_retry_during_cycle_is_rejected<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, slow_config());

    let id = queue.admit(fx.lab_test(1, "CBC")).await?.id();
    fx.attempter.push(Step::Hang(Duration::from_millis(300)));

    let (cycle, manual) = tokio::join!(queue.run_retry_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.retry_one(id).await
    });

    assert_eq!(cycle?.succeeded, 1);
    assert!(matches!(manual, Err(QueueError::AlreadyRetrying(busy)) if busy == id));
    assert_eq!(fx.attempter.call_count(), 1);
    Ok(())
}

async fn readmission_during_attempt_wins<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, slow_config());

    let id = queue.admit(fx.lab_test(1, "CBC")).await?.id();
    fx.attempter.push(Step::Hang(Duration::from_millis(300)));

    let (cycle, (readmitted, manual)) = tokio::join!(queue.run_retry_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let readmitted = queue.admit(fx.lab_test(1, "CBC (revised)")).await;
        // The refreshed event must not be deliverable twice at once.
        let manual = queue.retry_one(id).await;
        (readmitted, manual)
    });

    let cycle = cycle?;
    let readmitted = readmitted?;
    assert_eq!(readmitted.id(), id);
    assert_eq!(readmitted.state(), EventState::Retrying);
    assert!(matches!(manual, Err(QueueError::AlreadyRetrying(busy)) if busy == id));
    assert_eq!(cycle.requeued, 1);
    assert_eq!(cycle.succeeded, 0);
    assert_eq!(fx.attempter.call_count(), 1);

    // The stale success did not delete the fresh failure.
    let event = queue.get_event(id).await?.expect("fresh payload kept");
    assert_eq!(event.state(), EventState::Pending);
    assert_eq!(event.retry_count(), 0);
    assert_eq!(event.payload()["name"], json!("CBC (revised)"));
    assert_eq!(event.display_name(), "Lab Test - CBC (revised) [pending]");

    assert_eq!(queue.run_retry_cycle().await?.succeeded, 1);
    assert!(queue.get_event(id).await?.is_none());
    assert_eq!(
        fx.attempter.called_with("name"),
        vec![json!("CBC"), json!("CBC (revised)")]
    );
    Ok(())
}

async fn manual_failure_during_cycle_keeps_backoff<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, slow_config());

    let a = queue.admit(fx.lab_test(1, "A")).await?.id();
    let b = queue.admit(fx.lab_test(2, "B")).await?.id();
    fx.attempter
        .push(Step::Hang(Duration::from_millis(300)))
        .then_fail(DeliveryFailure::connection("connection refused"));

    // The cycle selects both; while it is busy with A an operator retries B,
    // which fails and backs off.
    let (cycle, manual) = tokio::join!(queue.run_retry_cycle(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.retry_one(b).await
    });

    assert!(matches!(manual?, RetryOutcome::Failed(ref e) if e.id() == b));
    let cycle = cycle?;
    assert_eq!(cycle.processed, vec![a]);
    assert_eq!(cycle.not_due, vec![b]);
    assert_eq!(cycle.succeeded, 1);
    assert_eq!(fx.attempter.call_count(), 2);

    let event = queue.get_event(b).await?.expect("backed-off event kept");
    assert_eq!(event.state(), EventState::Failed);
    assert_eq!(event.retry_count(), 1);
    assert_eq!(event.next_retry_at(), Some(fx.now() + 15 * MINUTE));
    Ok(())
}

async fn completion_error_releases_claim<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(FlakyStore::new(store), &fx, RetryConfig::default());

    let id = queue.admit(fx.test_order(1)).await?.id();

    // Delivered, but the deletion fails.
    queue.store().fail_next_completion();
    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.attempted(), 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, id);
    assert!(report.errors[0].1.contains("disk I/O error"));

    let event = queue.get_event(id).await?.expect("event kept");
    assert_eq!(event.state(), EventState::Failed);
    assert!(event.is_due(fx.now()));

    // Delivery fails and recording the failure fails too.
    queue.store().fail_next_completion();
    fx.attempter.then_fail(DeliveryFailure::http(503, "unavailable"));
    assert!(matches!(
        queue.retry_one(id).await,
        Err(QueueError::Store(StoreError::Task(_)))
    ));

    let event = queue.get_event(id).await?.expect("event kept");
    assert_eq!(event.state(), EventState::Failed);
    assert_eq!(event.retry_count(), 2);
    assert!(event.is_due(fx.now()));

    assert_eq!(queue.run_retry_cycle().await?.succeeded, 1);
    assert!(queue.get_event(id).await?.is_none());
    assert_eq!(fx.attempter.call_count(), 3);
    Ok(())
}

async fn concurrent_admissions_get_unique_sequences<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = Arc::new(queue(store, &fx, RetryConfig::default()));

    // Forty admissions over ten patients, all in flight together.
    let mut handles = Vec::new();
    for n in 0..40u32 {
        let patient = i64::from(n % 10) + 1;
        let admission = fx.patient(patient, &format!("P-{:03}", patient), n);
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move { queue.admit(admission).await }));
    }
    for handle in handles {
        handle.await??;
    }

    let all = events(&queue).await?;
    assert_eq!(all.len(), 10);
    let sequences: HashSet<u64> = all.iter().map(|e| e.sequence_number()).collect();
    assert_eq!(sequences.len(), 10);
    let subjects: HashSet<_> = all.iter().map(|e| e.dedup_key()).collect();
    assert_eq!(subjects.len(), 10);

    // Refreshes never consume a sequence number.
    assert_eq!(queue.store().next_sequence().await?, 11);
    Ok(())
}

async fn disabled_queue_skips_cycles<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let config = RetryConfig {
        enabled: false,
        ..RetryConfig::default()
    };
    let queue = queue(store, &fx, config);

    let id = queue.admit(fx.test_order(1)).await?.id();
    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.skipped, Some(SkipReason::Disabled));
    assert_eq!(fx.attempter.call_count(), 0);

    // Operators can still retry by hand.
    assert!(queue.retry_one(id).await?.is_delivered());
    Ok(())
}

async fn patient_sync_switch_leaves_patients_alone<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let config = RetryConfig {
        patient_sync_enabled: false,
        ..RetryConfig::default()
    };
    let queue = queue(store, &fx, config);

    let patient = queue.admit(fx.patient(1, "P-001", 1)).await?;
    let order = queue.admit(fx.test_order(1)).await?;

    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.processed, vec![order.id()]);

    let untouched = queue.get_event(patient.id()).await?.expect("patient event kept");
    assert_eq!(untouched.state(), EventState::Pending);
    assert_eq!(untouched.retry_count(), 0);
    Ok(())
}

async fn batch_runs_in_fifo_order<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let a = queue.admit(fx.lab_test(1, "A")).await?.id();
    let b = queue.admit(fx.lab_test(2, "B")).await?.id();
    let c = queue.admit(fx.lab_test(3, "C")).await?.id();
    let unknown = EventId(9_999);

    let report = queue.retry_batch(&[c, unknown, a, c]).await?;
    assert_eq!(report.processed, vec![a, c]);
    assert_eq!(report.not_found, vec![unknown]);
    assert_eq!(report.succeeded, 2);
    assert_eq!(fx.attempter.called_with("name"), vec![json!("A"), json!("C")]);

    let left: Vec<EventId> = events(&queue).await?.iter().map(|e| e.id()).collect();
    assert_eq!(left, vec![b]);
    Ok(())
}

async fn batch_size_limits_cycle<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let config = RetryConfig {
        batch_size: 2,
        ..RetryConfig::default()
    };
    let queue = queue(store, &fx, config);

    for id in 1..=3 {
        queue.admit(fx.test_order(id)).await?;
    }

    assert_eq!(queue.run_retry_cycle().await?.attempted(), 2);
    assert_eq!(queue.run_retry_cycle().await?.attempted(), 1);
    assert_eq!(queue.run_retry_cycle().await?.attempted(), 0);
    Ok(())
}

async fn failed_event_waits_for_backoff<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let id = queue.admit(fx.test_order(1)).await?.id();
    fx.attempter.then_fail(DeliveryFailure::connection("refused"));

    assert_eq!(queue.run_retry_cycle().await?.failed, 1);
    assert_eq!(queue.run_retry_cycle().await?.attempted(), 0);

    fx.clock.advance(Duration::from_secs(15 * 60));
    let report = queue.run_retry_cycle().await?;
    assert_eq!(report.succeeded, 1);
    assert!(queue.get_event(id).await?.is_none());
    Ok(())
}

async fn purge_and_discard<S: EventStore + 'static>(store: S) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    queue.admit(fx.patient(1, "P-001", 1)).await?;
    let other = queue.admit(fx.patient(2, "P-002", 1)).await?;
    let order = queue.admit(fx.test_order(1)).await?;

    let removed = queue.purge_subject(&SubjectRef::patient(1, None)).await?;
    assert_eq!(removed, 1);

    let discarded = queue.discard(other.id()).await?;
    assert_eq!(discarded.id(), other.id());
    assert!(matches!(
        queue.discard(other.id()).await,
        Err(QueueError::EventNotFound(_))
    ));

    let left: Vec<EventId> = events(&queue).await?.iter().map(|e| e.id()).collect();
    assert_eq!(left, vec![order.id()]);
    Ok(())
}

async fn list_filters_by_state_and_type<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    queue.admit(fx.patient(1, "P-001", 1)).await?;
    let order = queue.admit(fx.test_order(1)).await?;
    queue.admit(fx.lab_test(1, "CBC")).await?;
    fx.attempter.then_fail(DeliveryFailure::http(500, ""));
    queue.retry_one(order.id()).await?;

    let failed = queue
        .list_events(&EventFilter::all().state(EventState::Failed))
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id(), order.id());

    let mut by_type = HashMap::new();
    for event in events(&queue).await? {
        *by_type.entry(event.event_type()).or_insert(0) += 1;
    }
    assert_eq!(by_type.len(), 3);
    Ok(())
}

async fn recovery_releases_interrupted_claims<S: EventStore + 'static>(
    store: S,
) -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = queue(store, &fx, RetryConfig::default());

    let id = queue.admit(fx.test_order(1)).await?.id();
    // Simulate a crash between claim and completion.
    queue.store().claim(id, fx.now()).await?;
    assert!(matches!(
        queue.retry_one(id).await,
        Err(QueueError::AlreadyRetrying(_))
    ));

    assert_eq!(queue.recover_interrupted().await?, vec![id]);
    assert_eq!(queue.run_retry_cycle().await?.succeeded, 1);
    Ok(())
}

macro_rules! on_both_backends {
    ($($scenario:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $scenario() -> anyhow::Result<()> {
                    super::$scenario(super::memory_store()).await
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $scenario() -> anyhow::Result<()> {
                    super::$scenario(super::sqlite_store()).await
                }
            )*
        }
    };
}

on_both_backends!(
    readmission_keeps_first_sequence,
    cycle_isolates_failures_in_fifo_order,
    resolved_event_is_gone,
    backoff_grows_linearly,
    panicking_attempt_does_not_stop_batch,
    hung_attempt_times_out,
    missing_subject_parks_event,
    operator_can_retry_parked_event,
    rebuilt_payload_is_sent_and_kept,
    overlapping_cycle_is_skipped,
    manual_retry_during_cycle_is_rejected,
    readmission_during_attempt_wins,
    disabled_queue_skips_cycles,
    patient_sync_switch_leaves_patients_alone,
    batch_runs_in_fifo_order,
    batch_size_limits_cycle,
    failed_event_waits_for_backoff,
    purge_and_discard,
    list_filters_by_state_and_type,
    recovery_releases_interrupted_claims,
    manual_failure_during_cycle_keeps_backoff,
    completion_error_releases_claim,
    concurrent_admissions_get_unique_sequences,
);

#[tokio::test]
async fn on_disk_queue_survives_restart() -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("retry-queue.db");

    let id = {
        let store = elis_sync::store::SqliteStore::open(&path)?;
        let queue = queue(store, &fx, RetryConfig::default());
        let id = queue.admit(fx.test_order(42)).await?.id();
        queue.store().claim(id, fx.now()).await?;
        id
    };

    let store = elis_sync::store::SqliteStore::open(&path)?;
    let queue = queue(store, &fx, RetryConfig::default());
    assert_eq!(queue.recover_interrupted().await?, vec![id]);

    let event = queue.get_event(id).await?.expect("event persisted");
    assert_eq!(event.state(), EventState::Failed);
    assert_eq!(event.retry_count(), 1);

    assert_eq!(queue.run_retry_cycle().await?.succeeded, 1);
    Ok(())
}

#[tokio::test]
async fn unknown_event_errors() {
    let fx = TestFixture::new();
    let queue = queue(MemoryStore::new(), &fx, RetryConfig::default());

    assert!(matches!(
        queue.retry_one(EventId(1)).await,
        Err(QueueError::EventNotFound(_))
    ));
    assert!(matches!(
        queue.discard(EventId(1)).await,
        Err(QueueError::EventNotFound(_))
    ));
    assert!(queue.get_event(EventId(1)).await.unwrap().is_none());
}
