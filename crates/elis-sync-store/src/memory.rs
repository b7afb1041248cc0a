//! In-memory implementation of the EventStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use elis_sync_core::{
    Admission, DedupKey, EventId, EventState, EventType, FailedEvent, LinearBackoff,
    SequenceAllocator, SubjectRef, TransitionError,
};

use crate::error::Result;
use crate::traits::{
    AdmitOutcome, ClaimOutcome, Completion, DueQuery, EventFilter, EventStore, FailureRecord,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock; every
/// mutation holds the write lock for its whole read-check-write.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    sequence: SequenceAllocator,
}

struct MemoryStoreInner {
    /// Events indexed by id. Only unresolved events are kept.
    events: BTreeMap<EventId, FailedEvent>,

    /// Dedup index: (event_type, dedup_key) -> id.
    unresolved: HashMap<(EventType, DedupKey), EventId>,

    /// Last id handed out. Ids are never reused.
    last_id: u64,
}

impl MemoryStoreInner {
    fn remove(&mut self, id: EventId) -> Option<FailedEvent> {
        let event = self.events.remove(&id)?;
        self.unresolved
            .remove(&(event.event_type(), event.dedup_key()));
        Some(event)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner {
                events: BTreeMap::new(),
                unresolved: HashMap::new(),
                last_id: 0,
            }),
            sequence: SequenceAllocator::new(),
        }
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().events.len()
    }

    /// Whether the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_claim(&self, id: EventId, now: i64, due_only: bool) -> Result<ClaimOutcome> {
        let mut inner = self.inner.write().unwrap();

        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let claimed = if due_only {
            event.begin_due_retry(now)
        } else {
            event.begin_retry(now)
        };
        match claimed {
            Ok(()) => Ok(ClaimOutcome::Claimed(event.clone())),
            Err(TransitionError::AlreadyRetrying(_)) => Ok(ClaimOutcome::Busy),
            Err(TransitionError::NotDue(_)) => Ok(ClaimOutcome::NotDue),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion for a claim whose revision no longer matches.
fn stale_completion(event: &mut FailedEvent, now: i64) -> Result<Completion> {
    if event.is_refreshed_in_flight() {
        event.requeue_refreshed(now)?;
        return Ok(Completion::Requeued(event.clone()));
    }
    Ok(Completion::Superseded)
}

fn sorted_fifo(mut events: Vec<FailedEvent>) -> Vec<FailedEvent> {
    events.sort_by_key(FailedEvent::fifo_key);
    events
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn next_sequence(&self) -> Result<u64> {
        Ok(self.sequence.next())
    }

    async fn admit(&self, admission: Admission, now: i64) -> Result<AdmitOutcome> {
        let mut inner = self.inner.write().unwrap();
        let key = (admission.event_type(), admission.dedup_key());

        if let Some(&id) = inner.unresolved.get(&key) {
            if let Some(event) = inner.events.get_mut(&id) {
                event.readmit(admission, now)?;
                return Ok(AdmitOutcome::Refreshed(event.clone()));
            }
        }

        inner.last_id += 1;
        let id = EventId(inner.last_id);
        let event = FailedEvent::admit(id, self.sequence.next(), admission, now);
        inner.events.insert(id, event.clone());
        inner.unresolved.insert(key, id);

        Ok(AdmitOutcome::Created(event))
    }

    async fn get_event(&self, id: EventId) -> Result<Option<FailedEvent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.events.get(&id).cloned())
    }

    async fn find_unresolved(
        &self,
        event_type: EventType,
        dedup_key: &DedupKey,
    ) -> Result<Option<FailedEvent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .unresolved
            .get(&(event_type, dedup_key.clone()))
            .and_then(|id| inner.events.get(id))
            .cloned())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<FailedEvent>> {
        let inner = self.inner.read().unwrap();

        let mut events = sorted_fifo(
            inner
                .events
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        );
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn select_due(&self, query: &DueQuery) -> Result<Vec<FailedEvent>> {
        let inner = self.inner.read().unwrap();

        let mut due = sorted_fifo(
            inner
                .events
                .values()
                .filter(|e| e.is_due(query.now) && query.event_types.contains(&e.event_type()))
                .cloned()
                .collect(),
        );
        due.truncate(query.limit);
        Ok(due)
    }

    async fn claim(&self, id: EventId, now: i64) -> Result<ClaimOutcome> {
        self.take_claim(id, now, false)
    }

    async fn claim_due(&self, id: EventId, now: i64) -> Result<ClaimOutcome> {
        self.take_claim(id, now, true)
    }

    async fn release_claim(
        &self,
        id: EventId,
        revision: u64,
        now: i64,
    ) -> Result<Option<FailedEvent>> {
        let mut inner = self.inner.write().unwrap();

        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(None);
        };
        let held = event.revision() == revision || event.is_refreshed_in_flight();
        if event.state() != EventState::Retrying || !held {
            return Ok(None);
        }
        event.interrupt(now)?;

        Ok(Some(event.clone()))
    }

    async fn complete_success(&self, id: EventId, revision: u64, now: i64) -> Result<Completion> {
        let mut inner = self.inner.write().unwrap();

        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(Completion::Superseded);
        };
        if event.revision() != revision {
            return stale_completion(event, now);
        }
        event.mark_delivered(now)?;
        inner.remove(id);

        Ok(Completion::Deleted)
    }

    async fn complete_failure(
        &self,
        id: EventId,
        revision: u64,
        failure: FailureRecord,
        backoff: LinearBackoff,
        now: i64,
    ) -> Result<Completion> {
        let mut inner = self.inner.write().unwrap();

        let Some(event) = inner.events.get_mut(&id) else {
            return Ok(Completion::Superseded);
        };
        if event.revision() != revision {
            return stale_completion(event, now);
        }

        if let Some(payload) = failure.sent_payload {
            event.replace_payload(payload, now)?;
        }
        event.record_failure(failure.message, failure.kind, now, &backoff)?;

        Ok(Completion::Updated(event.clone()))
    }

    async fn resolve_externally(&self, id: EventId, now: i64) -> Result<Option<FailedEvent>> {
        let mut inner = self.inner.write().unwrap();

        match inner.events.get_mut(&id) {
            Some(event) => event.resolve_externally(now)?,
            None => return Ok(None),
        }

        Ok(inner.remove(id))
    }

    async fn discard(&self, id: EventId) -> Result<Option<FailedEvent>> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner.remove(id))
    }

    async fn purge_subject(&self, subject: &SubjectRef) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();

        let ids: Vec<EventId> = inner
            .events
            .values()
            .filter(|e| e.subject().same_owner(subject))
            .map(FailedEvent::id)
            .collect();
        for id in &ids {
            inner.remove(*id);
        }

        Ok(ids.len())
    }

    async fn recover_interrupted(&self, now: i64) -> Result<Vec<EventId>> {
        let mut inner = self.inner.write().unwrap();

        let mut recovered = Vec::new();
        for event in inner.events.values_mut() {
            if event.state() == EventState::Retrying {
                event.interrupt(now)?;
                recovered.push(event.id());
            }
        }

        Ok(recovered)
    }
}
