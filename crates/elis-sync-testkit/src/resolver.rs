//! A subject resolver backed by a map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use elis_sync_core::{EventType, SubjectRef};
use elis_sync_delivery::{DeliveryFailure, Resolution, Result, SubjectResolver};

#[derive(Debug, Clone)]
enum Entry {
    Resolves(Resolution),
    Fails(DeliveryFailure),
}

/// [`SubjectResolver`] answering from a map keyed by subject type and owner
/// id. Unknown subjects are live. Clones share the map.
#[derive(Clone, Default)]
pub struct MapResolver {
    entries: Arc<Mutex<HashMap<(EventType, i64), Entry>>>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, subject: &SubjectRef, entry: Entry) {
        self.entries
            .lock()
            .unwrap()
            .insert((subject.event_type(), subject.owner_id()), entry);
    }

    /// The subject has been deleted.
    pub fn missing(&self, subject: &SubjectRef) {
        self.set(subject, Entry::Resolves(Resolution::NotFound));
    }

    /// The subject exists and its payload rebuilds to `payload`.
    pub fn rebuild(&self, subject: &SubjectRef, payload: Value) {
        self.set(subject, Entry::Resolves(Resolution::Rebuilt(payload)));
    }

    /// Looking the subject up fails.
    pub fn fail(&self, subject: &SubjectRef, failure: DeliveryFailure) {
        self.set(subject, Entry::Fails(failure));
    }

    /// Forget anything set for the subject; it is live again.
    pub fn restore(&self, subject: &SubjectRef) {
        self.entries
            .lock()
            .unwrap()
            .remove(&(subject.event_type(), subject.owner_id()));
    }

    fn lookup(&self, event_type: EventType, owner_id: i64) -> Result<Resolution> {
        match self.entries.lock().unwrap().get(&(event_type, owner_id)) {
            Some(Entry::Resolves(resolution)) => Ok(resolution.clone()),
            Some(Entry::Fails(failure)) => Err(failure.clone()),
            None => Ok(Resolution::Live),
        }
    }
}

#[async_trait]
impl SubjectResolver for MapResolver {
    async fn resolve_patient(
        &self,
        patient_id: i64,
        _patient_ref: Option<&str>,
        _payload: &Value,
    ) -> Result<Resolution> {
        self.lookup(EventType::Patient, patient_id)
    }

    async fn resolve_test_order(
        &self,
        order_id: i64,
        _order_name: Option<&str>,
        _payload: &Value,
    ) -> Result<Resolution> {
        self.lookup(EventType::TestOrder, order_id)
    }

    async fn resolve_lab_test(&self, product_id: i64, _payload: &Value) -> Result<Resolution> {
        self.lookup(EventType::LabTest, product_id)
    }
}
