//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use elis_sync_core::{Admission, Clock, ErrorKind, SubjectRef};
use elis_sync_store::{MemoryStore, SqliteStore};

use crate::attempter::ScriptedAttempter;
use crate::clock::ManualClock;
use crate::resolver::MapResolver;

/// Start time of every fixture clock: 2024-01-01T00:00:00Z.
pub const EPOCH_2024: i64 = 1_704_067_200_000;

/// Scripted collaborators and a manual clock, shared with the queue under
/// test through clones.
pub struct TestFixture {
    pub attempter: ScriptedAttempter,
    pub resolver: MapResolver,
    pub clock: Arc<ManualClock>,
}

impl TestFixture {
    /// A fixture whose attempter succeeds and whose subjects are all live.
    pub fn new() -> Self {
        Self {
            attempter: ScriptedAttempter::new(),
            resolver: MapResolver::new(),
            clock: Arc::new(ManualClock::new(EPOCH_2024)),
        }
    }

    /// The clock as the queue expects it.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// A failed patient sync. `version` lands in the payload so tests can
    /// tell admissions apart.
    pub fn patient(&self, patient_id: i64, reference: &str, version: u32) -> Admission {
        Admission::new(
            SubjectRef::patient(patient_id, Some(reference)),
            json!({ "id": patient_id, "ref": reference, "version": version }),
            "connection refused",
            ErrorKind::ConnectionFailure,
        )
    }

    /// A failed test-order sync.
    pub fn test_order(&self, order_id: i64) -> Admission {
        let name = format!("SO{:04}", order_id);
        Admission::new(
            SubjectRef::test_order(order_id, Some(&name)),
            json!({ "order": name, "tests": ["CBC", "LFT"] }),
            "HTTP 503",
            ErrorKind::HttpError(503),
        )
    }

    /// A failed lab-test catalog sync.
    pub fn lab_test(&self, product_id: i64, name: &str) -> Admission {
        Admission::new(
            SubjectRef::lab_test(product_id),
            json!({ "id": product_id, "name": name }),
            "timed out",
            ErrorKind::Timeout,
        )
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn memory_store() -> MemoryStore {
    MemoryStore::new()
}

/// An in-memory SQLite store.
pub fn sqlite_store() -> SqliteStore {
    SqliteStore::open_memory().expect("open in-memory sqlite store")
}

/// A SQLite store in a fresh temporary directory. Keep the directory alive
/// for as long as the store is used.
pub fn sqlite_on_disk() -> (SqliteStore, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = SqliteStore::open(dir.path().join("retry-queue.db")).expect("open sqlite store");
    (store, dir)
}
