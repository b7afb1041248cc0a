//! # ELIS Sync Store
//!
//! Storage abstraction for the failed-event retry queue. Provides a
//! trait-based interface for failed-event persistence with SQLite and
//! in-memory implementations.
//!
//! ## Overview
//!
//! The store module abstracts persistence behind the [`EventStore`] trait,
//! allowing the queue to be storage-agnostic. The primary implementation
//! is [`SqliteStore`], with [`MemoryStore`] for testing.
//!
//! ## Key Types
//!
//! - [`EventStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`AdmitOutcome`] - Whether an admission created or refreshed an event
//! - [`ClaimOutcome`] / [`Completion`] - Results of the retry lifecycle
//!
//! ## Usage
//!
//! ```rust,no_run
//! use elis_sync_core::{Admission, ErrorKind, SubjectRef};
//! use elis_sync_store::{EventStore, SqliteStore};
//! use serde_json::json;
//!
//! async fn example() {
//!     let store = SqliteStore::open("retry-queue.db").unwrap();
//!
//!     let admission = Admission::new(
//!         SubjectRef::patient(42, Some("P-0042")),
//!         json!({ "ref": "P-0042" }),
//!         "connection refused",
//!         ErrorKind::ConnectionFailure,
//!     );
//!     let outcome = store.admit(admission, 0).await.unwrap();
//!     assert!(outcome.is_created());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Deduplicated admission**: a second failure for the same subject
//!   refreshes the unresolved event instead of adding a row
//! - **FIFO order**: events keep the sequence number of their first admission
//! - **Conditional completion**: stale attempt results are reported as
//!   [`Completion::Superseded`] (or [`Completion::Requeued`] after a
//!   re-admission) and never overwrite newer state
//! - **Delete on success**: resolved events are never kept

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    AdmitOutcome, ClaimOutcome, Completion, DueQuery, EventFilter, EventStore, FailureRecord,
};
