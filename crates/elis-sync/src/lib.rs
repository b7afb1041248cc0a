//! # ELIS Sync
//!
//! Durable retry queue for JSON sync events that failed to reach the
//! laboratory information system (LIS).
//!
//! ## Overview
//!
//! When pushing a patient, a confirmed test order or a lab-test catalog
//! entry to the LIS fails, the failure is admitted to the queue. The queue
//! keeps at most one unresolved event per subject, orders events by a
//! monotonic sequence number, and retries them on a schedule with linear
//! backoff until they are delivered, resolved by an operator, or their
//! subject is deleted.
//!
//! ## Key Concepts
//!
//! - **Admission**: the first failure creates an event; later failures for
//!   the same subject refresh it and reset its retry state.
//! - **Cycle**: a scheduled pass over due events, strictly serial in FIFO
//!   order, with per-event failure isolation.
//! - **Claim**: every retry first moves the event to `Retrying` atomically,
//!   so a manual retry and a cycle never deliver the same event twice.
//! - **Parked event**: a retry that found its subject deleted; skipped by
//!   cycles until an operator acts or a new failure is admitted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use elis_sync::{RetryConfig, RetryQueue, RetryScheduler};
//! use elis_sync::core::{ErrorKind, SubjectRef};
//! use elis_sync::delivery::PassthroughResolver;
//! use elis_sync::store::SqliteStore;
//! # use elis_sync::delivery::{Delivered, DeliveryAttempter, DeliveryFailure};
//! # struct Lis;
//! # #[async_trait::async_trait]
//! # impl DeliveryAttempter for Lis {
//! #     async fn attempt(
//! #         &self,
//! #         _: elis_sync::core::EventType,
//! #         _: &serde_json::Value,
//! #     ) -> Result<Delivered, DeliveryFailure> {
//! #         Ok(Delivered::ok())
//! #     }
//! # }
//!
//! async fn example() {
//!     let store = SqliteStore::open("retry-queue.db").unwrap();
//!     let queue = Arc::new(RetryQueue::new(
//!         store,
//!         Lis,
//!         PassthroughResolver,
//!         RetryConfig::default(),
//!     ));
//!
//!     // A sync call failed: remember it.
//!     queue
//!         .admit_failure(
//!             SubjectRef::patient(42, Some("P-0042")),
//!             serde_json::json!({ "ref": "P-0042" }),
//!             "connection refused",
//!             ErrorKind::ConnectionFailure,
//!         )
//!         .await
//!         .unwrap();
//!
//!     // Retry in the background every five minutes.
//!     let scheduler = RetryScheduler::start(Arc::clone(&queue));
//!     // ...
//!     scheduler.shutdown().await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `elis_sync::core` - Events, subjects, backoff
//! - `elis_sync::store` - Storage abstraction and SQLite
//! - `elis_sync::delivery` - Attempter and resolver contracts

pub mod config;
pub mod cycle;
pub mod error;
pub mod queue;
pub mod scheduler;

// Re-export component crates
pub use elis_sync_core as core;
pub use elis_sync_delivery as delivery;
pub use elis_sync_store as store;

// Re-export main types for convenience
pub use config::RetryConfig;
pub use cycle::{RetryReport, SkipReason};
pub use error::{QueueError, Result};
pub use queue::{RetryOutcome, RetryQueue};
pub use scheduler::RetryScheduler;

// Re-export commonly used core types
pub use elis_sync_core::{
    Admission, ErrorKind, EventId, EventState, EventType, FailedEvent, SubjectRef,
};
pub use elis_sync_store::EventFilter;
