//! # ELIS Sync Testkit
//!
//! Testing utilities for the retry queue.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Scripted collaborators**: [`ScriptedAttempter`] and [`MapResolver`]
//!   stand in for the LIS and for the local database
//! - **Manual clock**: [`ManualClock`] drives backoff without waiting
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Helpers for admissions and store setup
//!
//! ## Scripted Delivery
//!
//! ```rust
//! use elis_sync_delivery::DeliveryFailure;
//! use elis_sync_testkit::ScriptedAttempter;
//!
//! let attempter = ScriptedAttempter::new();
//! attempter
//!     .then_succeed()
//!     .then_fail(DeliveryFailure::http(503, "unavailable"))
//!     .then_succeed();
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use elis_sync_testkit::generators::admissions;
//!
//! proptest! {
//!     #[test]
//!     fn one_event_per_subject(batch in admissions(20)) {
//!         // admit every element, then count unresolved events per key
//!     }
//! }
//! ```

pub mod attempter;
pub mod clock;
pub mod fixtures;
pub mod generators;
pub mod resolver;

pub use attempter::{Call, ScriptedAttempter, Step};
pub use clock::ManualClock;
pub use fixtures::{memory_store, sqlite_on_disk, sqlite_store, TestFixture, EPOCH_2024};
pub use resolver::MapResolver;
