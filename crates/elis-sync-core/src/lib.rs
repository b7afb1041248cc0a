//! # ELIS Sync Core
//!
//! Pure primitives for the ELIS sync retry queue: failed events, the subjects
//! they belong to, the retry state machine, and backoff.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`FailedEvent`] - One undelivered sync payload awaiting retry
//! - [`SubjectRef`] - The patient, test order, or lab test an event belongs to
//! - [`EventState`] - Position in the retry state machine
//! - [`ErrorKind`] - Coarse classification of the last failure
//! - [`LinearBackoff`] - Next-due computation after a failed retry
//! - [`SequenceAllocator`] - Strictly increasing FIFO sequence numbers
//!
//! ## State Machine
//!
//! ```text
//! admit ──▶ Pending ──claim──▶ Retrying ──delivered──▶ Success (deleted)
//!              ▲                  │
//!              │               failure
//!              │                  ▼
//!            admit ◀────────── Failed ──claim──▶ Retrying
//! ```
//!
//! Every mutation goes through one of the transition methods on
//! [`FailedEvent`]; there is no way to set a state or sequence number directly.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod event;
pub mod sequence;
pub mod subject;
pub mod types;

pub use backoff::LinearBackoff;
pub use clock::{now_millis, Clock, SystemClock};
pub use error::{CoreError, TransitionError};
pub use event::{Admission, ErrorKind, EventState, FailedEvent};
#[doc(hidden)]
pub use event::EventParts;
pub use sequence::SequenceAllocator;
pub use subject::SubjectRef;
pub use types::{DedupKey, EventId, EventType};
