//! # ELIS Sync Delivery
//!
//! Contracts for the two collaborators a retry needs: the
//! [`DeliveryAttempter`] that performs one call to the LIS, and the
//! [`SubjectResolver`] that re-locates the domain object an event belongs to.
//!
//! ## Retry Flow
//!
//! ```text
//! event ── resolve(subject) ──┬── Live ──────────── attempt(stored payload)
//!                             ├── Rebuilt(payload) ─ attempt(new payload)
//!                             └── NotFound ───────── SubjectMissing (no call)
//! ```
//!
//! Both traits are implemented by the host application. This crate ships
//! only [`PassthroughResolver`]; scripted test doubles live in the testkit.

pub mod attempter;
pub mod error;
pub mod resolver;

pub use attempter::{Delivered, DeliveryAttempter};
pub use error::{DeliveryFailure, Result};
pub use resolver::{resolve, PassthroughResolver, Resolution, SubjectResolver};
