//! FIFO sequence allocation.
//!
//! Sequence numbers are handed out by an atomic increment, never by reading
//! the current maximum and adding one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates strictly increasing sequence numbers, starting at 1.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    last: AtomicU64,
}

impl SequenceAllocator {
    /// A fresh allocator whose first value is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after a previously allocated value.
    pub fn resume_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Allocate the next value.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently allocated value (0 if none).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
