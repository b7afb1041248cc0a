//! Retry backoff.
//!
//! Backoff is linear in the attempt count: after the k-th failed retry the
//! event is due again `step * max(k, 1)` later. There is no cap and no
//! give-up point; the periodic cycle interval is the only other bound.

use std::time::Duration;

/// Linear backoff scaled by the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    step_ms: i64,
}

impl LinearBackoff {
    /// Default step between retries.
    pub const DEFAULT_STEP: Duration = Duration::from_secs(15 * 60);

    /// Create a backoff with the given step.
    pub fn new(step: Duration) -> Self {
        Self {
            step_ms: i64::try_from(step.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// The step in milliseconds.
    pub fn step_ms(&self) -> i64 {
        self.step_ms
    }

    /// Delay after a failure, given the retry count at that point.
    ///
    /// | retry_count | delay (default step) |
    /// |-------------|----------------------|
    /// | 0           | 15 min               |
    /// | 1           | 15 min               |
    /// | 2           | 30 min               |
    /// | 3           | 45 min               |
    pub fn delay_ms(&self, retry_count: u32) -> i64 {
        self.step_ms.saturating_mul(i64::from(retry_count.max(1)))
    }

    /// Absolute next-due time for a failure recorded at `now`.
    pub fn next_retry_at(&self, now: i64, retry_count: u32) -> i64 {
        now.saturating_add(self.delay_ms(retry_count))
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STEP)
    }
}
