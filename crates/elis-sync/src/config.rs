//! Queue configuration.

use std::time::Duration;

use elis_sync_core::{EventType, LinearBackoff};

/// Configuration for the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Master switch for scheduled retries. When off, cycles are skipped;
    /// admission and operator calls still work.
    pub enabled: bool,
    /// Whether scheduled cycles pick up patient events.
    pub patient_sync_enabled: bool,
    /// Maximum events attempted per cycle.
    pub batch_size: usize,
    /// Linear backoff step: the n-th failed retry waits `n * backoff_step`.
    pub backoff_step: Duration,
    /// Upper bound on one resolve-and-deliver attempt.
    pub attempt_timeout: Duration,
    /// Period of the background scheduler.
    pub cycle_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patient_sync_enabled: true,
            batch_size: 50,
            backoff_step: LinearBackoff::DEFAULT_STEP,
            attempt_timeout: Duration::from_secs(30),
            cycle_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.backoff_step)
    }

    /// Event types scheduled cycles may select.
    pub fn scheduled_event_types(&self) -> Vec<EventType> {
        EventType::ALL
            .iter()
            .copied()
            .filter(|t| self.patient_sync_enabled || *t != EventType::Patient)
            .collect()
    }
}
