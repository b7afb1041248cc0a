//! Background driver for scheduled retry cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use elis_sync_delivery::{DeliveryAttempter, SubjectResolver};
use elis_sync_store::EventStore;

use crate::error::{QueueError, Result};
use crate::queue::RetryQueue;

/// Runs [`RetryQueue::run_retry_cycle`] on a fixed interval until shut down.
///
/// On start it releases events left `Retrying` by a previous process, then
/// runs a first cycle immediately.
pub struct RetryScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RetryScheduler {
    /// Spawn the scheduler task on the current runtime.
    pub fn start<S, A, R>(queue: Arc<RetryQueue<S, A, R>>) -> Self
    where
        S: EventStore + 'static,
        A: DeliveryAttempter + 'static,
        R: SubjectResolver + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);
        let period = queue.config().cycle_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            if let Err(e) = queue.recover_interrupted().await {
                error!(error = %e, "failed to recover interrupted events");
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?period, "retry scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.run_retry_cycle().await {
                            error!(error = %e, "retry cycle failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("retry scheduler stopped");
        });

        Self { shutdown, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop after the cycle in progress, if any, and wait for the task.
    pub async fn shutdown(self) -> Result<()> {
        // The task may already be gone; the join below reports why.
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| QueueError::TaskFailed(e.to_string()))
    }
}
