//! Worker poll loop
//!
//! Claims batches from the work queue under a lease, processes each item
//! through the [`SyncEngine`], and reports outcomes back. Idle polling
//! backs off exponentially from the base interval to the configured
//! maximum; any claimed work resets the backoff. A lease sweep runs every
//! poll so items from crashed workers return to the queue within one
//! cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inkmirror_store::work_queue::WorkQueueRepository;
use inkmirror_telemetry::PipelineMetrics;

use crate::engine::{SyncEngine, SyncError};

/// Tunables for the poll loop
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Stable worker identity for lease ownership
    pub worker_id: String,
    /// Base poll interval when work is flowing
    pub poll_interval: Duration,
    /// Ceiling for idle backoff
    pub idle_backoff_max: Duration,
    /// Lease duration for claimed items
    pub lease: Duration,
    /// Items claimed per poll
    pub batch_size: i64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            poll_interval: Duration::from_secs(5),
            idle_backoff_max: Duration::from_secs(30),
            lease: Duration::from_secs(60),
            batch_size: 10,
        }
    }
}

/// The background sync worker (C10)
pub struct SyncWorker {
    queue: Arc<WorkQueueRepository>,
    engine: Arc<SyncEngine>,
    metrics: Arc<PipelineMetrics>,
    settings: WorkerSettings,
}

impl SyncWorker {
    /// Creates a worker over the queue and engine
    pub fn new(
        queue: Arc<WorkQueueRepository>,
        engine: Arc<SyncEngine>,
        metrics: Arc<PipelineMetrics>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            engine,
            metrics,
            settings,
        }
    }

    /// Runs until the cancellation token fires
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker = %self.settings.worker_id, "Sync worker starting");
        let mut idle_delay = self.settings.poll_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(idle_delay) => {}
                _ = shutdown.cancelled() => {
                    info!(worker = %self.settings.worker_id, "Sync worker shutting down");
                    return Ok(());
                }
            }

            let processed = match self.poll_once().await {
                Ok(processed) => processed,
                Err(err) => {
                    warn!(error = %err, "Worker poll failed");
                    0
                }
            };

            idle_delay = if processed > 0 {
                self.settings.poll_interval
            } else {
                // Exponential idle backoff, capped
                (idle_delay * 2).min(self.settings.idle_backoff_max)
            };
        }
    }

    /// One poll cycle: sweep, claim, process; returns items processed
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let swept = self.queue.sweep_expired_leases().await?;
        if swept > 0 {
            self.metrics.record_lease_sweep(swept);
        }

        let lease = ChronoDuration::from_std(self.settings.lease)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let items = self
            .queue
            .claim_batch(&self.settings.worker_id, self.settings.batch_size, lease)
            .await?;

        if items.is_empty() {
            debug!("No work claimed");
        }

        let claimed = items.len();
        for item in items {
            match self.engine.process(&item).await {
                Ok(()) => {
                    if let Err(err) = self.queue.complete(&item.id, &self.settings.worker_id).await
                    {
                        // Lease swept away mid-processing; the item will be
                        // re-run, and the dedup protocol absorbs the repeat
                        warn!(id = %item.id, error = %err, "Could not complete item (lease lost)");
                    }
                }
                Err(SyncError::Retryable(msg)) => {
                    if let Err(err) = self
                        .queue
                        .fail(&item.id, &self.settings.worker_id, &msg)
                        .await
                    {
                        warn!(id = %item.id, error = %err, "Could not fail item (lease lost)");
                    }
                }
                Err(SyncError::Permanent(msg)) => {
                    if let Err(err) = self
                        .queue
                        .fail_permanent(&item.id, &self.settings.worker_id, &msg)
                        .await
                    {
                        warn!(id = %item.id, error = %err, "Could not fail item (lease lost)");
                    }
                }
            }
        }

        if let Ok(depth) = self.queue.queued_depth().await {
            self.metrics.set_queue_depth(depth);
        }

        Ok(claimed)
    }
}
