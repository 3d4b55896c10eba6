use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::job::JobMessage;
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::retry::with_backoff;
use crate::storage::{stale_claim_error, QueueStore, StorageError};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub promoted: usize,
    pub released: usize,
    pub dead_lettered: usize,
    pub purged: u64,
}

/// Periodic housekeeping: promotes due scheduled jobs, reclaims stale
/// claims and purges expired progress records.
///
/// Every step is idempotent, so several processes may sweep the same store.
pub struct Sweeper {
    store: Arc<dyn QueueStore>,
    progress: ProgressTracker,
    config: Arc<QueueConfig>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn QueueStore>, progress: ProgressTracker, config: Arc<QueueConfig>) -> Self {
        Self {
            store,
            progress,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.config.sweep_interval.as_millis() as u64, "Sweeper started");

        loop {
            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }
        }
    }

    /// Run every duty once. Failures are logged and do not stop later duties.
    pub async fn tick(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        match self.promote_due().await {
            Ok(n) => summary.promoted = n,
            Err(e) => error!(error = %e, "Failed to promote scheduled jobs"),
        }

        match self.reclaim_stale().await {
            Ok((released, dead_lettered)) => {
                summary.released = released;
                summary.dead_lettered = dead_lettered;
            }
            Err(e) => error!(error = %e, "Failed to reclaim stale claims"),
        }

        match self.progress.purge_expired().await {
            Ok(n) => summary.purged = n,
            Err(e) => error!(error = %e, "Failed to purge expired progress"),
        }

        if summary != SweepSummary::default() {
            debug!(?summary, "Sweep finished");
        }
        summary
    }

    async fn promote_due(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let promoted = with_backoff(&self.config.store_retry, "promote_due", || {
            self.store.promote_due(now)
        })
        .await?;

        for job in &promoted {
            debug!(job_id = %job.id, job_type = %job.job_type, "Promoted scheduled job");
        }
        if !promoted.is_empty() {
            info!(count = promoted.len(), "Promoted scheduled jobs");
        }
        Ok(promoted.len())
    }

    async fn reclaim_stale(&self) -> Result<(usize, usize), StorageError> {
        let threshold = chrono::Duration::from_std(self.config.stale_claim_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(threshold) else {
            return Ok((0, 0));
        };
        let max_attempts = self.config.max_retries.saturating_add(1);

        let report = with_backoff(&self.config.store_retry, "reclaim_stale", || {
            self.store.reclaim_stale(cutoff, max_attempts)
        })
        .await?;

        for job in &report.released {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt,
                "Released stale claim back to ready"
            );
            let update = ProgressUpdate::retrying(job.attempt, "Reclaimed after stale claim");
            self.write_progress(job, update).await;
        }

        for job in &report.dead_lettered {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt,
                "Stale claim exhausted its retries, dead-lettered"
            );
            let error = job
                .last_failure()
                .map(|f| f.error.clone())
                .unwrap_or_else(|| stale_claim_error(None));
            self.write_progress(job, ProgressUpdate::failed(job.attempt, error)).await;
        }

        Ok((report.released.len(), report.dead_lettered.len()))
    }

    async fn write_progress(&self, job: &JobMessage, update: ProgressUpdate) {
        if let Err(e) = self.progress.set_progress(&job.id, update).await {
            warn!(job_id = %job.id, error = %e, "Failed to write progress");
        }
    }
}
