use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::handler::{run_with_timeout, JobContext, JobError};
use crate::job::{ErrorInfo, JobMessage};
use crate::progress::{ProgressTracker, ProgressUpdate};
use crate::registry::HandlerRegistry;
use crate::retry::{disposition, with_backoff, Disposition};
use crate::storage::{QueueStore, StorageError};

/// One slot of the worker pool. Claims a job, runs it, resolves it, repeats.
pub struct Worker {
    id: usize,
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    progress: ProgressTracker,
    config: Arc<QueueConfig>,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        progress: ProgressTracker,
        config: Arc<QueueConfig>,
    ) -> Self {
        Self {
            id,
            store,
            registry,
            progress,
            config,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// Shutdown is only observed between jobs, so a claimed job is always
    /// resolved before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = self.id, "Worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Failed to claim next job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.polling_interval) => {}
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Claim and fully process at most one job. Returns whether one was found.
    pub async fn run_once(&self) -> Result<bool, StorageError> {
        let claimed = with_backoff(&self.config.store_retry, "claim_next", || {
            self.store.claim_next(Utc::now())
        })
        .await?;

        match claimed {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => {
                debug!(worker = self.id, "No ready jobs");
                Ok(false)
            }
        }
    }

    async fn process(&self, mut job: JobMessage) {
        debug!(
            worker = self.id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "Claimed job"
        );

        self.write_progress(&job, ProgressUpdate::running(job.attempt, 0, "Starting"))
            .await;

        let Some(route) = self.registry.resolve(&job.job_type) else {
            let err = JobError::NoHandler(job.job_type.clone());
            warn!(
                worker = self.id,
                job_id = %job.id,
                job_type = %job.job_type,
                "No handler registered, dead-lettering"
            );
            job.record_failure(err.to_info(), Utc::now());
            self.dead_letter(&job, err.to_info()).await;
            return;
        };

        let timeout = route.timeout.unwrap_or(self.config.per_job_timeout);
        let ctx = JobContext::new(
            job.clone(),
            CancellationToken::new(),
            self.progress.reporter(job.id.clone(), job.attempt),
        );

        let started = Instant::now();
        let outcome = run_with_timeout(route.handler, ctx, timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                info!(
                    worker = self.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    elapsed_ms,
                    "Job succeeded"
                );

                let acked = with_backoff(&self.config.store_retry, "ack", || self.store.ack(&job)).await;
                if self.check_store("ack", &job, acked) {
                    self.write_progress(&job, ProgressUpdate::completed(job.attempt, result))
                        .await;
                }
            }
            Err(e) => self.handle_failure(job, e, elapsed_ms).await,
        }
    }

    async fn handle_failure(&self, mut job: JobMessage, err: JobError, elapsed_ms: u64) {
        let info = err.to_info();
        job.record_failure(info.clone(), Utc::now());

        match disposition(job.attempt, self.config.max_retries, &err) {
            Disposition::Retry => {
                warn!(
                    worker = self.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    max_retries = self.config.max_retries,
                    code = %info.code,
                    error = %err,
                    elapsed_ms,
                    "Job failed, scheduling retry"
                );

                let step = format!("Retrying after attempt {} failed ({})", job.attempt, info.code);
                self.write_progress(&job, ProgressUpdate::retrying(job.attempt, step))
                    .await;

                let released =
                    with_backoff(&self.config.store_retry, "release", || self.store.release(&job)).await;
                self.check_store("release", &job, released);
            }
            Disposition::DeadLetter => {
                warn!(
                    worker = self.id,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    code = %info.code,
                    error = %err,
                    retryable = err.is_retryable(),
                    elapsed_ms,
                    "Job failed permanently"
                );
                self.dead_letter(&job, info).await;
            }
        }
    }

    async fn dead_letter(&self, job: &JobMessage, error: ErrorInfo) {
        let moved = with_backoff(&self.config.store_retry, "dead_letter", || {
            self.store.dead_letter(job, &error)
        })
        .await;

        if self.check_store("dead_letter", job, moved) {
            self.write_progress(job, ProgressUpdate::failed(job.attempt, error))
                .await;
        }
    }

    /// Log a failed store resolution. A job left in processing is picked up
    /// by the reconciliation sweep.
    fn check_store(&self, operation: &str, job: &JobMessage, result: Result<(), StorageError>) -> bool {
        match result {
            Ok(()) => true,
            Err(StorageError::NotClaimed(_)) => {
                warn!(
                    worker = self.id,
                    job_id = %job.id,
                    operation,
                    "Job was reclaimed before it could be resolved"
                );
                false
            }
            Err(e) => {
                error!(
                    worker = self.id,
                    job_id = %job.id,
                    operation,
                    error = %e,
                    "Failed to resolve job, leaving it for reconciliation"
                );
                false
            }
        }
    }

    async fn write_progress(&self, job: &JobMessage, update: ProgressUpdate) {
        if let Err(e) = self.progress.set_progress(&job.id, update).await {
            warn!(worker = self.id, job_id = %job.id, error = %e, "Failed to write progress");
        }
    }
}
