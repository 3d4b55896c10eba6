use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::job::{JobId, JobMessage, Priority};
use crate::progress::{ProgressError, ProgressTracker, ProgressUpdate};
use crate::retry::{with_backoff, BackoffPolicy};
use crate::storage::{QueueStore, StorageError};

/// Rejected producer input. Nothing has been written when one of these is
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown priority {0:?}, expected Low, Normal or High")]
    InvalidPriority(String),

    #[error("Delay must not be negative, got {0}s")]
    NegativeDelay(i64),

    #[error("Delay of {0}s is out of range")]
    DelayOutOfRange(i64),

    #[error("Invalid job type {0:?}")]
    InvalidJobType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidPriority(_) => "InvalidPriority",
            ValidationError::NegativeDelay(_) => "NegativeDelay",
            ValidationError::DelayOutOfRange(_) => "DelayOutOfRange",
            ValidationError::InvalidJobType(_) => "InvalidJobType",
            ValidationError::InvalidPayload(_) => "InvalidPayload",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

pub fn validate_job_type(job_type: &str) -> Result<(), ValidationError> {
    if job_type.is_empty() || job_type.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidJobType(job_type.to_string()));
    }
    Ok(())
}

/// Entry point for code that wants work done in the background.
///
/// Every accepted job gets a Pending progress record before it becomes
/// visible to workers.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn QueueStore>,
    progress: ProgressTracker,
    store_retry: BackoffPolicy,
}

impl JobProducer {
    pub fn new(store: Arc<dyn QueueStore>, progress: ProgressTracker, store_retry: BackoffPolicy) -> Self {
        Self {
            store,
            progress,
            store_retry,
        }
    }

    /// Put a job on the ready queue.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<JobId, EnqueueError> {
        validate_job_type(job_type)?;

        let job = JobMessage::new(job_type, payload).with_priority(priority);
        let id = job.id.clone();

        self.progress.set_progress(&id, ProgressUpdate::pending()).await?;
        if let Err(e) = with_backoff(&self.store_retry, "enqueue_ready", || {
            self.store.enqueue_ready(job.clone())
        })
        .await
        {
            self.forget_progress(&id).await;
            return Err(e.into());
        }

        info!(job_id = %id, job_type, priority = %priority, "Job enqueued");
        Ok(id)
    }

    /// Serialize typed arguments and enqueue them.
    pub async fn enqueue_args<T: Serialize>(
        &self,
        job_type: &str,
        args: &T,
        priority: Priority,
    ) -> Result<JobId, EnqueueError> {
        let payload = serde_json::to_value(args)
            .map_err(|e| ValidationError::InvalidPayload(e.to_string()))?;
        self.enqueue(job_type, payload, priority).await
    }

    /// Hold a job until `now + delay`, returning its id and execution time.
    pub async fn schedule(
        &self,
        job_type: &str,
        payload: Value,
        priority: Priority,
        delay: chrono::Duration,
    ) -> Result<(JobId, DateTime<Utc>), EnqueueError> {
        validate_job_type(job_type)?;
        if delay < chrono::Duration::zero() {
            return Err(ValidationError::NegativeDelay(delay.num_seconds()).into());
        }

        let job = JobMessage::new(job_type, payload).with_priority(priority);
        let execute_at = job
            .enqueued_at
            .checked_add_signed(delay)
            .ok_or(ValidationError::DelayOutOfRange(delay.num_seconds()))?;
        let id = job.id.clone();

        self.progress.set_progress(&id, ProgressUpdate::pending()).await?;
        if let Err(e) = with_backoff(&self.store_retry, "enqueue_scheduled", || {
            self.store.enqueue_scheduled(job.clone(), execute_at)
        })
        .await
        {
            self.forget_progress(&id).await;
            return Err(e.into());
        }

        info!(
            job_id = %id,
            job_type,
            execute_at = %execute_at,
            "Job scheduled"
        );
        Ok((id, execute_at))
    }

    /// Move a dead-lettered job back to ready with a fresh attempt budget.
    ///
    /// `None` when the id is not in dead-letter.
    pub async fn replay(&self, id: &JobId) -> Result<Option<JobId>, EnqueueError> {
        let Some(job) = self.store.replay_dead_letter(id).await? else {
            return Ok(None);
        };

        self.progress.set_progress(&job.id, ProgressUpdate::pending()).await?;
        info!(job_id = %job.id, job_type = %job.job_type, "Dead-lettered job replayed");
        Ok(Some(job.id))
    }

    /// Drop the Pending record of a job the store refused.
    async fn forget_progress(&self, id: &JobId) {
        if let Err(e) = self.progress.discard(id).await {
            warn!(job_id = %id, error = %e, "Failed to remove progress of a job that was never queued");
        }
    }
}
