//! Per-job progress records with a bounded lifetime.
//!
//! A record lives independently of the job it describes: it expires a fixed
//! retention window after its last write, whether or not the job is still in
//! the queue store, and lookups of expired records report "not found".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::job::{ErrorInfo, JobId};
use crate::retry::{with_backoff, BackoffPolicy};
use crate::storage::{ProgressStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "Pending",
            ProgressStatus::Running => "Running",
            ProgressStatus::Completed => "Completed",
            ProgressStatus::Failed => "Failed",
            ProgressStatus::Retrying => "Retrying",
        }
    }

    pub fn from_db(status: &str) -> Option<Self> {
        match status {
            "Pending" => Some(ProgressStatus::Pending),
            "Running" => Some(ProgressStatus::Running),
            "Completed" => Some(ProgressStatus::Completed),
            "Failed" => Some(ProgressStatus::Failed),
            "Retrying" => Some(ProgressStatus::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible status snapshot of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub status: ProgressStatus,
    pub percent: u8,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub attempt: u32,
    pub updated_at: DateTime<Utc>,
}

/// A write to a progress record
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    pub percent: u8,
    pub current_step: String,
    pub result: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub attempt: u32,
}

impl ProgressUpdate {
    pub fn pending() -> Self {
        Self::new(ProgressStatus::Pending, 0, 0, "Queued")
    }

    pub fn running<S: Into<String>>(attempt: u32, percent: u8, step: S) -> Self {
        Self::new(ProgressStatus::Running, attempt, percent, step)
    }

    pub fn completed(attempt: u32, result: Option<Value>) -> Self {
        Self {
            result,
            ..Self::new(ProgressStatus::Completed, attempt, 100, "Completed")
        }
    }

    pub fn failed(attempt: u32, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::new(ProgressStatus::Failed, attempt, 0, "Failed")
        }
    }

    pub fn retrying<S: Into<String>>(attempt: u32, step: S) -> Self {
        Self::new(ProgressStatus::Retrying, attempt, 0, step)
    }

    fn new<S: Into<String>>(status: ProgressStatus, attempt: u32, percent: u8, step: S) -> Self {
        Self {
            status,
            percent,
            current_step: step.into(),
            result: None,
            error: None,
            attempt,
        }
    }

    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.percent > 100 {
            return Err(ProgressError::InvalidPercent(self.percent));
        }
        if self.result.is_some() && self.status != ProgressStatus::Completed {
            return Err(ProgressError::UnexpectedResult(self.status));
        }
        match (self.status, &self.error) {
            (ProgressStatus::Failed, None) => Err(ProgressError::MissingError),
            (ProgressStatus::Failed, Some(_)) | (_, None) => Ok(()),
            (status, Some(_)) => Err(ProgressError::UnexpectedError(status)),
        }
    }

    /// Merge this update over the live record (if any).
    ///
    /// Percent never goes down within one attempt; a lower value is clamped to
    /// the stored one. An update for a different attempt starts from scratch.
    pub fn apply(self, previous: Option<&JobProgress>, now: DateTime<Utc>) -> JobProgress {
        let percent = match previous {
            Some(prev) if prev.attempt == self.attempt && prev.percent > self.percent => {
                prev.percent
            }
            _ => self.percent,
        };

        JobProgress {
            status: self.status,
            percent,
            current_step: self.current_step,
            result: self.result,
            error: self.error,
            attempt: self.attempt,
            updated_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Percent must be between 0 and 100, got {0}")]
    InvalidPercent(u8),

    #[error("A result is only allowed on completed progress, not {0}")]
    UnexpectedResult(ProgressStatus),

    #[error("Error details are only allowed on failed progress, not {0}")]
    UnexpectedError(ProgressStatus),

    #[error("Failed progress requires error details")]
    MissingError,

    #[error("Batch of {requested} ids exceeds the limit of {limit}")]
    BatchTooLarge { requested: usize, limit: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Front end over a [`ProgressStore`] that owns validation, expiry and the
/// batch size cap.
///
/// Writes retry transient store errors with the tracker's backoff policy.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    retention: chrono::Duration,
    batch_limit: usize,
    store_retry: BackoffPolicy,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, retention: Duration, batch_limit: usize) -> Self {
        Self {
            store,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            batch_limit,
            store_retry: BackoffPolicy::default(),
        }
    }

    pub fn with_store_retry(mut self, policy: BackoffPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Upsert a record, refreshing its expiry window.
    pub async fn set_progress(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
    ) -> Result<JobProgress, ProgressError> {
        update.validate()?;

        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        debug!(
            job_id = %job_id,
            status = %update.status,
            percent = update.percent,
            "Writing progress"
        );
        let written = with_backoff(&self.store_retry, "set_progress", || {
            self.store.upsert(job_id, update.clone(), now, expires_at)
        })
        .await?;
        Ok(written)
    }

    /// Drop a record outright. Returns whether one existed.
    pub async fn discard(&self, job_id: &JobId) -> Result<bool, ProgressError> {
        let removed = with_backoff(&self.store_retry, "discard_progress", || {
            self.store.remove(job_id)
        })
        .await?;
        Ok(removed)
    }

    /// `None` when the id is unknown or its record has expired.
    pub async fn get_progress(&self, job_id: &JobId) -> Result<Option<JobProgress>, ProgressError> {
        Ok(self.store.get(job_id, Utc::now()).await?)
    }

    /// One entry per requested id, `None` for unknown or expired ones.
    pub async fn get_batch(
        &self,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, Option<JobProgress>>, ProgressError> {
        if job_ids.len() > self.batch_limit {
            return Err(ProgressError::BatchTooLarge {
                requested: job_ids.len(),
                limit: self.batch_limit,
            });
        }

        let mut found = self.store.get_many(job_ids, Utc::now()).await?;
        Ok(job_ids
            .iter()
            .map(|id| (id.clone(), found.remove(id)))
            .collect())
    }

    pub async fn purge_expired(&self) -> Result<u64, ProgressError> {
        Ok(self.store.purge_expired(Utc::now()).await?)
    }

    pub fn reporter(&self, job_id: JobId, attempt: u32) -> ProgressReporter {
        ProgressReporter {
            tracker: self.clone(),
            job_id,
            attempt,
        }
    }
}

/// Handle given to handlers for reporting progress of their attempt
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: ProgressTracker,
    job_id: JobId,
    attempt: u32,
}

impl ProgressReporter {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub async fn report<S: Into<String>>(
        &self,
        percent: u8,
        step: S,
    ) -> Result<JobProgress, ProgressError> {
        self.tracker
            .set_progress(
                &self.job_id,
                ProgressUpdate::running(self.attempt, percent, step),
            )
            .await
    }
}
