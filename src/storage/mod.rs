pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{DeadLetter, ErrorInfo, JobId, JobLocation, JobMessage, QueueStats, ReclaimReport};
use crate::progress::{JobProgress, ProgressUpdate};

pub use memory::{MemoryProgressStore, MemoryQueueStore};
pub use sqlite::SqliteStorage;

/// Error code recorded when a claim outlives the stale threshold.
pub const STALE_CLAIM_CODE: &str = "StaleClaim";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Job {0} already exists")]
    DuplicateJob(JobId),

    #[error("Job {0} is not in the processing set")]
    NotClaimed(JobId),

    #[error("Corrupt record for job {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StorageError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(is_busy_or_locked),
            StorageError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_busy_or_locked(code: i32) -> bool {
    matches!(code & 0xff, 5 | 6)
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// The four job collections: scheduled, ready, processing and dead-letter.
///
/// Every mutating call is atomic with respect to every other caller, so a
/// job is in at most one collection at a time and two workers can never both
/// claim it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue_ready(&self, job: JobMessage) -> Result<()>;

    async fn enqueue_scheduled(&self, job: JobMessage, execute_at: DateTime<Utc>) -> Result<()>;

    /// Move every scheduled job with `execute_at <= now` into ready.
    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>>;

    /// Pop the highest priority, earliest enqueued ready job into processing,
    /// stamping the claim time and bumping its attempt counter.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobMessage>>;

    /// The three resolutions below only apply to the claim that produced
    /// `job` (same attempt and claim time). Anything else, including a
    /// claim that was reclaimed and handed out again, fails with
    /// [`StorageError::NotClaimed`].
    async fn ack(&self, job: &JobMessage) -> Result<()>;

    /// Processing -> ready, persisting the failure history.
    async fn release(&self, job: &JobMessage) -> Result<()>;

    /// Processing -> dead-letter.
    async fn dead_letter(&self, job: &JobMessage, error: &ErrorInfo) -> Result<()>;

    /// Release claims older than `claimed_before`. Jobs that already used
    /// `max_attempts` go to dead-letter instead.
    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReclaimReport>;

    async fn locate(&self, id: &JobId) -> Result<Option<JobLocation>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Most recent dead-letter entries first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Dead-letter -> ready with a fresh attempt budget.
    async fn replay_dead_letter(&self, id: &JobId) -> Result<Option<JobMessage>>;

    async fn discard_dead_letter(&self, id: &JobId) -> Result<bool>;
}

/// Expiring key-value space for progress records.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Merge `update` into the stored record (see [`ProgressUpdate::apply`])
    /// and push its expiry out to `expires_at`.
    async fn upsert(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobProgress>;

    async fn get(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<Option<JobProgress>>;

    async fn get_many(
        &self,
        job_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<HashMap<JobId, JobProgress>>;

    /// Delete a record whether or not it has expired.
    async fn remove(&self, job_id: &JobId) -> Result<bool>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn stale_claim_error(claimed_at: Option<DateTime<Utc>>) -> ErrorInfo {
    let message = match claimed_at {
        Some(at) => format!("claim from {} expired before the job was resolved", at.to_rfc3339()),
        None => "claim expired before the job was resolved".to_string(),
    };
    ErrorInfo::new(STALE_CLAIM_CODE, message)
}
