use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::job::{
    AttemptFailure, DeadLetter, ErrorInfo, JobId, JobLocation, JobMessage, Priority, QueueStats,
    ReclaimReport,
};
use crate::progress::{JobProgress, ProgressStatus, ProgressUpdate};

use super::{stale_claim_error, ProgressStore, QueueStore, Result, StorageError};

/// SQLite-backed queue and progress store.
///
/// Each job is one row in `jobs`; its `location` column names the collection
/// holding it, so a job can never sit in two collections. Timestamps are
/// stored as microseconds since the epoch to keep ordering exact.
pub struct SqliteStorage {
    pub pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// A private database that lives as long as the pool.
    pub async fn in_memory() -> std::result::Result<Self, sqlx::Error> {
        // Every connection to `:memory:` opens its own database, so keep one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> std::result::Result<Self, sqlx::Error> {
        let storage = Self { pool };
        storage.configure().await?;
        storage.migrate().await?;
        Ok(storage)
    }

    async fn configure(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL,
                location TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                not_before INTEGER,
                claimed_at INTEGER,
                history TEXT NOT NULL DEFAULT '[]',
                error_code TEXT,
                error_message TEXT,
                dead_lettered_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_ready
            ON jobs(location, priority DESC, enqueued_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_scheduled ON jobs(location, not_before)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claimed ON jobs(location, claimed_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_progress (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                percent INTEGER NOT NULL,
                current_step TEXT NOT NULL,
                result TEXT,
                error_code TEXT,
                error_message TEXT,
                attempt INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_job_progress_expires ON job_progress(expires_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_job(
        &self,
        job: &JobMessage,
        location: JobLocation,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, priority, location, attempt, enqueued_at, not_before, history)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id.0)
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.priority.rank())
        .bind(location.as_str())
        .bind(i64::from(job.attempt))
        .bind(job.enqueued_at.timestamp_micros())
        .bind(not_before.map(|t| t.timestamp_micros()))
        .bind(serde_json::to_string(&job.history)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateJob(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_job(row: &SqliteRow) -> Result<JobMessage> {
        let id: String = row.try_get("id")?;
        let job_type: String = row.try_get("job_type")?;
        let payload: String = row.try_get("payload")?;
        let priority: i64 = row.try_get("priority")?;
        let attempt: i64 = row.try_get("attempt")?;
        let enqueued_at: i64 = row.try_get("enqueued_at")?;
        let not_before: Option<i64> = row.try_get("not_before")?;
        let claimed_at: Option<i64> = row.try_get("claimed_at")?;
        let history: String = row.try_get("history")?;

        let corrupt = |reason: &str| StorageError::Corrupt {
            id: id.clone(),
            reason: reason.to_string(),
        };

        Ok(JobMessage {
            payload: serde_json::from_str(&payload)?,
            priority: Priority::from_rank(priority).ok_or_else(|| corrupt("unknown priority"))?,
            enqueued_at: from_micros(enqueued_at).ok_or_else(|| corrupt("bad enqueued_at"))?,
            attempt: u32::try_from(attempt).map_err(|_| corrupt("bad attempt"))?,
            not_before: not_before.and_then(from_micros),
            claimed_at: claimed_at.and_then(from_micros),
            history: serde_json::from_str::<Vec<AttemptFailure>>(&history)?,
            job_type,
            id: JobId(id),
        })
    }

    fn row_to_dead_letter(row: &SqliteRow) -> Result<DeadLetter> {
        let job = Self::row_to_job(row)?;
        let code: Option<String> = row.try_get("error_code")?;
        let message: Option<String> = row.try_get("error_message")?;
        let dead_lettered_at: Option<i64> = row.try_get("dead_lettered_at")?;

        Ok(DeadLetter {
            error: ErrorInfo::new(code.unwrap_or_default(), message.unwrap_or_default()),
            dead_lettered_at: dead_lettered_at
                .and_then(from_micros)
                .unwrap_or(job.enqueued_at),
            job,
        })
    }

    fn row_to_progress(row: &SqliteRow) -> Result<JobProgress> {
        let job_id: String = row.try_get("job_id")?;
        let status: String = row.try_get("status")?;
        let percent: i64 = row.try_get("percent")?;
        let current_step: String = row.try_get("current_step")?;
        let result: Option<String> = row.try_get("result")?;
        let error_code: Option<String> = row.try_get("error_code")?;
        let error_message: Option<String> = row.try_get("error_message")?;
        let attempt: i64 = row.try_get("attempt")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        let corrupt = |reason: &str| StorageError::Corrupt {
            id: job_id.clone(),
            reason: reason.to_string(),
        };

        Ok(JobProgress {
            status: ProgressStatus::from_db(&status).ok_or_else(|| corrupt("unknown status"))?,
            percent: u8::try_from(percent).map_err(|_| corrupt("bad percent"))?,
            current_step,
            result: result.as_deref().map(|r| serde_json::from_str(r)).transpose()?,
            error: error_code.map(|code| ErrorInfo::new(code, error_message.unwrap_or_default())),
            attempt: u32::try_from(attempt).map_err(|_| corrupt("bad attempt"))?,
            updated_at: from_micros(updated_at).ok_or_else(|| corrupt("bad updated_at"))?,
        })
    }
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn not_claimed(rows_affected: u64, id: &JobId) -> Result<()> {
    if rows_affected == 0 {
        Err(StorageError::NotClaimed(id.clone()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl QueueStore for SqliteStorage {
    async fn enqueue_ready(&self, job: JobMessage) -> Result<()> {
        self.insert_job(&job, JobLocation::Ready, job.not_before).await
    }

    async fn enqueue_scheduled(&self, job: JobMessage, execute_at: DateTime<Utc>) -> Result<()> {
        self.insert_job(&job, JobLocation::Scheduled, Some(execute_at))
            .await
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET location = 'ready'
            WHERE location = 'scheduled'
              AND not_before <= ?
            RETURNING *
            "#,
        )
        .bind(now.timestamp_micros())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobMessage>> {
        // Select and claim in one statement so two workers can't take the same row.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET location = 'processing', claimed_at = ?, attempt = attempt + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE location = 'ready'
                ORDER BY priority DESC, enqueued_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now.timestamp_micros())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn ack(&self, job: &JobMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = ? AND location = 'processing' AND attempt = ? AND claimed_at = ?
            "#,
        )
        .bind(&job.id.0)
        .bind(i64::from(job.attempt))
        .bind(job.claimed_at.map(|t| t.timestamp_micros()))
        .execute(&self.pool)
        .await?;

        not_claimed(result.rows_affected(), &job.id)
    }

    async fn release(&self, job: &JobMessage) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET location = 'ready', claimed_at = NULL, history = ?
            WHERE id = ? AND location = 'processing' AND attempt = ? AND claimed_at = ?
            "#,
        )
        .bind(serde_json::to_string(&job.history)?)
        .bind(&job.id.0)
        .bind(i64::from(job.attempt))
        .bind(job.claimed_at.map(|t| t.timestamp_micros()))
        .execute(&self.pool)
        .await?;

        not_claimed(result.rows_affected(), &job.id)
    }

    async fn dead_letter(&self, job: &JobMessage, error: &ErrorInfo) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET location = 'dlq', claimed_at = NULL, history = ?,
                error_code = ?, error_message = ?, dead_lettered_at = ?
            WHERE id = ? AND location = 'processing' AND attempt = ? AND claimed_at = ?
            "#,
        )
        .bind(serde_json::to_string(&job.history)?)
        .bind(&error.code)
        .bind(&error.message)
        .bind(Utc::now().timestamp_micros())
        .bind(&job.id.0)
        .bind(i64::from(job.attempt))
        .bind(job.claimed_at.map(|t| t.timestamp_micros()))
        .execute(&self.pool)
        .await?;

        not_claimed(result.rows_affected(), &job.id)
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReclaimReport> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE location = 'processing' AND claimed_at < ?
            "#,
        )
        .bind(claimed_before.timestamp_micros())
        .fetch_all(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut report = ReclaimReport::default();
        for row in rows {
            let mut job = Self::row_to_job(&row)?;
            let error = stale_claim_error(job.claimed_at.take());
            job.record_failure(error.clone(), now);
            let history = serde_json::to_string(&job.history)?;

            if job.attempt >= max_attempts {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET location = 'dlq', claimed_at = NULL, history = ?,
                        error_code = ?, error_message = ?, dead_lettered_at = ?
                    WHERE id = ? AND location = 'processing'
                    "#,
                )
                .bind(history)
                .bind(&error.code)
                .bind(&error.message)
                .bind(now.timestamp_micros())
                .bind(&job.id.0)
                .execute(&mut *tx)
                .await?;
                report.dead_lettered.push(job);
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET location = 'ready', claimed_at = NULL, history = ?
                    WHERE id = ? AND location = 'processing'
                    "#,
                )
                .bind(history)
                .bind(&job.id.0)
                .execute(&mut *tx)
                .await?;
                report.released.push(job);
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn locate(&self, id: &JobId) -> Result<Option<JobLocation>> {
        let location: Option<String> = sqlx::query_scalar("SELECT location FROM jobs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        location
            .map(|l| {
                JobLocation::from_db(&l).ok_or_else(|| StorageError::Corrupt {
                    id: id.0.clone(),
                    reason: format!("unknown location {l}"),
                })
            })
            .transpose()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT location, COUNT(*) AS total FROM jobs GROUP BY location")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let location: String = row.try_get("location")?;
            let total: i64 = row.try_get("total")?;
            let total = total.max(0) as u64;
            match JobLocation::from_db(&location) {
                Some(JobLocation::Ready) => stats.ready = total,
                Some(JobLocation::Scheduled) => stats.scheduled = total,
                Some(JobLocation::Processing) => stats.processing = total,
                Some(JobLocation::DeadLetter) => stats.dead_letter = total,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE location = 'dlq'
            ORDER BY dead_lettered_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    async fn replay_dead_letter(&self, id: &JobId) -> Result<Option<JobMessage>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET location = 'ready', attempt = 0, enqueued_at = ?, not_before = NULL,
                error_code = NULL, error_message = NULL, dead_lettered_at = NULL
            WHERE id = ? AND location = 'dlq'
            RETURNING *
            "#,
        )
        .bind(Utc::now().timestamp_micros())
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn discard_dead_letter(&self, id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND location = 'dlq'")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ProgressStore for SqliteStorage {
    async fn upsert(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobProgress> {
        // Same merge rule as `ProgressUpdate::apply`, evaluated inside the upsert.
        let row = sqlx::query(
            r#"
            INSERT INTO job_progress
                (job_id, status, percent, current_step, result, error_code, error_message, attempt, updated_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                percent = CASE
                    WHEN job_progress.expires_at > ?9
                     AND job_progress.attempt = excluded.attempt
                     AND job_progress.percent > excluded.percent
                    THEN job_progress.percent
                    ELSE excluded.percent
                END,
                current_step = excluded.current_step,
                result = excluded.result,
                error_code = excluded.error_code,
                error_message = excluded.error_message,
                attempt = excluded.attempt,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            RETURNING *
            "#,
        )
        .bind(&job_id.0)
        .bind(update.status.as_str())
        .bind(i64::from(update.percent))
        .bind(&update.current_step)
        .bind(update.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(update.error.as_ref().map(|e| e.code.clone()))
        .bind(update.error.as_ref().map(|e| e.message.clone()))
        .bind(i64::from(update.attempt))
        .bind(now.timestamp_micros())
        .bind(expires_at.timestamp_micros())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_progress(&row)
    }

    async fn get(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<Option<JobProgress>> {
        let row = sqlx::query("SELECT * FROM job_progress WHERE job_id = ? AND expires_at > ?")
            .bind(&job_id.0)
            .bind(now.timestamp_micros())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_progress).transpose()
    }

    async fn get_many(
        &self,
        job_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<HashMap<JobId, JobProgress>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM job_progress WHERE expires_at > ");
        query.push_bind(now.timestamp_micros());
        query.push(" AND job_id IN (");
        let mut ids = query.separated(", ");
        for id in job_ids {
            ids.push_bind(id.0.clone());
        }
        ids.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<(JobId, JobProgress)> {
                let job_id: String = row.try_get("job_id")?;
                Ok((JobId(job_id), Self::row_to_progress(row)?))
            })
            .collect()
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_progress WHERE job_id = ?")
            .bind(&job_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_progress WHERE expires_at <= ?")
            .bind(now.timestamp_micros())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
