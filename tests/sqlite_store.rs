//! Contract tests for the SQLite queue and progress stores

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobs_core::progress::ProgressTracker;
use jobs_core::{
    ErrorInfo, JobId, JobLocation, JobMessage, Priority, ProgressStatus, ProgressStore,
    ProgressUpdate, QueueStore, SqliteStorage, StorageError,
};
use serde_json::{json, Value};

async fn storage() -> SqliteStorage {
    SqliteStorage::in_memory().await.unwrap()
}

fn job(job_type: &str, priority: Priority) -> JobMessage {
    JobMessage::new(job_type, json!({"type": job_type})).with_priority(priority)
}

#[tokio::test]
async fn claims_follow_priority_then_enqueue_order() {
    let store = storage().await;
    let base = Utc::now();

    for (i, (name, priority)) in [
        ("low", Priority::Low),
        ("high-1", Priority::High),
        ("normal", Priority::Normal),
        ("high-2", Priority::High),
    ]
    .into_iter()
    .enumerate()
    {
        let mut j = job(name, priority);
        j.enqueued_at = base + chrono::Duration::milliseconds(i as i64);
        store.enqueue_ready(j).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(claimed) = store.claim_next(Utc::now()).await.unwrap() {
        assert_eq!(claimed.attempt, 1);
        order.push(claimed.job_type);
    }
    assert_eq!(order, vec!["high-1", "high-2", "normal", "low"]);
}

#[tokio::test]
async fn payload_and_metadata_survive_storage() {
    let store = storage().await;
    let original = JobMessage::new("Job.SendEmail.Bulk", json!({"to": ["a@b.c"], "n": 2}))
        .with_priority(Priority::High);
    store.enqueue_ready(original.clone()).await.unwrap();

    let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, original.id);
    assert_eq!(claimed.payload, original.payload);
    assert_eq!(claimed.priority, Priority::High);
    assert_eq!(
        claimed.enqueued_at.timestamp_micros(),
        original.enqueued_at.timestamp_micros()
    );
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let store = storage().await;
    let j = job("Job.X", Priority::Normal);
    store.enqueue_ready(j.clone()).await.unwrap();

    let err = store.enqueue_scheduled(j, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateJob(_)));
}

#[tokio::test]
async fn scheduled_jobs_wait_for_their_time() {
    let store = storage().await;
    let j = job("Job.Report", Priority::Normal);
    let id = j.id.clone();
    let execute_at = Utc::now() + chrono::Duration::seconds(30);
    store.enqueue_scheduled(j, execute_at).await.unwrap();

    assert!(store.claim_next(Utc::now()).await.unwrap().is_none());
    assert!(store
        .promote_due(execute_at - chrono::Duration::milliseconds(1))
        .await
        .unwrap()
        .is_empty());

    let promoted = store.promote_due(execute_at).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].not_before.map(|t| t.timestamp_micros()), Some(execute_at.timestamp_micros()));
    assert_eq!(store.locate(&id).await.unwrap(), Some(JobLocation::Ready));

    // promotion is idempotent
    assert!(store.promote_due(execute_at).await.unwrap().is_empty());
}

#[tokio::test]
async fn resolving_an_unclaimed_job_fails_with_not_claimed() {
    let store = storage().await;
    let j = job("Job.X", Priority::Normal);
    store.enqueue_ready(j.clone()).await.unwrap();

    assert!(matches!(store.ack(&j).await, Err(StorageError::NotClaimed(_))));
    assert!(matches!(store.release(&j).await, Err(StorageError::NotClaimed(_))));

    let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
    store.ack(&claimed).await.unwrap();
    assert_eq!(store.locate(&claimed.id).await.unwrap(), None);
    assert!(!StorageError::NotClaimed(claimed.id).is_transient());
}

#[tokio::test]
async fn release_persists_attempt_and_history() {
    let store = storage().await;
    store.enqueue_ready(job("Job.Flaky", Priority::Normal)).await.unwrap();

    let mut claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
    claimed.record_failure(ErrorInfo::new("Upstream", "503"), Utc::now());
    store.release(&claimed).await.unwrap();

    let again = store.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(again.attempt, 2);
    assert_eq!(again.history.len(), 1);
    assert_eq!(again.history[0].error.code, "Upstream");
}

#[tokio::test]
async fn dead_letter_replay_and_discard() {
    let store = storage().await;
    let j = job("Job.Broken", Priority::Low);
    let id = j.id.clone();
    store.enqueue_ready(j).await.unwrap();

    let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
    store
        .dead_letter(&claimed, &ErrorInfo::new("HandlerFailed", "boom"))
        .await
        .unwrap();

    let entries = store.dead_letters(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job.id, id);
    assert_eq!(entries[0].error.message, "boom");
    assert_eq!(store.stats().await.unwrap().dead_letter, 1);

    let replayed = store.replay_dead_letter(&id).await.unwrap().unwrap();
    assert_eq!(replayed.attempt, 0);
    assert_eq!(store.locate(&id).await.unwrap(), Some(JobLocation::Ready));
    assert!(store.replay_dead_letter(&id).await.unwrap().is_none());

    let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.attempt, 1);
    store
        .dead_letter(&claimed, &ErrorInfo::new("HandlerFailed", "boom"))
        .await
        .unwrap();
    assert!(store.discard_dead_letter(&id).await.unwrap());
    assert!(!store.discard_dead_letter(&id).await.unwrap());
    assert_eq!(store.locate(&id).await.unwrap(), None);
}

#[tokio::test]
async fn stale_claims_are_reclaimed() {
    let store = storage().await;
    let fresh = job("Job.Fresh", Priority::Normal);
    let stale = job("Job.Stale", Priority::High);
    let spent = job("Job.Spent", Priority::High);
    let (fresh_id, stale_id, spent_id) = (fresh.id.clone(), stale.id.clone(), spent.id.clone());

    store.enqueue_ready(spent).await.unwrap();
    let long_ago = Utc::now() - chrono::Duration::hours(1);
    for _ in 0..3 {
        let claim = store.claim_next(Utc::now()).await.unwrap().unwrap();
        store.release(&claim).await.unwrap();
    }
    let spent_claim = store.claim_next(long_ago).await.unwrap().unwrap();
    assert_eq!(spent_claim.attempt, 4);

    store.enqueue_ready(stale).await.unwrap();
    store.claim_next(long_ago).await.unwrap().unwrap();
    store.enqueue_ready(fresh).await.unwrap();
    store.claim_next(Utc::now()).await.unwrap().unwrap();

    let report = store
        .reclaim_stale(Utc::now() - chrono::Duration::minutes(15), 4)
        .await
        .unwrap();

    assert_eq!(report.released.len(), 1);
    assert_eq!(report.released[0].id, stale_id);
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(report.dead_lettered[0].id, spent_id);
    assert_eq!(report.dead_lettered[0].last_failure().unwrap().error.code, "StaleClaim");

    assert_eq!(store.locate(&stale_id).await.unwrap(), Some(JobLocation::Ready));
    assert_eq!(store.locate(&spent_id).await.unwrap(), Some(JobLocation::DeadLetter));
    assert_eq!(store.locate(&fresh_id).await.unwrap(), Some(JobLocation::Processing));
}

#[tokio::test]
async fn reclaimed_claim_cannot_resolve_the_new_one() {
    let store = storage().await;
    let j = job("Job.Slow", Priority::Normal);
    store.enqueue_ready(j.clone()).await.unwrap();

    let first = store
        .claim_next(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap()
        .unwrap();
    let report = store
        .reclaim_stale(Utc::now() - chrono::Duration::minutes(15), 5)
        .await
        .unwrap();
    assert_eq!(report.released.len(), 1);

    let second = store.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(second.attempt, 2);

    assert!(matches!(store.release(&first).await, Err(StorageError::NotClaimed(_))));
    assert!(matches!(store.ack(&first).await, Err(StorageError::NotClaimed(_))));
    assert!(matches!(
        store
            .dead_letter(&first, &ErrorInfo::new("HandlerFailed", "late"))
            .await,
        Err(StorageError::NotClaimed(_))
    ));
    assert_eq!(store.locate(&j.id).await.unwrap(), Some(JobLocation::Processing));
    assert!(store.claim_next(Utc::now()).await.unwrap().is_none());

    store.release(&second).await.unwrap();
    let third = store.claim_next(Utc::now()).await.unwrap().unwrap();
    assert_eq!(third.attempt, 3);
    store.ack(&third).await.unwrap();
    assert_eq!(store.locate(&j.id).await.unwrap(), None);
}

#[tokio::test]
async fn progress_upsert_clamps_within_attempt() {
    let store = storage().await;
    let id = JobId::new();
    let now = Utc::now();
    let expires = now + chrono::Duration::hours(1);

    store
        .upsert(&id, ProgressUpdate::running(1, 70, "Scoring"), now, expires)
        .await
        .unwrap();
    let lower = store
        .upsert(&id, ProgressUpdate::running(1, 30, "Late"), now, expires)
        .await
        .unwrap();
    assert_eq!(lower.percent, 70);
    assert_eq!(lower.current_step, "Late");

    let next = store
        .upsert(&id, ProgressUpdate::running(2, 0, "Starting"), now, expires)
        .await
        .unwrap();
    assert_eq!(next.percent, 0);
    assert_eq!(next.attempt, 2);

    let failed = store
        .upsert(
            &id,
            ProgressUpdate::failed(2, ErrorInfo::new("Timeout", "too slow")),
            now,
            expires,
        )
        .await
        .unwrap();
    assert_eq!(failed.status, ProgressStatus::Failed);
    assert_eq!(failed.error, Some(ErrorInfo::new("Timeout", "too slow")));
    assert!(failed.result.is_none());
}

#[tokio::test]
async fn expired_progress_is_not_found_and_purged() {
    let store = storage().await;
    let now = Utc::now();
    let gone = JobId::new();
    let live = JobId::new();

    store
        .upsert(&gone, ProgressUpdate::pending(), now, now + chrono::Duration::seconds(1))
        .await
        .unwrap();
    store
        .upsert(&live, ProgressUpdate::pending(), now, now + chrono::Duration::hours(1))
        .await
        .unwrap();

    let later = now + chrono::Duration::seconds(5);
    assert!(store.get(&gone, later).await.unwrap().is_none());
    assert!(store.get(&live, later).await.unwrap().is_some());

    let many = store
        .get_many(&[gone.clone(), live.clone(), JobId::new()], later)
        .await
        .unwrap();
    assert_eq!(many.len(), 1);
    assert!(many.contains_key(&live));

    assert_eq!(store.purge_expired(later).await.unwrap(), 1);
    assert!(store.get(&gone, now).await.unwrap().is_none());
}

#[tokio::test]
async fn completed_result_round_trips() {
    let storage = Arc::new(storage().await);
    let tracker = ProgressTracker::new(storage, Duration::from_secs(3600), 50);
    let id = JobId::new();

    tracker
        .set_progress(&id, ProgressUpdate::completed(1, Some(json!({"matches": [1, 2]}))))
        .await
        .unwrap();
    let progress = tracker.get_progress(&id).await.unwrap().unwrap();
    assert_eq!(progress.percent, 100);
    assert_eq!(progress.result, Some(json!({"matches": [1, 2]})));
}

#[tokio::test]
async fn concurrent_workers_never_share_a_claim() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let store = Arc::new(SqliteStorage::new(&url).await.unwrap());

    let mut expected = HashSet::new();
    for i in 0..40 {
        let j = JobMessage::new("Job.Bulk", Value::from(i));
        expected.insert(j.id.clone());
        store.enqueue_ready(j).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                match store.claim_next(Utc::now()).await {
                    Ok(Some(job)) => mine.push(job.id),
                    Ok(None) => break,
                    Err(e) if e.is_transient() => tokio::time::sleep(Duration::from_millis(5)).await,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            mine
        }));
    }

    let mut claimed = Vec::new();
    for task in tasks {
        claimed.extend(task.await.unwrap());
    }

    let unique: HashSet<JobId> = claimed.iter().cloned().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique, expected);
    assert_eq!(store.stats().await.unwrap().processing, 40);
}

#[tokio::test]
async fn lock_contention_is_transient_but_bad_sql_is_not() {
    use std::str::FromStr;

    use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
    use sqlx::Connection;

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let store = SqliteStorage::new(&url).await.unwrap();

    let options = SqliteConnectOptions::from_str(&url)
        .unwrap()
        .busy_timeout(Duration::ZERO);
    let mut holder = SqliteConnection::connect_with(&options).await.unwrap();
    let mut contender = SqliteConnection::connect_with(&options).await.unwrap();

    sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();
    let busy = sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut contender)
        .await
        .unwrap_err();
    assert!(StorageError::from(busy).is_transient());
    sqlx::query("ROLLBACK").execute(&mut holder).await.unwrap();

    let missing_table = sqlx::query("SELECT * FROM no_such_table")
        .execute(&mut contender)
        .await
        .unwrap_err();
    assert!(matches!(missing_table, sqlx::Error::Database(_)));
    assert!(!StorageError::from(missing_table).is_transient());

    // The store itself is untouched by the contention.
    store.enqueue_ready(job("Job.After", Priority::Normal)).await.unwrap();
    assert_eq!(store.stats().await.unwrap().ready, 1);
}
