//! In-process storage backends.
//!
//! The queue store keeps all four collections behind one lock so every
//! operation moves a job between collections in a single critical section.
//! The progress store is a `DashMap` whose entries carry an expiry instant.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::job::{
    DeadLetter, ErrorInfo, JobId, JobLocation, JobMessage, Priority, QueueStats, ReclaimReport,
};
use crate::progress::{JobProgress, ProgressUpdate};

use super::{stale_claim_error, ProgressStore, QueueStore, Result, StorageError};

/// Ready ordering: higher priority first, then enqueue time, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    rank: Reverse<Priority>,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

type ScheduleKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Scheduled(ScheduleKey),
    Ready(ReadyKey),
    Processing,
    DeadLetter,
}

#[derive(Debug)]
struct Claim {
    job: JobMessage,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    seq: u64,
    scheduled: BTreeMap<ScheduleKey, JobMessage>,
    ready: BTreeMap<ReadyKey, JobMessage>,
    processing: HashMap<JobId, Claim>,
    dead_letter: Vec<DeadLetter>,
    index: HashMap<JobId, Slot>,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push_ready(&mut self, job: JobMessage) {
        let key = ReadyKey {
            rank: Reverse(job.priority),
            enqueued_at: job.enqueued_at,
            seq: self.next_seq(),
        };
        self.index.insert(job.id.clone(), Slot::Ready(key));
        self.ready.insert(key, job);
    }

    fn push_scheduled(&mut self, job: JobMessage, execute_at: DateTime<Utc>) {
        let key = (execute_at, self.next_seq());
        self.index.insert(job.id.clone(), Slot::Scheduled(key));
        self.scheduled.insert(key, job);
    }

    fn push_dead_letter(&mut self, job: JobMessage, error: ErrorInfo, at: DateTime<Utc>) {
        self.index.insert(job.id.clone(), Slot::DeadLetter);
        self.dead_letter.push(DeadLetter {
            job,
            error,
            dead_lettered_at: at,
        });
    }

    fn take_claim(&mut self, id: &JobId) -> Result<Claim> {
        let mut claim = self
            .processing
            .remove(id)
            .ok_or_else(|| StorageError::NotClaimed(id.clone()))?;
        self.index.remove(id);
        claim.job.claimed_at = None;
        Ok(claim)
    }

    /// Like `take_claim`, but only for the claim that handed out `job`.
    fn resolve_claim(&mut self, job: &JobMessage) -> Result<Claim> {
        match self.processing.get(&job.id) {
            Some(claim) if claim.job.same_claim(job) => self.take_claim(&job.id),
            _ => Err(StorageError::NotClaimed(job.id.clone())),
        }
    }
}

/// Queue store living inside the current process
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue_ready(&self, job: JobMessage) -> Result<()> {
        let mut state = self.state();
        if state.index.contains_key(&job.id) {
            return Err(StorageError::DuplicateJob(job.id));
        }
        state.push_ready(job);
        Ok(())
    }

    async fn enqueue_scheduled(&self, mut job: JobMessage, execute_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        if state.index.contains_key(&job.id) {
            return Err(StorageError::DuplicateJob(job.id));
        }
        job.not_before = Some(execute_at);
        state.push_scheduled(job, execute_at);
        Ok(())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>> {
        let mut state = self.state();

        let due: Vec<ScheduleKey> = state
            .scheduled
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for key in due {
            if let Some(job) = state.scheduled.remove(&key) {
                promoted.push(job.clone());
                state.push_ready(job);
            }
        }
        Ok(promoted)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<JobMessage>> {
        let mut state = self.state();

        let Some((_, mut job)) = state.ready.pop_first() else {
            return Ok(None);
        };
        job.attempt += 1;
        job.claimed_at = Some(now);

        state.index.insert(job.id.clone(), Slot::Processing);
        state.processing.insert(
            job.id.clone(),
            Claim {
                job: job.clone(),
                claimed_at: now,
            },
        );
        Ok(Some(job))
    }

    async fn ack(&self, job: &JobMessage) -> Result<()> {
        self.state().resolve_claim(job)?;
        Ok(())
    }

    async fn release(&self, job: &JobMessage) -> Result<()> {
        let mut state = self.state();
        let mut stored = state.resolve_claim(job)?.job;
        stored.history = job.history.clone();
        state.push_ready(stored);
        Ok(())
    }

    async fn dead_letter(&self, job: &JobMessage, error: &ErrorInfo) -> Result<()> {
        let mut state = self.state();
        let mut stored = state.resolve_claim(job)?.job;
        stored.history = job.history.clone();
        state.push_dead_letter(stored, error.clone(), Utc::now());
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReclaimReport> {
        let mut state = self.state();

        let stale: Vec<JobId> = state
            .processing
            .iter()
            .filter(|(_, claim)| claim.claimed_at < claimed_before)
            .map(|(id, _)| id.clone())
            .collect();

        let now = Utc::now();
        let mut report = ReclaimReport::default();
        for id in stale {
            let Claim { mut job, claimed_at } = state.take_claim(&id)?;
            let error = stale_claim_error(Some(claimed_at));
            job.record_failure(error.clone(), now);

            if job.attempt >= max_attempts {
                report.dead_lettered.push(job.clone());
                state.push_dead_letter(job, error, now);
            } else {
                report.released.push(job.clone());
                state.push_ready(job);
            }
        }
        Ok(report)
    }

    async fn locate(&self, id: &JobId) -> Result<Option<JobLocation>> {
        Ok(self.state().index.get(id).map(|slot| match slot {
            Slot::Scheduled(_) => JobLocation::Scheduled,
            Slot::Ready(_) => JobLocation::Ready,
            Slot::Processing => JobLocation::Processing,
            Slot::DeadLetter => JobLocation::DeadLetter,
        }))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state();
        Ok(QueueStats {
            ready: state.ready.len() as u64,
            scheduled: state.scheduled.len() as u64,
            processing: state.processing.len() as u64,
            dead_letter: state.dead_letter.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self
            .state()
            .dead_letter
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(&self, id: &JobId) -> Result<Option<JobMessage>> {
        let mut state = self.state();

        let Some(pos) = state.dead_letter.iter().position(|entry| &entry.job.id == id) else {
            return Ok(None);
        };
        let mut job = state.dead_letter.remove(pos).job;
        state.index.remove(id);

        job.attempt = 0;
        job.not_before = None;
        job.enqueued_at = Utc::now();
        state.push_ready(job.clone());
        Ok(Some(job))
    }

    async fn discard_dead_letter(&self, id: &JobId) -> Result<bool> {
        let mut state = self.state();

        let Some(pos) = state.dead_letter.iter().position(|entry| &entry.job.id == id) else {
            return Ok(false);
        };
        state.dead_letter.remove(pos);
        state.index.remove(id);
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct ProgressEntry {
    progress: JobProgress,
    expires_at: DateTime<Utc>,
}

/// Progress records kept in a concurrent map with per-entry expiry
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: DashMap<JobId, ProgressEntry>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn upsert(
        &self,
        job_id: &JobId,
        update: ProgressUpdate,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<JobProgress> {
        // The entry guard holds the shard lock, so the merge is atomic.
        let progress = match self.records.entry(job_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let progress = {
                    let current = occupied.get();
                    let live = (current.expires_at > now).then_some(&current.progress);
                    update.apply(live, now)
                };
                occupied.insert(ProgressEntry {
                    progress: progress.clone(),
                    expires_at,
                });
                progress
            }
            Entry::Vacant(vacant) => {
                let progress = update.apply(None, now);
                vacant.insert(ProgressEntry {
                    progress: progress.clone(),
                    expires_at,
                });
                progress
            }
        };
        Ok(progress)
    }

    async fn get(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<Option<JobProgress>> {
        Ok(self
            .records
            .get(job_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.progress.clone()))
    }

    async fn get_many(
        &self,
        job_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<HashMap<JobId, JobProgress>> {
        let mut found = HashMap::with_capacity(job_ids.len());
        for id in job_ids {
            if let Some(progress) = self.get(id, now).await? {
                found.insert(id.clone(), progress);
            }
        }
        Ok(found)
    }

    async fn remove(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.records.remove(job_id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.records.len();
        self.records.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
