use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::producer::ValidationError;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dispatch priority of a job.
///
/// Higher tiers are always claimed before lower ones, and jobs within a tier
/// are claimed in enqueue order. There is no fairness between tiers: a steady
/// stream of `High` jobs starves `Low` jobs for as long as it lasts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Normal => "Normal",
            Priority::High => "High",
        }
    }

    /// Storage rank; larger ranks are claimed first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    /// Only the tier names are accepted. Numeric encodings are rejected so a
    /// caller can never get the ordering backwards.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(ValidationError::InvalidPriority(s.to_string())),
        }
    }
}

/// Machine-readable failure description shared by progress records,
/// attempt history and dead-letter entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub code: String,
}

impl ErrorInfo {
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

/// One failed execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptFailure {
    pub attempt: u32,
    pub error: ErrorInfo,
    pub failed_at: DateTime<Utc>,
}

/// A unit of work travelling through the queue store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Executions started so far. The store bumps it on every claim.
    pub attempt: u32,
    pub not_before: Option<DateTime<Utc>>,
    /// Set by the claim that handed this copy out. Together with `attempt`
    /// it identifies the claim, so a worker whose claim was reclaimed can't
    /// resolve somebody else's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<AttemptFailure>,
}

impl JobMessage {
    pub fn new<S: Into<String>>(job_type: S, payload: Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: Priority::Normal,
            enqueued_at: Utc::now(),
            attempt: 0,
            not_before: None,
            claimed_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.not_before = Some(run_at);
        self
    }

    /// Append a failure for the current attempt.
    pub fn record_failure(&mut self, error: ErrorInfo, failed_at: DateTime<Utc>) {
        self.history.push(AttemptFailure {
            attempt: self.attempt,
            error,
            failed_at,
        });
    }

    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.history.last()
    }

    /// Whether `other` is the same job handed out by the same claim.
    pub fn same_claim(&self, other: &JobMessage) -> bool {
        self.id == other.id
            && self.attempt == other.attempt
            && self.claimed_at.is_some()
            && self.claimed_at == other.claimed_at
    }
}

/// The collection currently holding a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobLocation {
    Scheduled,
    Ready,
    Processing,
    DeadLetter,
}

impl JobLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobLocation::Scheduled => "scheduled",
            JobLocation::Ready => "ready",
            JobLocation::Processing => "processing",
            JobLocation::DeadLetter => "dlq",
        }
    }

    pub fn from_db(location: &str) -> Option<Self> {
        match location {
            "scheduled" => Some(JobLocation::Scheduled),
            "ready" => Some(JobLocation::Ready),
            "processing" => Some(JobLocation::Processing),
            "dlq" => Some(JobLocation::DeadLetter),
            _ => None,
        }
    }
}

impl fmt::Display for JobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job that exhausted its retries or could not be routed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: JobMessage,
    pub error: ErrorInfo,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Size of each collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub ready: u64,
    pub scheduled: u64,
    pub processing: u64,
    pub dead_letter: u64,
}

/// Result of releasing stale claims
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    /// Jobs moved back to ready
    pub released: Vec<JobMessage>,
    /// Jobs whose attempt budget was already spent
    pub dead_lettered: Vec<JobMessage>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.dead_lettered.is_empty()
    }
}
