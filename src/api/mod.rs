mod error;

pub use error::ApiError;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{DeadLetter, JobId, Priority, QueueStats};
use crate::producer::{JobProducer, ValidationError};
use crate::progress::{JobProgress, ProgressTracker};
use crate::storage::QueueStore;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub producer: JobProducer,
    pub progress: ProgressTracker,
    pub store: Arc<dyn QueueStore>,
}

/// Routes for producers and operators, ready to merge into a host router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", post(enqueue_job))
        .route("/jobs/schedule", post(schedule_job))
        .route("/jobs/progress/batch", post(progress_batch))
        .route("/jobs/progress/{job_id}", get(progress))
        .route("/jobs/stats", get(stats))
        .route("/jobs/dead-letter", get(dead_letters))
        .route("/jobs/dead-letter/{job_id}/replay", post(replay_dead_letter))
        .route("/jobs/dead-letter/{job_id}", delete(discard_dead_letter))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Tier name. Anything but a string is rejected.
    #[serde(default)]
    pub priority: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<Value>,
    pub delay_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub job_id: JobId,
    pub execute_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

fn parse_priority(raw: Option<&Value>) -> Result<Priority, ValidationError> {
    match raw {
        None | Some(Value::Null) => Ok(Priority::default()),
        Some(Value::String(name)) => name.parse(),
        Some(other) => Err(ValidationError::InvalidPriority(other.to_string())),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request("InvalidRequest", e.body_text()))
}

async fn enqueue_job(
    State(state): State<ApiState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let priority = parse_priority(req.priority.as_ref())?;

    let job_id = state.producer.enqueue(&req.job_type, req.payload, priority).await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

async fn schedule_job(
    State(state): State<ApiState>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = json_body(body)?;
    let priority = parse_priority(req.priority.as_ref())?;
    let delay = chrono::Duration::try_seconds(req.delay_seconds)
        .ok_or(ValidationError::DelayOutOfRange(req.delay_seconds))?;

    let (job_id, execute_at) = state
        .producer
        .schedule(&req.job_type, req.payload, priority, delay)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScheduleResponse { job_id, execute_at }),
    ))
}

async fn progress(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let job_id = JobId(job_id);
    state
        .progress
        .get_progress(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
}

async fn progress_batch(
    State(state): State<ApiState>,
    body: Result<Json<Vec<JobId>>, JsonRejection>,
) -> Result<Json<HashMap<JobId, Option<JobProgress>>>, ApiError> {
    let ids = json_body(body)?;
    Ok(Json(state.progress.get_batch(&ids).await?))
}

async fn stats(State(state): State<ApiState>) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

async fn dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    Ok(Json(state.store.dead_letters(limit).await?))
}

async fn replay_dead_letter(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = JobId(job_id);
    match state.producer.replay(&job_id).await? {
        Some(job_id) => Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id }))),
        None => Err(ApiError::NotFound(format!("dead-lettered job {job_id}"))),
    }
}

async fn discard_dead_letter(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let job_id = JobId(job_id);
    if state.store.discard_dead_letter(&job_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("dead-lettered job {job_id}")))
    }
}
