use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use jobs_core::{
    ErrorInfo, FnHandler, HandlerRegistry, JobContext, JobId, JobQueue, JobResult, QueueConfig,
    QueueStore,
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn noop(_payload: Value, _ctx: JobContext) -> JobResult {
    Ok(None)
}

fn queue() -> JobQueue {
    let registry = HandlerRegistry::builder()
        .register(FnHandler::new(["Job.SendEmail.*"], noop))
        .build()
        .unwrap();
    JobQueue::in_memory(QueueConfig::default(), registry).unwrap()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn enqueue_returns_job_id_and_pending_progress() {
    let queue = queue();
    let app = queue.router();

    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs",
        Some(json!({"type": "Job.SendEmail.Bulk", "payload": {"to": "a@b.c"}, "priority": "High"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let (status, progress) = send(&app, Method::GET, &format!("/jobs/progress/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["status"], "Pending");
    assert_eq!(progress["percent"], 0);

    let (status, stats) = send(&app, Method::GET, "/jobs/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["ready"], 1);
}

#[tokio::test]
async fn numeric_priority_is_rejected() {
    let app = queue().router();
    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs",
        Some(json!({"type": "Job.SendEmail.Bulk", "priority": 2})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidPriority");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn unknown_priority_name_is_rejected() {
    let app = queue().router();
    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs",
        Some(json!({"type": "Job.SendEmail.Bulk", "priority": "Urgent"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidPriority");
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let app = queue().router();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "InvalidRequest");
}

#[tokio::test]
async fn schedule_reports_execution_time() {
    let queue = queue();
    let app = queue.router();
    let before = Utc::now();

    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/schedule",
        Some(json!({"type": "Job.SendEmail.Digest", "payload": {}, "delaySeconds": 120})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["jobId"].is_string());

    let execute_at: chrono::DateTime<Utc> =
        serde_json::from_value(body["executeAt"].clone()).unwrap();
    assert!(execute_at >= before + chrono::Duration::seconds(120));

    let (_, stats) = send(&app, Method::GET, "/jobs/stats", None).await;
    assert_eq!(stats["scheduled"], 1);
    assert_eq!(stats["ready"], 0);
}

#[tokio::test]
async fn negative_delay_is_rejected() {
    let app = queue().router();
    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/schedule",
        Some(json!({"type": "Job.SendEmail.Digest", "delaySeconds": -5})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "NegativeDelay");
}

#[tokio::test]
async fn unknown_progress_is_not_found() {
    let app = queue().router();
    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/jobs/progress/{}", JobId::new()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");
}

#[tokio::test]
async fn progress_batch_reports_missing_ids_and_caps_size() {
    let queue = queue();
    let app = queue.router();
    let known = queue
        .producer()
        .enqueue("Job.SendEmail.Bulk", json!({}), Default::default())
        .await
        .unwrap();
    let unknown = JobId::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/progress/batch",
        Some(json!([known, unknown])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[known.0.as_str()]["status"], "Pending");
    assert!(body[unknown.0.as_str()].is_null());

    let too_many: Vec<JobId> = (0..51).map(|_| JobId::new()).collect();
    let (status, body) = send(
        &app,
        Method::POST,
        "/jobs/progress/batch",
        Some(json!(too_many)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BatchTooLarge");
}

#[tokio::test]
async fn dead_letters_can_be_listed_replayed_and_discarded() {
    let queue = queue();
    let app = queue.router();
    let store = queue.store();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let id = queue
            .producer()
            .enqueue("Job.SendEmail.Bulk", json!({}), Default::default())
            .await
            .unwrap();
        let claimed = store.claim_next(Utc::now()).await.unwrap().unwrap();
        store
            .dead_letter(&claimed, &ErrorInfo::new("HandlerFailed", "smtp down"))
            .await
            .unwrap();
        ids.push(id);
    }

    let (status, body) = send(&app, Method::GET, "/jobs/dead-letter?limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(&app, Method::GET, "/jobs/dead-letter", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["error"]["code"], "HandlerFailed");

    let replay_uri = format!("/jobs/dead-letter/{}/replay", ids[0]);
    let (status, body) = send(&app, Method::POST, &replay_uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["jobId"], ids[0].0.as_str());
    let (status, _) = send(&app, Method::POST, &replay_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, progress) = send(&app, Method::GET, &format!("/jobs/progress/{}", ids[0]), None).await;
    assert_eq!(progress["status"], "Pending");

    let discard_uri = format!("/jobs/dead-letter/{}", ids[1]);
    let (status, body) = send(&app, Method::DELETE, &discard_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(body.is_null());
    let (status, _) = send(&app, Method::DELETE, &discard_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, stats) = send(&app, Method::GET, "/jobs/stats", None).await;
    assert_eq!(stats["deadLetter"], 0);
    assert_eq!(stats["ready"], 1);
}
