//! Standalone job server.
//!
//! Run with: cargo run --example server [config.toml]

use std::time::Duration;

use jobs_core::{telemetry, FnHandler, HandlerRegistry, JobQueue, Priority, Settings};
use serde_json::json;

mod jobs;
use jobs::ai_matching::MatchCandidates;
use jobs::send_email::SendEmail;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(std::env::args().nth(1))?;
    telemetry::init(&settings.log_level, settings.log_json)?;

    // 1. Register handlers
    let registry = HandlerRegistry::builder()
        .register(FnHandler::new(["Job.SendEmail.*"], SendEmail::handler))
        .register_with_timeout(
            FnHandler::new(["Job.AiMatching"], MatchCandidates::handler),
            Duration::from_secs(600),
        )
        .build()?;

    // 2. Open the queue on the configured store
    let mut queue = match settings.database_url.as_deref() {
        Some(url) => JobQueue::sqlite(url, settings.queue.clone(), registry).await?,
        None => JobQueue::in_memory(settings.queue.clone(), registry)?,
    };

    // 3. Start workers and the sweeper
    queue.start();

    // 4. Enqueue a couple of jobs
    queue
        .producer()
        .enqueue(
            "Job.SendEmail.Bulk",
            json!({ "recipients": ["a@example.com", "b@example.com"], "subject": "Welcome!" }),
            Priority::High,
        )
        .await?;

    queue
        .producer()
        .schedule(
            "Job.AiMatching",
            json!({ "jobPostingId": "JP-1", "candidateIds": ["c1", "c2", "c3"] }),
            Priority::Normal,
            chrono::Duration::seconds(10),
        )
        .await?;

    // 5. Serve the HTTP API
    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    tracing::info!(addr = %settings.listen_addr, "Listening");

    let shutdown = queue.shutdown_token();
    let app = axum::Router::new().merge(queue.router());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    queue.wait_for_shutdown().await?;
    server.await??;
    Ok(())
}
