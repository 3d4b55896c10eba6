use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::job::{ErrorInfo, JobId, JobMessage};
use crate::progress::ProgressReporter;

/// Error type for job execution
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type {0}")]
    NoHandler(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("{message}")]
    Failed { code: String, message: String },

    /// A failure that retrying cannot fix
    #[error("{message}")]
    Fatal { code: String, message: String },

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job handler panicked")]
    Panicked,

    #[error("Job handler was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        JobError::Failed {
            code: "HandlerFailed".to_string(),
            message: message.into(),
        }
    }

    pub fn with_code<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        JobError::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn fatal<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        JobError::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code reported in progress and dead-letter records.
    pub fn code(&self) -> &str {
        match self {
            JobError::NoHandler(_) => "NoHandler",
            JobError::InvalidPayload(_) => "InvalidPayload",
            JobError::Failed { code, .. } | JobError::Fatal { code, .. } => code,
            JobError::Timeout(_) => "Timeout",
            JobError::Panicked => "HandlerPanicked",
            JobError::Cancelled => "HandlerCancelled",
        }
    }

    /// Routing and payload errors fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::NoHandler(_) | JobError::InvalidPayload(_) | JobError::Fatal { .. }
        )
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::failed(message)
    }
}

/// Success carries an optional result payload for the progress record.
pub type JobResult = Result<Option<Value>, JobError>;

/// Everything a handler gets for one attempt of one job
#[derive(Clone)]
pub struct JobContext {
    job: JobMessage,
    cancellation: CancellationToken,
    progress: ProgressReporter,
}

impl JobContext {
    pub fn new(job: JobMessage, cancellation: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            job,
            cancellation,
            progress,
        }
    }

    pub fn job(&self) -> &JobMessage {
        &self.job
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    /// Cancelled when the attempt times out. Long-running handlers should
    /// check it between steps.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Report progress, logging instead of failing when the write is rejected.
    pub async fn report<S: Into<String>>(&self, percent: u8, step: S) {
        if let Err(e) = self.progress.report(percent, step).await {
            tracing::warn!(job_id = %self.job.id, error = %e, "Failed to report progress");
        }
    }

    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }
}

/// A pluggable unit of business logic for one or more job types.
///
/// Patterns are either exact job types (`Job.Report.Monthly`) or a prefix
/// ending in `.*` (`Job.SendEmail.*`).
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn patterns(&self) -> Vec<String>;

    async fn execute(&self, ctx: JobContext) -> JobResult;
}

type BoxedHandler =
    Arc<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

/// Handler built from an async function over a typed payload.
///
/// # Example
/// ```ignore
/// let send_email = FnHandler::new(["Job.SendEmail.*"], |args: SendEmailArgs, ctx| async move {
///     ctx.report(50, "Rendering").await;
///     Ok(None)
/// });
/// ```
pub struct FnHandler {
    patterns: Vec<String>,
    handler: BoxedHandler,
}

impl FnHandler {
    pub fn new<T, F, Fut, P>(patterns: P, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let handler = Arc::new(handler);

        let boxed: BoxedHandler = Arc::new(move |ctx: JobContext| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = ctx.deserialize_payload()?;
                handler(args, ctx).await
            })
        });

        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            handler: boxed,
        }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    fn patterns(&self) -> Vec<String> {
        self.patterns.clone()
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        (self.handler)(ctx).await
    }
}

/// Run one attempt on its own task so a panic can't take the worker down.
///
/// When `timeout` elapses the context's token is cancelled and the task is
/// aborted.
pub(crate) async fn run_with_timeout(
    handler: Arc<dyn JobHandler>,
    ctx: JobContext,
    timeout: Duration,
) -> JobResult {
    let token = ctx.cancellation().clone();
    let mut handle = tokio::spawn(async move { handler.execute(ctx).await });

    let join_to_error = |e: JoinError| {
        if e.is_panic() {
            JobError::Panicked
        } else {
            JobError::Cancelled
        }
    };

    tokio::select! {
        res = &mut handle => res.unwrap_or_else(|e| Err(join_to_error(e))),
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            handle.abort();
            Err(JobError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;
    use crate::storage::MemoryProgressStore;
    use serde::Deserialize;
    use serde_json::json;

    fn context(payload: Value) -> JobContext {
        let tracker = ProgressTracker::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(60),
            50,
        );
        let mut job = JobMessage::new("Job.Test", payload);
        job.attempt = 1;
        let reporter = tracker.reporter(job.id.clone(), 1);
        JobContext::new(job, CancellationToken::new(), reporter)
    }

    #[derive(Deserialize)]
    struct Args {
        to: String,
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(JobError::NoHandler("x".into()).code(), "NoHandler");
        assert_eq!(JobError::Timeout(Duration::from_secs(1)).code(), "Timeout");
        assert_eq!(JobError::failed("x").code(), "HandlerFailed");
        assert_eq!(JobError::with_code("SmtpDown", "x").code(), "SmtpDown");
        assert_eq!(JobError::Panicked.code(), "HandlerPanicked");

        assert!(JobError::failed("x").is_retryable());
        assert!(JobError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!JobError::fatal("BadInput", "x").is_retryable());
        assert!(!JobError::NoHandler("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn fn_handler_deserializes_payload() {
        let handler = FnHandler::new(["Job.Test"], |args: Args, _ctx| async move {
            Ok(Some(json!({ "sent_to": args.to })))
        });
        assert_eq!(handler.patterns(), vec!["Job.Test".to_string()]);

        let result = handler.execute(context(json!({"to": "a@b.c"}))).await.unwrap();
        assert_eq!(result, Some(json!({"sent_to": "a@b.c"})));

        let err = handler.execute(context(json!({"nope": 1}))).await.unwrap_err();
        assert_eq!(err.code(), "InvalidPayload");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_cancels_the_token() {
        let handler: Arc<dyn JobHandler> = Arc::new(FnHandler::new(
            ["Job.Test"],
            |_: Value, ctx: JobContext| async move {
                ctx.cancellation().cancelled().await;
                Ok(None)
            },
        ));
        let ctx = context(Value::Null);
        let token = ctx.cancellation().clone();

        let err = run_with_timeout(handler, ctx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Timeout(_)));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn panics_become_failures() {
        let handler: Arc<dyn JobHandler> = Arc::new(FnHandler::new(
            ["Job.Test"],
            |_: Value, _ctx: JobContext| async move {
                if true {
                    panic!("handler bug");
                }
                Ok(None)
            },
        ));

        let err = run_with_timeout(handler, context(Value::Null), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Panicked));
        assert!(err.is_retryable());
    }
}
