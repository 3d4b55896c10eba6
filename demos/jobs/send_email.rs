use std::time::Duration;

use jobs_core::{JobContext, JobError, JobResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
pub struct SendEmail {
    pub recipients: Vec<String>,
    pub subject: String,
}

impl SendEmail {
    /// Handles every `Job.SendEmail.*` type: one recipient per step.
    pub async fn handler(args: Self, ctx: JobContext) -> JobResult {
        if args.recipients.is_empty() {
            return Err(JobError::fatal("NoRecipients", "recipient list is empty"));
        }

        let total = args.recipients.len();
        for (i, to) in args.recipients.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            tracing::info!(job_id = %ctx.id(), to = %to, subject = %args.subject, "Sending email");
            tokio::time::sleep(Duration::from_millis(200)).await;

            let percent = ((i + 1) * 100 / total) as u8;
            ctx.report(percent, format!("Sent {}/{}", i + 1, total)).await;
        }

        Ok(Some(json!({ "sent": total })))
    }
}
