use std::time::Duration;

use jobs_core::{JobContext, JobError, JobResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidates {
    pub job_posting_id: String,
    pub candidate_ids: Vec<String>,
}

impl MatchCandidates {
    pub async fn handler(args: Self, ctx: JobContext) -> JobResult {
        ctx.report(10, "Loading candidates").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        if args.candidate_ids.iter().any(|id| id.is_empty()) {
            return Err(JobError::with_code("ModelRejected", "blank candidate id"));
        }

        ctx.report(60, "Scoring").await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let scores: Vec<_> = args
            .candidate_ids
            .iter()
            .enumerate()
            .map(|(rank, id)| json!({ "candidateId": id, "rank": rank + 1 }))
            .collect();

        Ok(Some(json!({ "jobPostingId": args.job_posting_id, "matches": scores })))
    }
}
