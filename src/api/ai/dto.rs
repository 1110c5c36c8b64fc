use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::jobs::model::{Job, JobKind, JobState};

/// Chat submission body
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(
        min = 1,
        max = 2000,
        message = "Message must be between 1 and 2000 characters"
    ))]
    pub message: String,
}

/// Submission result, tagged by execution mode
#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SubmitResponse {
    /// Queued; poll `check_status_url` for the outcome.
    Async {
        job_id: String,
        check_status_url: String,
    },
    /// Executed inline; the outcome is already here.
    Sync { result: serde_json::Value },
}

/// Status payload for a known job
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub status: JobState,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub data: JobMeta,
}

#[derive(Debug, Serialize)]
pub struct JobMeta {
    pub user_id: i64,
    #[serde(rename = "type")]
    pub kind: JobKind,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            status: job.state,
            progress: job.progress,
            attempts: job.attempts,
            result: job.result,
            failure_reason: job.failure_reason,
            data: JobMeta {
                user_id: job.user_id,
                kind: job.kind,
            },
        }
    }
}

/// Distinguished status for unknown or expired job ids. A normal polling
/// outcome, not an error: the caller should stop checking back.
#[derive(Debug, Serialize)]
pub struct NotFoundResponse {
    pub status: &'static str,
}

impl NotFoundResponse {
    pub fn new() -> Self {
        Self {
            status: "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::jobs::model::JobPayload;

    #[test]
    fn async_submission_is_tagged_with_mode() {
        let response = SubmitResponse::Async {
            job_id: "chat-1-0".into(),
            check_status_url: "/ai/jobs/chat-1-0".into(),
        };

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "mode": "async",
                "job_id": "chat-1-0",
                "check_status_url": "/ai/jobs/chat-1-0",
            })
        );
    }

    #[test]
    fn sync_submission_carries_the_result() {
        let response = SubmitResponse::Sync {
            result: serde_json::json!({"reply": "hi"}),
        };

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"mode": "sync", "result": {"reply": "hi"}})
        );
    }

    #[test]
    fn status_response_mirrors_the_job() {
        let job = Job {
            id: "chat-7-0".into(),
            kind: JobKind::Chat,
            user_id: 7,
            payload: JobPayload::Chat {
                message: "hi".into(),
            },
            state: JobState::Completed,
            progress: 100,
            attempts: 2,
            max_attempts: 3,
            stalled_count: 0,
            result: Some(serde_json::json!({"reply": "hello"})),
            failure_reason: None,
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(JobStatusResponse::from(job)).unwrap();

        assert_eq!(value["status"], "completed");
        assert_eq!(value["progress"], 100);
        assert_eq!(value["attempts"], 2);
        assert_eq!(value["result"]["reply"], "hello");
        assert_eq!(value["data"]["user_id"], 7);
        assert_eq!(value["data"]["type"], "chat");
        assert!(value.get("failure_reason").is_none());
    }

    #[test]
    fn not_found_is_a_status_not_an_error() {
        assert_eq!(
            serde_json::to_value(NotFoundResponse::new()).unwrap(),
            serde_json::json!({"status": "not_found"})
        );
    }
}
