use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of AI work a job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Chat,
    WeeklyReport,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Chat => "chat",
            JobKind::WeeklyReport => "weekly_report",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(JobKind::Chat),
            "weekly_report" => Ok(JobKind::WeeklyReport),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Lifecycle state of a job
///
/// `waiting -> active -> {completed | failed}`; an expired lease moves a
/// job back from `active` to `waiting` until its stall budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Task-specific input, stored as the job's payload column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Chat { message: String },
    WeeklyReport,
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Chat { .. } => JobKind::Chat,
            JobPayload::WeeklyReport => JobKind::WeeklyReport,
        }
    }
}

/// A job as seen by the worker and the status endpoint
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub user_id: i64,
    pub payload: JobPayload,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Submission handed to `JobStore::enqueue`
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: i64,
    pub payload: JobPayload,
    pub max_attempts: u32,
    /// Explicit id for deduplication; derived from the submission when absent.
    pub id_override: Option<String>,
}

impl NewJob {
    pub fn new(user_id: i64, payload: JobPayload, max_attempts: u32) -> Self {
        Self {
            user_id,
            payload,
            max_attempts,
            id_override: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id_override = Some(id.into());
        self
    }

    /// The id this submission enqueues under. Doubles as the dedup key:
    /// two submissions deriving the same id are one logical unit of work.
    pub fn job_id(&self, created_at: DateTime<Utc>) -> String {
        match &self.id_override {
            Some(id) => id.clone(),
            None => derive_job_id(self.payload.kind(), self.user_id, created_at),
        }
    }
}

/// Deterministic job id: task kind, owning user and creation time.
pub fn derive_job_id(kind: JobKind, user_id: i64, created_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        kind.as_str(),
        user_id,
        created_at.timestamp_millis()
    )
}

/// Behaviour on enqueue when the job id already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Return the existing job's id; the duplicate collapses into it.
    Reuse,
    /// Refuse the enqueue.
    Reject,
}

impl FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reuse" => Ok(DedupPolicy::Reuse),
            "reject" => Ok(DedupPolicy::Reject),
            other => Err(format!("unknown dedup policy: {}", other)),
        }
    }
}

/// Per-job retry budget and re-delivery spacing
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` executions.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Re-delivery delay after the given failed attempt (1-based):
    /// `backoff_base * 2^(attempt - 1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn retry_budget_is_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(policy.can_retry(1));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
        assert!(!policy.can_retry(4));
    }

    #[test]
    fn job_id_embeds_kind_user_and_millis() {
        let created = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let id = derive_job_id(JobKind::WeeklyReport, 42, created);

        assert_eq!(
            id,
            format!("weekly_report-42-{}", created.timestamp_millis())
        );
    }

    #[test]
    fn id_override_wins_over_derivation() {
        let new = NewJob::new(7, JobPayload::WeeklyReport, 3).with_id("weekly_report-7-0");

        assert_eq!(new.job_id(Utc::now()), "weekly_report-7-0");
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let chat = serde_json::to_value(JobPayload::Chat {
            message: "hi".into(),
        })
        .unwrap();
        assert_eq!(chat, serde_json::json!({"kind": "chat", "message": "hi"}));

        let report = serde_json::to_value(JobPayload::WeeklyReport).unwrap();
        assert_eq!(report, serde_json::json!({"kind": "weekly_report"}));
    }

    #[test]
    fn state_round_trips_through_db_strings() {
        for state in [
            JobState::Waiting,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }
}
