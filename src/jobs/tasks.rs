use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::entries::EntryStore;
use crate::db::models::HealthEntryRow;
use crate::jobs::model::JobPayload;
use crate::llm::client::{CallRetry, ChatApi, ChatMessage, LlmError, complete_with_retry};

/// System persona for the chat task
const CHAT_PERSONA: &str = "You are a supportive health and wellness assistant for a daily \
health-tracking app. Keep answers brief and practical. You are not a medical professional; \
recommend seeing a doctor for anything clinical.";

const REPORT_PERSONA: &str = "You are a health coach writing a short weekly summary for a \
health-tracking app user, based only on the data they logged.";

const CHAT_TEMPERATURE: f32 = 0.7;
const REPORT_TEMPERATURE: f32 = 0.4;

/// Longest user message forwarded upstream, in characters
const MAX_MESSAGE_CHARS: usize = 2000;

/// Food-intake lines included in the report prompt
const MAX_FOOD_LINES: usize = 20;

/// Where milestone progress goes during task execution. The worker plugs
/// in a store-backed sink; the inline path has nobody polling and uses
/// `NoProgress`.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn set(&self, progress: u8);
}

pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn set(&self, _progress: u8) {}
}

/// Task execution errors
#[derive(Debug)]
pub enum TaskError {
    /// The external LLM call failed (after its own internal retries)
    Llm(LlmError),

    /// Reading health entries failed
    Entries(sqlx::Error),
}

impl TaskError {
    /// Whether requeueing the job could help. Entry-store failures are
    /// backend round-trip problems and count as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Llm(err) => err.is_transient(),
            TaskError::Entries(_) => true,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Llm(err) => write!(f, "{}", err),
            TaskError::Entries(err) => write!(f, "failed to read health entries: {}", err),
        }
    }
}

impl std::error::Error for TaskError {}

/// Output of the chat task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub reply: String,
}

/// Numeric aggregates attached to a generated report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklySummary {
    pub entry_count: u32,
    pub total_calories: i64,
    pub avg_calories: i64,
    pub avg_sleep: f64,
    pub workout_days: u32,
}

/// Output of the weekly-report task
///
/// `success: false` is a completed job whose window held no entries, not
/// a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<WeeklySummary>,
}

impl ReportOutcome {
    fn no_data() -> Self {
        Self {
            success: false,
            message: Some(
                "No health entries were logged in the last 7 days, so there is nothing to \
                 report yet."
                    .to_string(),
            ),
            report: None,
            summary: None,
        }
    }
}

/// Result payload of any task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskOutcome {
    Chat(ChatOutcome),
    WeeklyReport(ReportOutcome),
}

impl TaskOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Executes tasks against the external collaborators. Shared by the
/// worker (with LLM-call retries) and the dispatcher's inline path
/// (single attempt).
pub struct TaskRunner {
    chat_api: Arc<dyn ChatApi>,
    entries: Arc<dyn EntryStore>,
    llm_retry: CallRetry,
}

impl TaskRunner {
    pub fn new(chat_api: Arc<dyn ChatApi>, entries: Arc<dyn EntryStore>, llm_retry: CallRetry) -> Self {
        Self {
            chat_api,
            entries,
            llm_retry,
        }
    }

    /// Execute a task to its result payload. Milestone progress goes to
    /// `progress`; terminal state transitions belong to the caller.
    pub async fn run(
        &self,
        user_id: i64,
        payload: &JobPayload,
        progress: &dyn ProgressSink,
    ) -> Result<TaskOutcome, TaskError> {
        match payload {
            JobPayload::Chat { message } => {
                self.run_chat(message, progress).await.map(TaskOutcome::Chat)
            }
            JobPayload::WeeklyReport => self
                .run_weekly_report(user_id, progress)
                .await
                .map(TaskOutcome::WeeklyReport),
        }
    }

    async fn run_chat(
        &self,
        message: &str,
        progress: &dyn ProgressSink,
    ) -> Result<ChatOutcome, TaskError> {
        progress.set(10).await;

        let messages = chat_messages(message);
        let reply = complete_with_retry(
            self.chat_api.as_ref(),
            &messages,
            CHAT_TEMPERATURE,
            self.llm_retry,
        )
        .await
        .map_err(TaskError::Llm)?;

        progress.set(60).await;
        Ok(ChatOutcome { reply })
    }

    async fn run_weekly_report(
        &self,
        user_id: i64,
        progress: &dyn ProgressSink,
    ) -> Result<ReportOutcome, TaskError> {
        progress.set(10).await;

        let since = report_window_start(Local::now().date_naive());
        let entries = self
            .entries
            .entries_since(user_id, since)
            .await
            .map_err(TaskError::Entries)?;
        progress.set(25).await;

        if entries.is_empty() {
            info!("No entries in report window for user {}", user_id);
            return Ok(ReportOutcome::no_data());
        }

        let aggregate = aggregate_entries(&entries);
        progress.set(30).await;

        let messages = report_messages(&aggregate);
        let report = complete_with_retry(
            self.chat_api.as_ref(),
            &messages,
            REPORT_TEMPERATURE,
            self.llm_retry,
        )
        .await
        .map_err(TaskError::Llm)?;
        progress.set(60).await;

        Ok(ReportOutcome {
            success: true,
            message: None,
            report: Some(report),
            summary: Some(aggregate.summary),
        })
    }
}

/// First day of the report window: today and the six days before it.
pub(crate) fn report_window_start(today: NaiveDate) -> NaiveDate {
    today - ChronoDuration::days(6)
}

pub(crate) fn chat_messages(message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(CHAT_PERSONA),
        ChatMessage::user(sanitize_message(message)),
    ]
}

/// Trim, drop control characters (newlines survive) and cap the length
/// before the text goes into a prompt.
fn sanitize_message(message: &str) -> String {
    message
        .trim()
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .take(MAX_MESSAGE_CHARS)
        .collect()
}

pub(crate) struct WeeklyAggregate {
    pub summary: WeeklySummary,
    pub food_lines: Vec<String>,
}

pub(crate) fn aggregate_entries(entries: &[HealthEntryRow]) -> WeeklyAggregate {
    let entry_count = entries.len();
    let total_calories: i64 = entries.iter().map(|e| e.calories as i64).sum();
    let total_sleep: f64 = entries.iter().map(|e| e.sleep_hours).sum();
    let workout_days = entries
        .iter()
        .filter(|e| e.workout.as_deref().is_some_and(|w| !w.trim().is_empty()))
        .count() as u32;

    let avg_calories = (total_calories as f64 / entry_count as f64).round() as i64;
    let avg_sleep = round_tenth(total_sleep / entry_count as f64);

    let food_lines: Vec<String> = entries
        .iter()
        .filter_map(|e| e.food_intake.as_deref())
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_FOOD_LINES)
        .map(str::to_string)
        .collect();

    WeeklyAggregate {
        summary: WeeklySummary {
            entry_count: entry_count as u32,
            total_calories,
            avg_calories,
            avg_sleep,
            workout_days,
        },
        food_lines,
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn report_messages(aggregate: &WeeklyAggregate) -> Vec<ChatMessage> {
    let summary = &aggregate.summary;
    let mut prompt = format!(
        "Write a weekly health report of 150-200 words with exactly three sections titled \
         \"Summary\", \"Insights\" and \"Recommendations\".\n\n\
         Data for the last 7 days:\n\
         - Days logged: {}\n\
         - Total calories: {} (average {} per day)\n\
         - Average sleep: {:.1} hours per night\n\
         - Workout days: {}\n",
        summary.entry_count,
        summary.total_calories,
        summary.avg_calories,
        summary.avg_sleep,
        summary.workout_days,
    );

    if !aggregate.food_lines.is_empty() {
        prompt.push_str("- Food logged:\n");
        for line in &aggregate.food_lines {
            prompt.push_str("  - ");
            prompt.push_str(line);
            prompt.push('\n');
        }
    }

    vec![
        ChatMessage::system(REPORT_PERSONA),
        ChatMessage::user(prompt),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{FixedEntries, ScriptedChat, entry};
    use crate::llm::client::WORKER_CALL_RETRY;

    fn runner(chat: Arc<ScriptedChat>, entries: Arc<FixedEntries>) -> TaskRunner {
        TaskRunner::new(chat, entries, WORKER_CALL_RETRY)
    }

    #[test]
    fn aggregation_matches_known_vector() {
        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, Some("run"), None),
            entry(1, "2025-03-02", 1800, 8.0, None, None),
            entry(1, "2025-03-03", 2200, 6.0, Some("gym"), None),
        ];

        let aggregate = aggregate_entries(&entries);
        let summary = aggregate.summary;

        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.total_calories, 6000);
        assert_eq!(summary.avg_calories, 2000);
        assert_eq!(summary.avg_sleep, 7.0);
        assert_eq!(summary.workout_days, 2);
    }

    #[test]
    fn average_sleep_keeps_one_decimal() {
        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, None, None),
            entry(1, "2025-03-02", 2000, 6.5, None, None),
            entry(1, "2025-03-03", 2000, 6.0, None, None),
        ];

        // 19.5 / 3 = 6.5
        assert_eq!(aggregate_entries(&entries).summary.avg_sleep, 6.5);

        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, None, None),
            entry(1, "2025-03-02", 2000, 7.0, None, None),
            entry(1, "2025-03-03", 2000, 6.0, None, None),
        ];

        // 20 / 3 = 6.666... -> 6.7
        assert_eq!(aggregate_entries(&entries).summary.avg_sleep, 6.7);
    }

    #[test]
    fn blank_workout_text_does_not_count_as_a_workout_day() {
        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, Some("  "), None),
            entry(1, "2025-03-02", 2000, 7.0, Some("yoga"), None),
        ];

        assert_eq!(aggregate_entries(&entries).summary.workout_days, 1);
    }

    #[test]
    fn food_lines_are_flattened_and_capped() {
        let food_a = (0..15).map(|i| format!("meal {i}")).collect::<Vec<_>>().join("\n");
        let food_b = (15..30).map(|i| format!("meal {i}")).collect::<Vec<_>>().join("\n");
        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, None, Some(&food_a)),
            entry(1, "2025-03-02", 2000, 7.0, None, Some(&food_b)),
        ];

        let aggregate = aggregate_entries(&entries);

        assert_eq!(aggregate.food_lines.len(), MAX_FOOD_LINES);
        assert_eq!(aggregate.food_lines[0], "meal 0");
        assert_eq!(aggregate.food_lines[19], "meal 19");
    }

    #[test]
    fn window_covers_today_and_six_days_back() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();

        assert_eq!(
            report_window_start(today),
            NaiveDate::from_ymd_opt(2025, 3, 4).unwrap()
        );
    }

    #[test]
    fn chat_prompt_is_persona_plus_sanitized_message() {
        let messages = chat_messages("  how much water\u{7} should I drink?  ");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "how much water should I drink?");
    }

    #[test]
    fn oversized_messages_are_truncated() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 500);

        let messages = chat_messages(&long);

        assert_eq!(messages[1].content.chars().count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn report_prompt_names_sections_and_figures() {
        let entries = vec![
            entry(1, "2025-03-01", 2000, 7.0, Some("run"), Some("oats\neggs")),
            entry(1, "2025-03-02", 1800, 8.0, None, None),
        ];
        let aggregate = aggregate_entries(&entries);

        let messages = report_messages(&aggregate);
        let prompt = &messages[1].content;

        assert!(prompt.contains("\"Summary\""));
        assert!(prompt.contains("\"Insights\""));
        assert!(prompt.contains("\"Recommendations\""));
        assert!(prompt.contains("150-200 words"));
        assert!(prompt.contains("Total calories: 3800"));
        assert!(prompt.contains("Average sleep: 7.5"));
        assert!(prompt.contains("oats"));
    }

    #[tokio::test]
    async fn zero_data_window_completes_without_calling_the_llm() {
        let chat = Arc::new(ScriptedChat::always("should not be used"));
        let entries = Arc::new(FixedEntries::empty());
        let runner = runner(chat.clone(), entries);

        let outcome = runner
            .run(1, &JobPayload::WeeklyReport, &NoProgress)
            .await
            .unwrap();

        match outcome {
            TaskOutcome::WeeklyReport(report) => {
                assert!(!report.success);
                assert!(report.message.is_some());
                assert!(report.report.is_none());
                assert!(report.summary.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn chat_task_maps_reply() {
        let chat = Arc::new(ScriptedChat::always("drink plenty of water"));
        let entries = Arc::new(FixedEntries::empty());
        let runner = runner(chat.clone(), entries);

        let outcome = runner
            .run(
                1,
                &JobPayload::Chat {
                    message: "hydration?".into(),
                },
                &NoProgress,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Chat(ChatOutcome {
                reply: "drink plenty of water".into()
            })
        );
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn report_task_attaches_summary_and_report() {
        let chat = Arc::new(ScriptedChat::always("Summary...\nInsights...\nRecommendations..."));
        let today = Local::now().date_naive();
        let entries = Arc::new(FixedEntries::new(vec![
            entry(1, &today.to_string(), 2000, 7.0, Some("run"), None),
        ]));
        let runner = runner(chat.clone(), entries);

        let outcome = runner
            .run(1, &JobPayload::WeeklyReport, &NoProgress)
            .await
            .unwrap();

        match outcome {
            TaskOutcome::WeeklyReport(report) => {
                assert!(report.success);
                assert!(report.report.is_some());
                let summary = report.summary.unwrap();
                assert_eq!(summary.entry_count, 1);
                assert_eq!(summary.avg_calories, 2000);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(chat.calls(), 1);
    }

    #[tokio::test]
    async fn entry_store_failure_is_transient() {
        let chat = Arc::new(ScriptedChat::always("unused"));
        let entries = Arc::new(FixedEntries::failing());
        let runner = runner(chat, entries);

        let err = runner
            .run(1, &JobPayload::WeeklyReport, &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Entries(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn outcome_json_shapes() {
        let chat = TaskOutcome::Chat(ChatOutcome { reply: "ok".into() });
        assert_eq!(chat.to_json(), serde_json::json!({"reply": "ok"}));

        let empty = TaskOutcome::WeeklyReport(ReportOutcome::no_data());
        let json = empty.to_json();
        assert_eq!(json["success"], serde_json::json!(false));
        assert!(json.get("report").is_none());
    }
}
