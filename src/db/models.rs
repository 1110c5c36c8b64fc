use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Database representation of an AI job with all fields
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub user_id: i64,
    pub payload: serde_json::Value,
    pub state: String,
    pub progress: i16,
    pub attempts: i32,
    pub max_attempts: i32,
    pub stalled_count: i32,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub available_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One daily health-tracking entry as stored
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct HealthEntryRow {
    pub id: i64,
    pub user_id: i64,
    pub entry_date: NaiveDate,
    pub calories: i32,
    pub sleep_hours: f64,
    pub workout: Option<String>,
    pub food_intake: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
