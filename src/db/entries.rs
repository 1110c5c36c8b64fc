use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::db::models::HealthEntryRow;

/// Read side of the daily-entry records, consumed by the weekly-report
/// task. Entry CRUD lives with the rest of the request plumbing; the job
/// subsystem only ever queries a date range.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// All entries for a user dated `from` or later, ascending by date.
    async fn entries_since(
        &self,
        user_id: i64,
        from: NaiveDate,
    ) -> Result<Vec<HealthEntryRow>, sqlx::Error>;
}

/// Postgres-backed entry reader
pub struct PgEntryStore {
    pool: Pool<Postgres>,
}

impl PgEntryStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn entries_since(
        &self,
        user_id: i64,
        from: NaiveDate,
    ) -> Result<Vec<HealthEntryRow>, sqlx::Error> {
        debug!("Fetching entries for user {} since {}", user_id, from);

        sqlx::query_as::<_, HealthEntryRow>(
            r#"
            SELECT id, user_id, entry_date, calories, sleep_hours, workout, food_intake,
                   created_at, updated_at
            FROM health_entries
            WHERE user_id = $1 AND entry_date >= $2
            ORDER BY entry_date ASC
            "#,
        )
        .bind(user_id)
        .bind(from)
        .fetch_all(&self.pool)
        .await
    }
}
