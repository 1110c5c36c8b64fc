use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::jobs::model::{JobPayload, NewJob};
use crate::jobs::store::{JobStore, StoreError};
use crate::jobs::tasks::{NoProgress, TaskError, TaskOutcome, TaskRunner};

/// How a submission was executed
#[derive(Debug)]
pub enum Dispatch {
    /// Job queued; the caller polls the status endpoint with this id.
    Queued { job_id: String },

    /// Queue disabled or unavailable; the task ran inline and this is its
    /// result.
    Inline { result: TaskOutcome },
}

/// Dispatch errors. Queue trouble never shows up here; it downgrades to
/// inline execution instead.
#[derive(Debug)]
pub enum DispatchError {
    /// The same dedup key is already queued (`DedupPolicy::Reject`).
    Duplicate(String),

    /// Inline execution failed.
    Task(TaskError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Duplicate(id) => write!(f, "job {} is already queued", id),
            DispatchError::Task(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Chooses, per submission, between queueing a job and executing inline.
///
/// The availability of the AI feature must never depend on queue health:
/// an unreachable backend or a failed enqueue silently falls back to the
/// inline path, whose own failures are the only errors the caller sees.
pub struct Dispatcher<S> {
    store: Arc<S>,
    runner: Arc<TaskRunner>,
    async_enabled: bool,
    max_attempts: u32,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        runner: Arc<TaskRunner>,
        async_enabled: bool,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            runner,
            async_enabled,
            max_attempts,
        }
    }

    pub async fn dispatch(
        &self,
        user_id: i64,
        payload: JobPayload,
    ) -> Result<Dispatch, DispatchError> {
        if self.async_enabled {
            // Probed fresh on every submission so a recovered backend is
            // picked up without a restart.
            match self.store.ping().await {
                Ok(()) => {
                    let new = NewJob::new(user_id, payload.clone(), self.max_attempts);
                    match self.store.enqueue(new).await {
                        Ok(job_id) => {
                            info!("Queued {} job {} for user {}", payload.kind(), job_id, user_id);
                            return Ok(Dispatch::Queued { job_id });
                        }
                        Err(StoreError::DuplicateJob(id)) => {
                            return Err(DispatchError::Duplicate(id));
                        }
                        Err(err) => {
                            warn!("Enqueue failed, executing inline: {}", err);
                        }
                    }
                }
                Err(err) => {
                    warn!("Job store unreachable, executing inline: {}", err);
                }
            }
        }

        let result = self
            .runner
            .run(user_id, &payload, &NoProgress)
            .await
            .map_err(DispatchError::Task)?;

        Ok(Dispatch::Inline { result })
    }
}
