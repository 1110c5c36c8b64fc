use std::fmt;
use std::sync::Arc;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use tracing::{error, warn};

use super::dto::{JobStatusResponse, SubmitResponse};
use crate::api::validation::ErrorResponse;
use crate::jobs::dispatcher::{Dispatch, DispatchError, Dispatcher};
use crate::jobs::model::JobPayload;
use crate::jobs::store::{JobStore, StoreError};
use crate::jobs::tasks::TaskError;

/// Service-level errors
#[derive(Debug)]
pub enum ServiceError {
    /// Missing or unusable caller identity
    Unauthorized(String),

    /// The same submission is already queued
    DuplicateJob(String),

    /// Inline execution failed against the AI endpoint
    Upstream(TaskError),

    /// Job store lookup failed
    Store(StoreError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            ServiceError::DuplicateJob(id) => write!(f, "job {} is already queued", id),
            ServiceError::Upstream(err) => write!(f, "{}", err),
            ServiceError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::DuplicateJob(_) => StatusCode::CONFLICT,
            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            ServiceError::Unauthorized(msg) => {
                warn!("Unauthorized AI request: {}", msg);
                HttpResponse::Unauthorized()
                    .json(ErrorResponse::new("Unauthorized", msg.clone()))
            }
            ServiceError::DuplicateJob(id) => {
                warn!("Duplicate AI submission: {}", id);
                HttpResponse::Conflict().json(ErrorResponse::new(
                    "Duplicate submission",
                    format!("Job {} is already queued", id),
                ))
            }
            ServiceError::Upstream(err) => {
                error!("Inline AI execution failed: {}", err);
                HttpResponse::BadGateway().json(ErrorResponse::new(
                    "AI request failed",
                    "The AI service could not process the request",
                ))
            }
            ServiceError::Store(err) => {
                error!("Job store error: {}", err);
                HttpResponse::InternalServerError().json(ErrorResponse::new(
                    "Failed to process request",
                    "Job store error occurred",
                ))
            }
        }
    }
}

/// AI feature service: submissions go through the dispatcher, status
/// polls read the job store directly.
pub struct AiService<S> {
    dispatcher: Dispatcher<S>,
    store: Arc<S>,
}

impl<S: JobStore> AiService<S> {
    pub fn new(dispatcher: Dispatcher<S>, store: Arc<S>) -> Self {
        Self { dispatcher, store }
    }

    pub async fn submit(
        &self,
        user_id: i64,
        payload: JobPayload,
    ) -> Result<SubmitResponse, ServiceError> {
        match self.dispatcher.dispatch(user_id, payload).await {
            Ok(Dispatch::Queued { job_id }) => Ok(SubmitResponse::Async {
                check_status_url: format!("/ai/jobs/{}", job_id),
                job_id,
            }),
            Ok(Dispatch::Inline { result }) => Ok(SubmitResponse::Sync {
                result: result.to_json(),
            }),
            Err(DispatchError::Duplicate(id)) => Err(ServiceError::DuplicateJob(id)),
            Err(DispatchError::Task(err)) => Err(ServiceError::Upstream(err)),
        }
    }

    /// Status for a job id; `None` means unknown or already cleaned up.
    pub async fn status(&self, job_id: &str) -> Result<Option<JobStatusResponse>, ServiceError> {
        let job = self.store.get(job_id).await.map_err(ServiceError::Store)?;
        Ok(job.map(JobStatusResponse::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobState;
    use crate::jobs::tasks::TaskRunner;
    use crate::jobs::testing::{FixedEntries, InMemoryJobStore, ScriptedChat};
    use crate::llm::client::{CallRetry, LlmError};

    fn service(store: Arc<InMemoryJobStore>, chat: Arc<ScriptedChat>) -> AiService<InMemoryJobStore> {
        let runner = Arc::new(TaskRunner::new(
            chat,
            Arc::new(FixedEntries::empty()),
            CallRetry::none(),
        ));
        AiService::new(Dispatcher::new(store.clone(), runner, true, 3), store)
    }

    fn chat_payload() -> JobPayload {
        JobPayload::Chat {
            message: "hi".into(),
        }
    }

    #[tokio::test]
    async fn submission_links_to_the_status_endpoint() {
        let store = Arc::new(InMemoryJobStore::new());
        let service = service(store, Arc::new(ScriptedChat::always("unused")));

        let response = service.submit(7, chat_payload()).await.unwrap();

        match response {
            SubmitResponse::Async {
                job_id,
                check_status_url,
            } => assert_eq!(check_status_url, format!("/ai/jobs/{}", job_id)),
            other => panic!("expected async submission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_of_a_queued_job_is_waiting() {
        let store = Arc::new(InMemoryJobStore::new());
        let service = service(store.clone(), Arc::new(ScriptedChat::always("unused")));

        let id = store
            .enqueue_with_id("chat-7-0", 7, chat_payload())
            .await
            .unwrap();

        let status = service.status(&id).await.unwrap().unwrap();
        assert_eq!(status.status, JobState::Waiting);
        assert_eq!(status.progress, 0);
        assert_eq!(status.attempts, 0);
        assert_eq!(status.data.user_id, 7);
    }

    #[tokio::test]
    async fn unknown_job_id_is_none_not_an_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let service = service(store, Arc::new(ScriptedChat::always("unused")));

        assert!(service.status("chat-1-12345").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inline_upstream_failure_maps_to_bad_gateway() {
        let store = Arc::new(InMemoryJobStore::new());
        store.set_reachable(false);
        let service = service(store, Arc::new(ScriptedChat::failing_with_status(500)));

        let err = service.submit(7, chat_payload()).await.unwrap_err();

        assert!(matches!(err, ServiceError::Upstream(_)));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn sync_mode_result_comes_back_in_the_submission() {
        let store = Arc::new(InMemoryJobStore::new());
        store.set_reachable(false);
        let service = service(store, Arc::new(ScriptedChat::always("inline reply")));

        let response = service.submit(7, chat_payload()).await.unwrap();

        match response {
            SubmitResponse::Sync { result } => assert_eq!(result["reply"], "inline reply"),
            other => panic!("expected sync submission, got {:?}", other),
        }
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(
            ServiceError::Unauthorized("no header".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::DuplicateJob("chat-1-0".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::Upstream(TaskError::Llm(LlmError::Timeout)).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::Store(StoreError::Database(sqlx::Error::PoolClosed)).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
