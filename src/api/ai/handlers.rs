use std::future::{Ready, ready};

use actix_web::{
    FromRequest, HttpRequest, HttpResponse, dev::Payload, get, post,
    web::{Data, Path, ServiceConfig, scope},
};
use actix_web_validator::Json;

use super::dto::{ChatRequest, NotFoundResponse, SubmitResponse};
use super::service::{AiService, ServiceError};
use crate::jobs::model::JobPayload;
use crate::jobs::store::PgJobStore;

/// Caller identity, injected as `X-User-Id` by the upstream auth layer.
/// Requests that arrive without it never passed authentication.
pub struct UserId(pub i64);

impl FromRequest for UserId {
    type Error = ServiceError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.headers()
                .get("X-User-Id")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok())
                .map(UserId)
                .ok_or_else(|| {
                    ServiceError::Unauthorized("missing or invalid X-User-Id header".to_string())
                }),
        )
    }
}

fn submit_response(response: SubmitResponse) -> HttpResponse {
    match &response {
        SubmitResponse::Async { .. } => HttpResponse::Accepted().json(&response),
        SubmitResponse::Sync { .. } => HttpResponse::Ok().json(&response),
    }
}

/// Submit a chat message to the AI assistant
#[post("/chat")]
async fn submit_chat(
    service: Data<AiService<PgJobStore>>,
    user: UserId,
    body: Json<ChatRequest>,
) -> Result<HttpResponse, ServiceError> {
    let response = service
        .submit(
            user.0,
            JobPayload::Chat {
                message: body.into_inner().message,
            },
        )
        .await?;

    Ok(submit_response(response))
}

/// Generate a report over the caller's last week of entries
#[post("/weekly-report")]
async fn submit_weekly_report(
    service: Data<AiService<PgJobStore>>,
    user: UserId,
) -> Result<HttpResponse, ServiceError> {
    let response = service.submit(user.0, JobPayload::WeeklyReport).await?;

    Ok(submit_response(response))
}

/// Poll a queued job. Unknown ids answer with a `not_found` status so
/// clients know to stop polling.
#[get("/jobs/{job_id}")]
async fn job_status(
    service: Data<AiService<PgJobStore>>,
    path: Path<String>,
) -> Result<HttpResponse, ServiceError> {
    match service.status(&path).await? {
        Some(status) => Ok(HttpResponse::Ok().json(status)),
        None => Ok(HttpResponse::Ok().json(NotFoundResponse::new())),
    }
}

pub fn ai_config(config: &mut ServiceConfig) {
    config.service(
        scope("/ai")
            .service(submit_chat)
            .service(submit_weekly_report)
            .service(job_status),
    );
}
