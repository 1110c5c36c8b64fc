use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use tracing::error;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl HealthResponse {
    fn up(status: &str) -> Self {
        Self {
            status: status.to_string(),
            database: "connected".to_string(),
            error: None,
        }
    }

    fn down(status: &str, err: &sqlx::Error) -> Self {
        Self {
            status: status.to_string(),
            database: "disconnected".to_string(),
            error: Some(format!("Database error: {}", err)),
        }
    }
}

async fn db_probe(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").fetch_one(pool).await.map(|_| ())
}

/// General health check including database connectivity.
/// Use for load balancers and uptime monitors.
#[get("/health")]
async fn health_check(pool: web::Data<Pool<Postgres>>) -> impl Responder {
    match db_probe(pool.get_ref()).await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse::up("healthy")),
        Err(err) => {
            error!("Health check failed: {:?}", err);
            HttpResponse::ServiceUnavailable().json(HealthResponse::down("unhealthy", &err))
        }
    }
}

/// Readiness check: whether the service can accept traffic.
/// Use for Kubernetes readiness probes.
#[get("/ready")]
async fn readiness_check(pool: web::Data<Pool<Postgres>>) -> impl Responder {
    match db_probe(pool.get_ref()).await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse::up("ready")),
        Err(err) => {
            error!("Readiness check failed: {:?}", err);
            HttpResponse::ServiceUnavailable().json(HealthResponse::down("not_ready", &err))
        }
    }
}

/// Liveness check: the process is alive, dependencies not checked.
/// Use for Kubernetes liveness probes.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive".to_string(),
        database: "not_checked".to_string(),
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}
