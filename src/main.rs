use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use clap::{Parser, Subcommand};
use tokio::sync::{Semaphore, watch};
use tracing::info;
use tracing_subscriber::{
    Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

mod api;
mod config;
mod db;
mod jobs;
mod llm;
mod shutdown;

use crate::api::{ai::AiService, ai::handlers::ai_config, health::health_config, validation};
use crate::db::entries::PgEntryStore;
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::store::PgJobStore;
use crate::jobs::tasks::TaskRunner;
use crate::jobs::worker::JobWorker;
use crate::llm::client::{CallRetry, OpenAiClient, WORKER_CALL_RETRY};
use crate::shutdown::ShutdownCoordinator;

#[derive(Parser)]
#[command(name = "vitalog", about = "Health-tracking backend with AI jobs")]
struct Cli {
    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand)]
enum Role {
    /// Run the HTTP API only
    Serve,
    /// Run the background job worker only
    Worker,
}

/// Initialize file-based logging with daily rotation and level separation
///
/// Log files are created as: logs/info.2024-12-22.log, logs/error.2024-12-22.log, etc.
fn init_logging(log_dir: &str) {
    std::fs::create_dir_all(log_dir).expect("Failed to create logs directory");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let info_file = tracing_appender::rolling::daily(log_dir, "info.log");
    let warn_file = tracing_appender::rolling::daily(log_dir, "warn.log");
    let error_file = tracing_appender::rolling::daily(log_dir, "error.log");
    let debug_file = tracing_appender::rolling::daily(log_dir, "debug.log");

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(info_file)
        .with_ansi(false)
        .with_filter(LevelFilter::INFO);

    let warn_layer = tracing_subscriber::fmt::layer()
        .with_writer(warn_file)
        .with_ansi(false)
        .with_filter(LevelFilter::WARN);

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_file)
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let debug_layer = tracing_subscriber::fmt::layer()
        .with_writer(debug_file)
        .with_ansi(false)
        .with_filter(LevelFilter::DEBUG);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(info_layer)
        .with(warn_layer)
        .with(error_layer)
        .with(debug_layer)
        .init();
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = config::Config::from_env().expect("Failed to load configuration");

    init_logging(&config.log_dir);

    info!("Starting vitalog application");
    info!("Configuration loaded successfully:");
    info!("  - Async jobs enabled: {}", config.queue.async_enabled);
    info!("  - Worker concurrency: {}", config.worker.concurrency);
    info!("  - Job retry budget: {} attempts", config.queue.max_attempts);
    info!("  - Max database connections: {}", config.max_db_connections);

    // Get database connection pool
    let pool = db::connection::get_connection(&config.database_url, config.max_db_connections)
        .await
        .expect("Failed to connect to database");

    info!("Database connection pool established");

    // Run migrations on startup
    db::migrations::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");

    // Collaborators shared by the dispatcher and the worker
    let store = Arc::new(PgJobStore::new(pool.clone(), config.queue.dedup));
    let entries = Arc::new(PgEntryStore::new(pool.clone()));
    let chat_api = Arc::new(OpenAiClient::new(&config.llm));

    let run_server = !matches!(cli.role, Some(Role::Worker));
    let run_worker = !matches!(cli.role, Some(Role::Serve));

    // Shutdown channel; watch lets every long-lived task see the flag.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handles = Vec::new();
    if run_worker {
        let runner = Arc::new(TaskRunner::new(
            chat_api.clone(),
            entries.clone(),
            WORKER_CALL_RETRY,
        ));
        let worker = JobWorker::new(
            store.clone(),
            runner,
            config.queue,
            config.worker.poll_interval,
        );
        let semaphore = Arc::new(Semaphore::new(config.worker.concurrency));

        let drain = worker.clone();
        let drain_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            drain.run(1, semaphore, drain_rx).await;
        }));

        let cleaner = worker.clone();
        let cleaner_rx = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            cleaner.run_cleanup(cleaner_rx).await;
        }));

        info!(
            "Spawned job worker (concurrency {})",
            config.worker.concurrency
        );
    }

    let server = if run_server {
        // The inline path makes a single LLM attempt so request latency
        // stays bounded; the worker path owns the retries.
        let inline_runner = Arc::new(TaskRunner::new(
            chat_api.clone(),
            entries.clone(),
            CallRetry::none(),
        ));
        let dispatcher = Dispatcher::new(
            store.clone(),
            inline_runner,
            config.queue.async_enabled,
            config.queue.max_attempts,
        );
        let ai_service = web::Data::new(AiService::new(dispatcher, store.clone()));

        let server_pool = pool.clone();
        let max_payload_size = config.max_payload_size;

        let server = HttpServer::new(move || {
            let payload_config = web::PayloadConfig::default().limit(max_payload_size);

            App::new()
                .app_data(web::Data::new(server_pool.clone())) // Share DB pool across workers
                .app_data(ai_service.clone())
                .app_data(payload_config) // Global payload size limit
                .app_data(validation::json_config()) // Global validation config
                .configure(health_config)
                .configure(ai_config)
        })
        .bind(&config.bind_addr)?
        .run();

        info!("Server starting on http://{}", config.bind_addr);

        let handle = server.handle();
        Some((handle, tokio::spawn(server)))
    } else {
        None
    };

    // Wait for shutdown signal, then stop server, workers and pool in order.
    let coordinator = ShutdownCoordinator::new(server, worker_handles, shutdown_tx, pool);

    coordinator.wait_for_shutdown().await
}
