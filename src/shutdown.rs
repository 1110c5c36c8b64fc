use actix_web::dev::ServerHandle;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handles graceful shutdown of the application
///
/// Orchestrates shutdown by:
/// 1. Listening for shutdown signals (SIGTERM, SIGINT/CTRL+C)
/// 2. Stopping the HTTP server, when this process runs one
/// 3. Signaling workers to stop acquiring new jobs
/// 4. Waiting for workers to complete current jobs
/// 5. Closing database connections
pub struct ShutdownCoordinator {
    /// Server handle and task; absent in the worker-only role.
    server: Option<(ServerHandle, JoinHandle<Result<(), std::io::Error>>)>,
    worker_handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    pool: Pool<Postgres>,
}

impl ShutdownCoordinator {
    pub fn new(
        server: Option<(ServerHandle, JoinHandle<Result<(), std::io::Error>>)>,
        worker_handles: Vec<JoinHandle<()>>,
        shutdown_tx: watch::Sender<bool>,
        pool: Pool<Postgres>,
    ) -> Self {
        Self {
            server,
            worker_handles,
            shutdown_tx,
            pool,
        }
    }

    /// Block until CTRL+C or SIGTERM arrives, then shut everything down
    /// in order.
    pub async fn wait_for_shutdown(self) -> Result<(), std::io::Error> {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C signal handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received CTRL+C signal, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM signal, initiating graceful shutdown...");
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> Result<(), std::io::Error> {
        // 1. Stop accepting new HTTP requests.
        if let Some((handle, _)) = &self.server {
            info!("Stopping HTTP server (no longer accepting new requests)...");
            handle.stop(true).await;
        }

        // 2. Signal workers; they finish their current jobs.
        info!("Signaling workers to stop acquiring new jobs...");
        if let Err(err) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal to workers: {:?}", err);
        }

        // 3. Wait for the workers.
        let num_workers = self.worker_handles.len();
        if num_workers > 0 {
            info!("Waiting for {} worker task(s) to finish...", num_workers);
            for (i, handle) in self.worker_handles.into_iter().enumerate() {
                match handle.await {
                    Ok(()) => info!("Worker task {} stopped", i + 1),
                    Err(err) => error!("Worker task {} failed to stop: {:?}", i + 1, err),
                }
            }
        }

        // 4. Wait for the HTTP server task.
        if let Some((_, task)) = self.server {
            info!("Waiting for HTTP server to fully shut down...");
            match task.await {
                Ok(Ok(())) => info!("HTTP server shut down successfully"),
                Ok(Err(err)) => error!("HTTP server error during shutdown: {:?}", err),
                Err(err) => error!("HTTP server task panicked: {:?}", err),
            }
        }

        // 5. Close database connections.
        info!("Closing database connection pool...");
        self.pool.close().await;

        info!("Graceful shutdown completed");
        Ok(())
    }
}
