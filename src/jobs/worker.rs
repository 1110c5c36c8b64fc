use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::jobs::model::{Job, RetryPolicy};
use crate::jobs::store::{JobStore, StoreError};
use crate::jobs::tasks::{ProgressSink, TaskError, TaskRunner};

/// Store-backed progress sink for one leased job. Recording progress is
/// best-effort; a failed update must not fail the task.
struct StoreProgress<S> {
    store: Arc<S>,
    job_id: String,
}

#[async_trait]
impl<S: JobStore> ProgressSink for StoreProgress<S> {
    async fn set(&self, progress: u8) {
        if let Err(err) = self.store.update_progress(&self.job_id, progress).await {
            warn!("Failed to record progress for job {}: {}", self.job_id, err);
        }
    }
}

/// Background worker draining the job store
///
/// # Architecture
/// - Reclaims stalled jobs, then leases the oldest ready job
/// - Acquires a semaphore permit before spawning the processing task, so
///   at most `WORKER_CONCURRENCY` jobs run at once
/// - Each task executes against the external collaborators, then records
///   completion, a retry, or a permanent failure
/// - Sleeps when no jobs are available, waking early on shutdown
pub struct JobWorker<S> {
    store: Arc<S>,
    runner: Arc<TaskRunner>,
    queue: QueueConfig,
    poll_interval: Duration,
}

impl<S> Clone for JobWorker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            runner: self.runner.clone(),
            queue: self.queue,
            poll_interval: self.poll_interval,
        }
    }
}

impl<S: JobStore + 'static> JobWorker<S> {
    pub fn new(
        store: Arc<S>,
        runner: Arc<TaskRunner>,
        queue: QueueConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            runner,
            queue,
            poll_interval,
        }
    }

    /// Run the drain loop until the shutdown signal flips
    pub async fn run(
        &self,
        worker_id: u32,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Worker {} started", worker_id);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(err) = self.sweep_stalled().await {
                error!("Worker {} stall sweep failed: {}", worker_id, err);
            }

            match self.store.lease_next(self.queue.lock_duration).await {
                Ok(Some(job)) => {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    // Idle; wake early if shutdown is signalled.
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(err) => {
                    error!("Worker {} job store error: {}", worker_id, err);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Worker {} stopped", worker_id);
    }

    /// Execute one leased job and record its outcome.
    pub async fn process(&self, job: Job) {
        debug!(
            "Processing job {} (attempt {}/{})",
            job.id, job.attempts, job.max_attempts
        );

        let progress = StoreProgress {
            store: self.store.clone(),
            job_id: job.id.clone(),
        };

        match self.runner.run(job.user_id, &job.payload, &progress).await {
            Ok(outcome) => match self.store.complete(&job.id, outcome.to_json()).await {
                Ok(()) => info!("Job {} completed", job.id),
                Err(err) => error!("Failed to record completion of job {}: {}", job.id, err),
            },
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    async fn handle_failure(&self, job: &Job, err: TaskError) {
        let retry = RetryPolicy {
            max_attempts: job.max_attempts,
            backoff_base: self.queue.backoff_base,
        };

        if err.is_transient() && retry.can_retry(job.attempts) {
            let delay = retry.backoff_delay(job.attempts);
            warn!(
                "Job {} attempt {}/{} failed, requeueing in {:?}: {}",
                job.id, job.attempts, job.max_attempts, delay, err
            );
            if let Err(store_err) = self.store.retry_later(&job.id, delay).await {
                error!("Failed to requeue job {}: {}", job.id, store_err);
            }
        } else {
            warn!(
                "Job {} failed after {} attempt(s): {}",
                job.id, job.attempts, err
            );
            if let Err(store_err) = self.store.fail(&job.id, &err.to_string()).await {
                error!("Failed to record failure of job {}: {}", job.id, store_err);
            }
        }
    }

    async fn sweep_stalled(&self) -> Result<(), StoreError> {
        let sweep = self.store.reclaim_stalled(self.queue.max_stalled).await?;
        if sweep.requeued > 0 || sweep.failed > 0 {
            warn!(
                "Reclaimed stalled jobs: {} requeued, {} failed",
                sweep.requeued, sweep.failed
            );
        }
        Ok(())
    }

    /// Periodically garbage-collect terminal jobs until shutdown
    pub async fn run_cleanup(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.queue.cleanup_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self
                        .store
                        .cleanup(self.queue.retention, self.queue.cleanup_batch)
                        .await
                    {
                        Ok(0) => {}
                        Ok(removed) => info!("Cleanup removed {} expired jobs", removed),
                        Err(err) => error!("Job cleanup failed: {}", err),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
