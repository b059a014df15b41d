//! Per-family worker loop.
//!
//! Polls the queue, runs up to `concurrency` jobs at once and drives each job
//! record to a terminal status. Shutdown stops polling and waits for
//! in-flight jobs for at most the lock duration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{JobContext, JobHandler, ProgressHandle};
use super::queue::{JobQueue, QueuedJob};
use super::storage::{output_key, OutputStorage};
use super::store::{truncate_error, JobOutput, JobStore};
use super::JobFamily;
use crate::config::QueueConfig;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Upper bound for in-flight jobs during shutdown and for stale claims
    pub lock_duration: Duration,
}

impl WorkerSettings {
    pub fn for_family(config: &QueueConfig, family: JobFamily) -> Self {
        Self {
            concurrency: config.concurrency_for(family),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            lock_duration: Duration::from_secs(config.lock_duration_secs),
        }
    }
}

/// How a single job ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { output: Option<JobOutput> },
    Failed { reason: String },
    Cancelled,
    /// The record was already cancelled or finished when the job was claimed
    Skipped,
}

pub struct JobWorker {
    handler: Arc<dyn JobHandler>,
    queue: Arc<JobQueue>,
    store: JobStore,
    storage: Arc<dyn OutputStorage>,
    settings: WorkerSettings,
    semaphore: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl JobWorker {
    pub fn new(
        handler: Arc<dyn JobHandler>,
        queue: Arc<JobQueue>,
        store: JobStore,
        storage: Arc<dyn OutputStorage>,
        settings: WorkerSettings,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            handler,
            queue,
            store,
            storage,
            settings: WorkerSettings {
                concurrency,
                poll_interval: settings.poll_interval.max(Duration::from_millis(1)),
                lock_duration: settings.lock_duration,
            },
            semaphore: Arc::new(Semaphore::new(concurrency)),
            running: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn family(&self) -> JobFamily {
        self.handler.family()
    }

    /// Runs until [`JobWorker::shutdown`] is called.
    #[instrument(skip(self), fields(family = %self.family()))]
    pub async fn run(self: Arc<Self>) {
        info!(
            concurrency = self.settings.concurrency,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Starting worker"
        );

        let lock = chrono::Duration::from_std(self.settings.lock_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        if let Err(e) = self.queue.release_stale(self.family(), lock).await {
            warn!(error = %e, "Failed to release stale jobs");
        }

        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Worker shutdown requested, stopping poll loop");
                    break;
                }
                _ = poll.tick() => self.poll_once().await,
            }
        }
    }

    /// Claims as many jobs as there are free slots.
    pub async fn poll_once(self: &Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("All worker slots busy");
                return;
            };

            let job = match self.queue.claim_next(self.family()).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "Failed to claim job");
                    return;
                }
            };

            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                worker.process(job).await;
            });
        }
    }

    /// Runs one claimed job and acknowledges it on the queue.
    pub async fn process(&self, job: QueuedJob) -> JobOutcome {
        let token = CancellationToken::new();
        self.running
            .write()
            .await
            .insert(job.job_id.clone(), token.clone());

        let outcome = execute_job(
            &self.store,
            self.storage.as_ref(),
            self.handler.as_ref(),
            &job,
            token,
        )
        .await;

        self.running.write().await.remove(&job.job_id);
        if let Err(e) = self.queue.complete(job.family, &job.job_id).await {
            error!(job_id = %job.job_id, error = %e, "Failed to acknowledge job");
        }
        outcome
    }

    /// Trips the in-process token of a running job. False when it is not running here.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.running.read().await.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn running_jobs(&self) -> Vec<String> {
        self.running.read().await.keys().cloned().collect()
    }

    /// Stops polling and waits for in-flight jobs, bounded by the lock
    /// duration. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(family = %self.family(), "Shutdown requested");
        self.shutdown.cancel();

        let permits = self.settings.concurrency as u32;
        match timeout(self.settings.lock_duration, self.semaphore.acquire_many(permits)).await {
            Ok(_) => info!(family = %self.family(), "Worker stopped"),
            Err(_) => warn!(
                family = %self.family(),
                "In-flight jobs still running after {:?}",
                self.settings.lock_duration
            ),
        }
    }
}

/// Drives one job from `pending` to a terminal status.
///
/// Used by the workers and by inline execution when no broker is available.
#[instrument(skip_all, fields(job_id = %job.job_id, family = %job.family))]
pub async fn execute_job(
    store: &JobStore,
    storage: &dyn OutputStorage,
    handler: &dyn JobHandler,
    job: &QueuedJob,
    cancel: CancellationToken,
) -> JobOutcome {
    let id = job.job_id.as_str();

    let started = match store.create(id, job.family).await {
        Ok(_) => store.mark_processing(id, "starting").await,
        Err(e) => Err(e),
    };
    match started {
        Ok(true) => {}
        Ok(false) => {
            info!("Job is no longer runnable, skipping");
            return JobOutcome::Skipped;
        }
        Err(e) => {
            error!(error = %e, "Failed to start job");
            return JobOutcome::Failed {
                reason: truncate_error(&e.to_string()),
            };
        }
    }

    let progress = ProgressHandle::new(store.clone(), id, cancel);
    let ctx = JobContext {
        job_id: id.to_string(),
        family: job.family,
        payload: job.payload.clone(),
        attempt: job.attempts,
        progress: progress.clone(),
    };

    // The handler always runs to its own return; cancellation only takes
    // effect at the checkpoints it polls.
    let artifact = match handler.run(&ctx).await {
        Err(e) => return record_failure(store, &progress, id, &format!("{:#}", e)).await,
        Ok(artifact) => artifact,
    };

    if is_cancelled(&progress).await {
        info!("Job cancelled while running");
        return JobOutcome::Cancelled;
    }

    let output = match artifact {
        Some(artifact) => {
            let key = output_key(job.family, id, &artifact.filename);
            match storage.put(&key, artifact.bytes).await {
                Ok(stored) => Some(JobOutput {
                    location: stored.location,
                    filename: artifact.filename,
                    size_bytes: stored.size_bytes,
                }),
                Err(e) => {
                    return record_failure(store, &progress, id, &format!("Upload failed: {}", e))
                        .await
                }
            }
        }
        None => None,
    };

    if is_cancelled(&progress).await {
        discard_output(storage, output.as_ref()).await;
        info!("Job cancelled before completion, output removed");
        return JobOutcome::Cancelled;
    }

    match store.complete(id, output.as_ref()).await {
        Ok(true) => JobOutcome::Completed { output },
        Ok(false) => {
            // Lost the race against a concurrent cancel
            discard_output(storage, output.as_ref()).await;
            info!("Job cancelled before completion, output removed");
            JobOutcome::Cancelled
        }
        Err(e) => {
            error!(error = %e, "Failed to record completion");
            discard_output(storage, output.as_ref()).await;
            JobOutcome::Failed {
                reason: truncate_error(&e.to_string()),
            }
        }
    }
}

async fn is_cancelled(progress: &ProgressHandle) -> bool {
    match progress.check_cancelled().await {
        Ok(cancelled) => cancelled,
        Err(e) => {
            warn!(error = %e, "Failed to re-read job status");
            false
        }
    }
}

async fn record_failure(
    store: &JobStore,
    progress: &ProgressHandle,
    id: &str,
    message: &str,
) -> JobOutcome {
    if is_cancelled(progress).await {
        return JobOutcome::Cancelled;
    }
    warn!(error = %message, "Job failed");
    match store.fail(id, message).await {
        Ok(true) => JobOutcome::Failed {
            reason: truncate_error(message),
        },
        Ok(false) => JobOutcome::Cancelled,
        Err(e) => {
            error!(error = %e, "Failed to record failure");
            JobOutcome::Failed {
                reason: truncate_error(message),
            }
        }
    }
}

async fn discard_output(storage: &dyn OutputStorage, output: Option<&JobOutput>) {
    if let Some(output) = output {
        if let Err(e) = storage.delete(&output.location).await {
            warn!(location = %output.location, error = %e, "Failed to delete output");
        }
    }
}
