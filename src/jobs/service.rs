use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::JobHandler;
use super::payloads::JobPayload;
use super::queue::{JobQueue, QueuedJob};
use super::storage::OutputStorage;
use super::store::JobStore;
use super::worker::{execute_job, JobOutcome, JobWorker, WorkerSettings};
use super::JobFamily;
use crate::config::QueueConfig;
use crate::database::entities::background_jobs;
use crate::errors::{JobError, JobResult};

/// What happened to a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Handed to the broker; `newly_queued` is false for a repeated id
    Queued { job_id: String, newly_queued: bool },
    /// Broker not ready, the job ran to completion in the caller's task
    Inline(JobOutcome),
}

/// Entry point for job producers and the worker process.
pub struct JobService {
    queue: Arc<JobQueue>,
    store: JobStore,
    storage: Arc<dyn OutputStorage>,
    handlers: HashMap<JobFamily, Arc<dyn JobHandler>>,
    config: QueueConfig,
    workers: RwLock<Vec<Arc<JobWorker>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

impl JobService {
    pub fn new(
        queue: Arc<JobQueue>,
        store: JobStore,
        storage: Arc<dyn OutputStorage>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            store,
            storage,
            handlers: HashMap::new(),
            config,
            workers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.family(), handler);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub async fn initialize(&self) -> bool {
        self.queue.initialize().await
    }

    pub fn is_ready(&self) -> bool {
        self.queue.is_ready()
    }

    /// Creates the job record and queues the work. Without a ready broker the
    /// job runs inline and the outcome is returned.
    pub async fn submit<P: JobPayload>(&self, payload: &P) -> JobResult<Submission> {
        let job_id = payload.job_id().to_string();
        self.store.create(&job_id, P::FAMILY).await?;

        if self.queue.is_ready() {
            match self.queue.enqueue(payload).await {
                Ok(newly_queued) => {
                    info!(family = %P::FAMILY, job_id = %job_id, newly_queued, "Job queued");
                    return Ok(Submission::Queued {
                        job_id,
                        newly_queued,
                    });
                }
                Err(JobError::QueueNotReady | JobError::QueueClosed) => {
                    warn!(job_id = %job_id, "Queue unavailable, running inline");
                }
                Err(e) => return Err(e),
            }
        }

        let handler = self.handler(P::FAMILY)?;
        let job = QueuedJob {
            family: P::FAMILY,
            job_id,
            payload: payload.to_value()?,
            attempts: 1,
        };
        let outcome = execute_job(
            &self.store,
            self.storage.as_ref(),
            handler.as_ref(),
            &job,
            CancellationToken::new(),
        )
        .await;
        Ok(Submission::Inline(outcome))
    }

    fn handler(&self, family: JobFamily) -> JobResult<&Arc<dyn JobHandler>> {
        self.handlers
            .get(&family)
            .ok_or_else(|| JobError::InvalidPayload {
                family: family.to_string(),
                reason: "no handler registered".to_string(),
            })
    }

    pub async fn status(&self, job_id: &str) -> JobResult<background_jobs::Model> {
        self.store.require(job_id).await
    }

    /// Marks the job cancelled and stops it if it is running in this process.
    pub async fn cancel(&self, job_id: &str) -> JobResult<bool> {
        let cancelled = self.store.cancel(job_id).await?;
        if cancelled {
            for worker in self.workers.read().await.iter() {
                worker.cancel(job_id).await;
            }
        }
        Ok(cancelled)
    }

    /// Removes expired jobs with their queue entries and artifacts.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<usize> {
        let expired = self.store.purge_expired(now).await?;
        for job in &expired {
            if self.queue.is_ready() {
                self.queue.remove(&job.id).await?;
            }
            if let Some(location) = &job.output_location {
                if let Err(e) = self.storage.delete(location).await {
                    warn!(job_id = %job.id, error = %e, "Failed to delete expired output");
                }
            }
        }
        Ok(expired.len())
    }

    /// Spawns one worker per registered family.
    pub async fn start_workers(&self) -> Vec<JoinHandle<()>> {
        let mut workers = self.workers.write().await;
        let mut handles = Vec::new();
        for (family, handler) in &self.handlers {
            let worker = Arc::new(JobWorker::new(
                handler.clone(),
                self.queue.clone(),
                self.store.clone(),
                self.storage.clone(),
                WorkerSettings::for_family(&self.config, *family),
            ));
            handles.push(tokio::spawn(worker.clone().run()));
            workers.push(worker);
        }
        handles
    }

    /// Periodic purge until shutdown.
    pub async fn run_maintenance(&self) {
        let period = Duration::from_secs(self.config.purge_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.purge_expired(Utc::now()).await {
                        error!(error = %e, "Failed to purge expired jobs");
                    }
                }
            }
        }
    }

    /// Stops every worker, waits for in-flight jobs, then closes the queue.
    ///
    /// Jobs still running when the workers' wait runs out keep the queue
    /// open so they can acknowledge their entries when they finish.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let workers = self.workers.read().await.clone();
        join_all(workers.iter().map(|worker| worker.shutdown())).await;

        let mut in_flight = Vec::new();
        for worker in &workers {
            in_flight.extend(worker.running_jobs().await);
        }
        if !in_flight.is_empty() {
            warn!(jobs = ?in_flight, "Jobs still running at shutdown, queue left open");
            return;
        }
        self.queue.close();
        info!("Job service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::entities::background_jobs::JobStatus;
    use crate::database::test_utils::setup_test_db;
    use crate::jobs::handler::{JobArtifact, JobContext};
    use crate::jobs::payloads::ExportPayload;
    use crate::jobs::storage::LocalOutputStorage;
    use crate::jobs::ExportFormat;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        fn family(&self) -> JobFamily {
            JobFamily::Export
        }

        async fn run(&self, ctx: &JobContext) -> anyhow::Result<Option<JobArtifact>> {
            let request: ExportPayload = ctx.payload()?;
            Ok(Some(JobArtifact::new("out.pdf", request.user_id.into_bytes())))
        }
    }

    fn export(id: &str) -> ExportPayload {
        ExportPayload {
            job_id: id.to_string(),
            format: ExportFormat::Pdf,
            user_id: "u-1".to_string(),
            user_role: "admin".to_string(),
            filters: serde_json::json!({}),
        }
    }

    fn service(queue: JobQueue, db: sea_orm::DatabaseConnection, dir: &TempDir) -> JobService {
        JobService::new(
            Arc::new(queue),
            JobStore::new(db),
            Arc::new(LocalOutputStorage::new(dir.path())),
            QueueConfig::default(),
        )
        .with_handler(Arc::new(EchoHandler))
    }

    #[tokio::test]
    async fn test_submit_runs_inline_without_broker() {
        let dir = TempDir::new().unwrap();
        let db = setup_test_db().await;
        let service = service(JobQueue::new(None), db, &dir);
        assert!(!service.initialize().await);

        let submission = service.submit(&export("exp-1")).await.unwrap();
        assert!(matches!(
            submission,
            Submission::Inline(JobOutcome::Completed { .. })
        ));
        let job = service.status("exp-1").await.unwrap();
        assert_eq!(job.get_status(), JobStatus::Completed);
        assert_eq!(job.output_location.as_deref(), Some("export/exp-1/out.pdf"));
    }

    #[tokio::test]
    async fn test_submit_queues_once() {
        let dir = TempDir::new().unwrap();
        let db = setup_test_db().await;
        let service = service(JobQueue::with_connection(db.clone()), db, &dir);

        let first = service.submit(&export("exp-2")).await.unwrap();
        let second = service.submit(&export("exp-2")).await.unwrap();
        assert_eq!(
            first,
            Submission::Queued {
                job_id: "exp-2".to_string(),
                newly_queued: true
            }
        );
        assert_eq!(
            second,
            Submission::Queued {
                job_id: "exp-2".to_string(),
                newly_queued: false
            }
        );
        assert_eq!(
            service.status("exp-2").await.unwrap().get_status(),
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_purge_removes_outputs() {
        let dir = TempDir::new().unwrap();
        let db = setup_test_db().await;
        let service = service(JobQueue::new(None), db, &dir);
        service.submit(&export("exp-3")).await.unwrap();
        assert!(dir.path().join("export/exp-3/out.pdf").exists());

        let purged = service
            .purge_expired(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!dir.path().join("export/exp-3/out.pdf").exists());
        assert!(service.status("exp-3").await.unwrap_err().is_not_found());
    }

    /// Export handler that parks until released.
    #[derive(Default)]
    struct Gate {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    struct GatedHandler(Arc<Gate>);

    #[async_trait]
    impl JobHandler for GatedHandler {
        fn family(&self) -> JobFamily {
            JobFamily::Export
        }

        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<Option<JobArtifact>> {
            self.0.started.notify_one();
            self.0.release.notified().await;
            Ok(Some(JobArtifact::new("out.pdf", b"late".to_vec())))
        }
    }

    #[tokio::test]
    async fn test_shutdown_timeout_keeps_queue_open_for_late_jobs() {
        use crate::database::entities::job_queue::{self, STATE_DONE};
        use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

        let dir = TempDir::new().unwrap();
        let db = setup_test_db().await;
        let gate = Arc::new(Gate::default());
        let config = QueueConfig {
            poll_interval_ms: 10,
            lock_duration_secs: 0,
            ..QueueConfig::default()
        };
        let service = JobService::new(
            Arc::new(JobQueue::with_connection(db.clone())),
            JobStore::new(db.clone()),
            Arc::new(LocalOutputStorage::new(dir.path())),
            config,
        )
        .with_handler(Arc::new(GatedHandler(gate.clone())));

        service.submit(&export("exp-late")).await.unwrap();
        let handles = service.start_workers().await;
        gate.started.notified().await;

        service.shutdown().await;
        assert!(service.is_ready());
        for handle in handles {
            handle.await.unwrap();
        }

        gate.release.notify_one();
        let mut acknowledged = false;
        for _ in 0..200 {
            let done = job_queue::Entity::find()
                .filter(job_queue::Column::JobId.eq("exp-late"))
                .filter(job_queue::Column::State.eq(STATE_DONE))
                .one(&db)
                .await
                .unwrap();
            if done.is_some() {
                acknowledged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(acknowledged);
        assert_eq!(
            service.status("exp-late").await.unwrap().get_status(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = setup_test_db().await;
        let service = service(JobQueue::with_connection(db.clone()), db, &dir);
        let handles = service.start_workers().await;
        assert_eq!(handles.len(), 1);

        service.shutdown().await;
        service.shutdown().await;
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!service.is_ready());
    }
}
