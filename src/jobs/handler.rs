use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::payloads::JobPayload;
use super::store::{JobStore, ProgressUpdate};
use super::JobFamily;
use crate::errors::JobResult;

/// File produced by a handler, uploaded by the worker after success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArtifact {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl JobArtifact {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Progress callback handed to handlers.
///
/// Every write re-reads the job status first. Once the job is `cancelled` the
/// handle stops writing, trips the job's cancellation token and reports
/// `false`, which handlers treat as "stop now".
#[derive(Clone)]
pub struct ProgressHandle {
    store: JobStore,
    job_id: String,
    cancel: CancellationToken,
}

impl ProgressHandle {
    pub fn new(store: JobStore, job_id: &str, cancel: CancellationToken) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
            cancel,
        }
    }

    pub async fn update(
        &self,
        step: &str,
        detail: Option<&str>,
        percent: i32,
        metrics: Option<Value>,
    ) -> JobResult<bool> {
        if self.check_cancelled().await? {
            return Ok(false);
        }

        let progress = ProgressUpdate {
            step: step.to_string(),
            detail: detail.map(str::to_string),
            percent,
            metrics,
        };
        let written = self.store.update_progress(&self.job_id, &progress).await?;
        if written {
            info!("[{}] Progress: {}% - {}", self.job_id, percent.clamp(0, 100), step);
            return Ok(true);
        }
        Ok(!self.check_cancelled().await?)
    }

    /// Re-reads the job record; trips the token when the job was cancelled.
    pub async fn check_cancelled(&self) -> JobResult<bool> {
        if self.cancel.is_cancelled() {
            return Ok(true);
        }
        if self.store.is_cancelled(&self.job_id).await? {
            debug!("[{}] Cancellation observed", self.job_id);
            self.cancel.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub struct JobContext {
    pub job_id: String,
    pub family: JobFamily,
    pub payload: Value,
    pub attempt: i32,
    pub progress: ProgressHandle,
}

impl JobContext {
    pub fn payload<P: JobPayload>(&self) -> JobResult<P> {
        P::from_value(self.payload.clone())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.progress.token()
    }
}

/// Work performed for one job family.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn family(&self) -> JobFamily;

    /// Returns the artifact to upload, if the job produces one. An early
    /// return after cancellation may return `Ok(None)`; the worker decides
    /// the final status.
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<Option<JobArtifact>>;
}
