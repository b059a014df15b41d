//! Durable background jobs.
//!
//! Each [`JobFamily`] gets its own worker with its own concurrency limit. Job
//! records live in `background_jobs` and are owned by [`JobStore`]; the unit of
//! work lives in the database-backed [`JobQueue`]. A worker claims queued work,
//! drives the job record through `processing` to a terminal status and uploads
//! the handler's artifact to [`OutputStorage`].
//!
//! Cancellation is cooperative: the record is flipped to `cancelled`, the
//! in-process token of a running job is tripped, and every later write by the
//! worker is conditional on the job still being `processing`.

pub mod handler;
pub mod handlers;
pub mod payloads;
pub mod queue;
pub mod service;
pub mod storage;
pub mod store;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::JobError;

pub use handler::{JobArtifact, JobContext, JobHandler, ProgressHandle};
pub use payloads::{ExportFormat, ExportPayload, JobPayload, SyncPayload, SyncRequest, ThumbnailPayload, WebhookPayload};
pub use queue::{JobQueue, QueuedJob};
pub use service::{JobService, Submission};
pub use storage::{output_key, LocalOutputStorage, OutputStorage, StoredOutput};
pub use store::{JobOutput, JobStore, ProgressUpdate};
pub use worker::{JobOutcome, JobWorker, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobFamily {
    Export,
    Thumbnail,
    Sync,
}

impl JobFamily {
    pub const ALL: [JobFamily; 3] = [JobFamily::Export, JobFamily::Thumbnail, JobFamily::Sync];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobFamily::Export => "export",
            JobFamily::Thumbnail => "thumbnail",
            JobFamily::Sync => "sync",
        }
    }

    pub fn default_concurrency(&self) -> usize {
        match self {
            JobFamily::Export => 2,
            JobFamily::Thumbnail => 1,
            JobFamily::Sync => 2,
        }
    }
}

impl fmt::Display for JobFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobFamily {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export" => Ok(JobFamily::Export),
            "thumbnail" => Ok(JobFamily::Thumbnail),
            "sync" => Ok(JobFamily::Sync),
            other => Err(JobError::InvalidPayload {
                family: other.to_string(),
                reason: "unknown job family".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names() {
        for family in JobFamily::ALL {
            assert_eq!(family.as_str().parse::<JobFamily>().unwrap(), family);
        }
        assert!("reports".parse::<JobFamily>().is_err());
        assert_eq!(JobFamily::Thumbnail.default_concurrency(), 1);
    }
}
