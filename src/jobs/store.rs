use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::*;
use tracing::{debug, info};

use super::JobFamily;
use crate::database::entities::background_jobs::{self, JobStatus};
use crate::errors::{JobError, JobResult};

pub const MAX_ERROR_LENGTH: usize = 1000;
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Cuts a failure message to the persisted limit, on a character boundary.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LENGTH) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub step: String,
    pub detail: Option<String>,
    pub percent: i32,
    pub metrics: Option<serde_json::Value>,
}

impl ProgressUpdate {
    pub fn new(step: &str, percent: i32) -> Self {
        Self {
            step: step.to_string(),
            percent,
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub location: String,
    pub filename: String,
    pub size_bytes: i64,
}

/// Job records. Every transition out of `processing` is a conditional update,
/// so a concurrent cancel always wins over a late completion or failure.
#[derive(Clone)]
pub struct JobStore {
    db: DatabaseConnection,
    ttl: Duration,
}

impl JobStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn with_ttl_hours(mut self, hours: i64) -> Self {
        self.ttl = Duration::hours(hours);
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Creates a pending record; an existing record with the same id is returned as is.
    pub async fn create(&self, id: &str, family: JobFamily) -> JobResult<background_jobs::Model> {
        let now = Utc::now();
        let job = background_jobs::ActiveModel {
            id: Set(id.to_string()),
            family: Set(family.to_string()),
            status: Set(JobStatus::Pending.into()),
            progress_percent: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        background_jobs::Entity::insert(job)
            .on_conflict(
                OnConflict::column(background_jobs::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        self.require(id).await
    }

    pub async fn get(&self, id: &str) -> JobResult<Option<background_jobs::Model>> {
        Ok(background_jobs::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?)
    }

    pub async fn require(&self, id: &str) -> JobResult<background_jobs::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub async fn status(&self, id: &str) -> JobResult<JobStatus> {
        Ok(self.require(id).await?.get_status())
    }

    pub async fn is_cancelled(&self, id: &str) -> JobResult<bool> {
        Ok(self.status(id).await? == JobStatus::Cancelled)
    }

    /// `pending` (or a redelivered `processing`) -> `processing`.
    pub async fn mark_processing(&self, id: &str, step: &str) -> JobResult<bool> {
        let now = Utc::now();
        let update = background_jobs::ActiveModel {
            status: Set(JobStatus::Processing.into()),
            current_step: Set(Some(step.to_string())),
            current_step_detail: Set(None),
            started_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = background_jobs::Entity::update_many()
            .set(update)
            .filter(background_jobs::Column::Id.eq(id))
            .filter(background_jobs::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Processing.as_str(),
            ]))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Returns false once the job has left `processing`; the caller stops reporting.
    pub async fn update_progress(&self, id: &str, progress: &ProgressUpdate) -> JobResult<bool> {
        let job = self.require(id).await?;
        if job.get_status() != JobStatus::Processing {
            debug!("Skipping progress for {} in status {}", id, job.status);
            return Ok(false);
        }

        let percent = progress.percent.clamp(0, 100).max(job.progress_percent);
        let metrics = match &progress.metrics {
            Some(metrics) => Set(Some(serde_json::to_string(metrics)?)),
            None => NotSet,
        };
        let update = background_jobs::ActiveModel {
            progress_percent: Set(percent),
            current_step: Set(Some(progress.step.clone())),
            current_step_detail: Set(progress.detail.clone()),
            metrics,
            updated_at: Set(Utc::now()),
            ..Default::default()
        };

        let result = background_jobs::Entity::update_many()
            .set(update)
            .filter(background_jobs::Column::Id.eq(id))
            .filter(background_jobs::Column::Status.eq(JobStatus::Processing.as_str()))
            .filter(background_jobs::Column::ProgressPercent.lte(percent))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Conditional on `processing`; false means the job was cancelled meanwhile.
    pub async fn complete(&self, id: &str, output: Option<&JobOutput>) -> JobResult<bool> {
        let now = Utc::now();
        let mut update = background_jobs::ActiveModel {
            status: Set(JobStatus::Completed.into()),
            progress_percent: Set(100),
            current_step: Set(Some("completed".to_string())),
            current_step_detail: Set(None),
            completed_at: Set(Some(now)),
            expires_at: Set(Some(now + self.ttl)),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(output) = output {
            update.output_location = Set(Some(output.location.clone()));
            update.output_filename = Set(Some(output.filename.clone()));
            update.output_size_bytes = Set(Some(output.size_bytes));
        }

        let completed = self.finish(id, update).await?;
        if completed {
            info!("Job {} completed", id);
        }
        Ok(completed)
    }

    /// Conditional on `processing`; the message is truncated before it is stored.
    pub async fn fail(&self, id: &str, message: &str) -> JobResult<bool> {
        let now = Utc::now();
        let update = background_jobs::ActiveModel {
            status: Set(JobStatus::Failed.into()),
            error_message: Set(Some(truncate_error(message))),
            completed_at: Set(Some(now)),
            expires_at: Set(Some(now + self.ttl)),
            updated_at: Set(now),
            ..Default::default()
        };
        self.finish(id, update).await
    }

    async fn finish(&self, id: &str, update: background_jobs::ActiveModel) -> JobResult<bool> {
        let result = background_jobs::Entity::update_many()
            .set(update)
            .filter(background_jobs::Column::Id.eq(id))
            .filter(background_jobs::Column::Status.eq(JobStatus::Processing.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Moves a non-terminal job to `cancelled`. False when it had already finished.
    pub async fn cancel(&self, id: &str) -> JobResult<bool> {
        let now = Utc::now();
        let update = background_jobs::ActiveModel {
            status: Set(JobStatus::Cancelled.into()),
            completed_at: Set(Some(now)),
            expires_at: Set(Some(now + self.ttl)),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = background_jobs::Entity::update_many()
            .set(update)
            .filter(background_jobs::Column::Id.eq(id))
            .filter(background_jobs::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Processing.as_str(),
            ]))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Distinguish "already terminal" from "unknown id"
            self.require(id).await?;
            return Ok(false);
        }
        info!("Job {} cancelled", id);
        Ok(true)
    }

    /// Deletes terminal jobs whose retention ran out and returns them so the
    /// caller can remove queue entries and artifacts.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<Vec<background_jobs::Model>> {
        let expired = background_jobs::Entity::find()
            .filter(background_jobs::Column::ExpiresAt.lt(now))
            .filter(background_jobs::Column::Status.is_in([
                JobStatus::Completed.as_str(),
                JobStatus::Failed.as_str(),
                JobStatus::Cancelled.as_str(),
            ]))
            .all(&self.db)
            .await?;

        if expired.is_empty() {
            return Ok(expired);
        }

        let ids: Vec<String> = expired.iter().map(|job| job.id.clone()).collect();
        background_jobs::Entity::delete_many()
            .filter(background_jobs::Column::Id.is_in(ids))
            .exec(&self.db)
            .await?;

        info!("Purged {} expired jobs", expired.len());
        Ok(expired)
    }
}
