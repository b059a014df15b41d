use chrono::{Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::*;
use sea_orm_migration::MigratorTrait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::payloads::JobPayload;
use super::JobFamily;
use crate::config::DatabaseConfig;
use crate::database::entities::job_queue::{self, STATE_ACTIVE, STATE_DONE, STATE_QUEUED};
use crate::database::establish_connection;
use crate::database::migrations::Migrator;
use crate::errors::{JobError, JobResult};

/// Claims retried per poll when another worker wins the race for a row.
const CLAIM_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub family: JobFamily,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

/// Database-backed broker shared by all worker families.
pub struct JobQueue {
    broker_url: Option<String>,
    db: OnceCell<DatabaseConnection>,
    closed: AtomicBool,
}

impl JobQueue {
    /// `None` or an empty URL leaves the queue unconfigured; it never becomes ready.
    pub fn new(broker_url: Option<String>) -> Self {
        Self {
            broker_url: broker_url.filter(|url| !url.trim().is_empty()),
            db: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// A queue on an already migrated connection, ready immediately.
    pub fn with_connection(db: DatabaseConnection) -> Self {
        Self {
            broker_url: None,
            db: OnceCell::new_with(Some(db)),
            closed: AtomicBool::new(false),
        }
    }

    /// Connects to the broker and ensures its tables exist. Connection
    /// problems are logged and leave the queue not ready.
    pub async fn initialize(&self) -> bool {
        if self.db.initialized() {
            return self.is_ready();
        }
        let Some(url) = self.broker_url.as_deref() else {
            warn!("No job broker configured, jobs will run inline");
            return false;
        };

        let config = DatabaseConfig {
            url: url.to_string(),
            ..Default::default()
        };
        let connected = async {
            let db = establish_connection(&config).await?;
            Migrator::up(&db, None).await?;
            Ok::<_, DbErr>(db)
        }
        .await;

        match connected {
            Ok(db) => {
                let _ = self.db.set(db);
                info!("Job broker ready");
                self.is_ready()
            }
            Err(e) => {
                warn!("Job broker unreachable, jobs will run inline: {}", e);
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.db.initialized() && !self.closed.load(Ordering::SeqCst)
    }

    /// Stops accepting and handing out work. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Job queue closed");
        }
    }

    fn connection(&self) -> JobResult<&DatabaseConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::QueueClosed);
        }
        self.db.get().ok_or(JobError::QueueNotReady)
    }

    /// Queues `payload` under its job id. Returns false when that id is
    /// already queued for the family; no duplicate work is created.
    pub async fn enqueue<P: JobPayload>(&self, payload: &P) -> JobResult<bool> {
        self.enqueue_value(P::FAMILY, payload.job_id(), payload.to_value()?)
            .await
    }

    pub async fn enqueue_value(
        &self,
        family: JobFamily,
        job_id: &str,
        payload: serde_json::Value,
    ) -> JobResult<bool> {
        let db = self.connection()?;
        let entry = job_queue::ActiveModel {
            family: Set(family.to_string()),
            job_id: Set(job_id.to_string()),
            payload: Set(serde_json::to_string(&payload)?),
            state: Set(STATE_QUEUED.to_string()),
            attempts: Set(0),
            enqueued_at: Set(Utc::now()),
            locked_at: Set(None),
        };

        let inserted = job_queue::Entity::insert(entry)
            .on_conflict(
                OnConflict::columns([job_queue::Column::Family, job_queue::Column::JobId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;

        if inserted == 0 {
            debug!("{} job {} already queued", family, job_id);
        }
        Ok(inserted == 1)
    }

    /// Takes the oldest queued entry of `family`, marking it active.
    pub async fn claim_next(&self, family: JobFamily) -> JobResult<Option<QueuedJob>> {
        let db = self.connection()?;

        for _ in 0..CLAIM_ATTEMPTS {
            let Some(candidate) = job_queue::Entity::find()
                .filter(job_queue::Column::Family.eq(family.as_str()))
                .filter(job_queue::Column::State.eq(STATE_QUEUED))
                .order_by_asc(job_queue::Column::EnqueuedAt)
                .order_by_asc(job_queue::Column::JobId)
                .one(db)
                .await?
            else {
                return Ok(None);
            };

            let claimed = job_queue::Entity::update_many()
                .col_expr(job_queue::Column::State, Expr::value(STATE_ACTIVE))
                .col_expr(job_queue::Column::LockedAt, Expr::value(Utc::now()))
                .col_expr(
                    job_queue::Column::Attempts,
                    Expr::col(job_queue::Column::Attempts).add(1),
                )
                .filter(job_queue::Column::Family.eq(family.as_str()))
                .filter(job_queue::Column::JobId.eq(candidate.job_id.as_str()))
                .filter(job_queue::Column::State.eq(STATE_QUEUED))
                .exec(db)
                .await?;

            if claimed.rows_affected == 1 {
                let payload = serde_json::from_str(&candidate.payload)?;
                return Ok(Some(QueuedJob {
                    family,
                    job_id: candidate.job_id,
                    payload,
                    attempts: candidate.attempts + 1,
                }));
            }
        }

        Ok(None)
    }

    pub async fn complete(&self, family: JobFamily, job_id: &str) -> JobResult<()> {
        let db = self.connection()?;
        job_queue::Entity::update_many()
            .col_expr(job_queue::Column::State, Expr::value(STATE_DONE))
            .filter(job_queue::Column::Family.eq(family.as_str()))
            .filter(job_queue::Column::JobId.eq(job_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// Hands entries locked longer than `lock_duration` back to the queue.
    pub async fn release_stale(&self, family: JobFamily, lock_duration: Duration) -> JobResult<u64> {
        let db = self.connection()?;
        let cutoff = Utc::now() - lock_duration;
        let result = job_queue::Entity::update_many()
            .col_expr(job_queue::Column::State, Expr::value(STATE_QUEUED))
            .col_expr(
                job_queue::Column::LockedAt,
                Expr::value(Option::<chrono::DateTime<Utc>>::None),
            )
            .filter(job_queue::Column::Family.eq(family.as_str()))
            .filter(job_queue::Column::State.eq(STATE_ACTIVE))
            .filter(job_queue::Column::LockedAt.lt(cutoff))
            .exec(db)
            .await?;
        if result.rows_affected > 0 {
            warn!("Released {} stale {} jobs", result.rows_affected, family);
        }
        Ok(result.rows_affected)
    }

    pub async fn remove(&self, job_id: &str) -> JobResult<u64> {
        let db = self.connection()?;
        let result = job_queue::Entity::delete_many()
            .filter(job_queue::Column::JobId.eq(job_id))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn queued_count(&self, family: JobFamily) -> JobResult<u64> {
        let db = self.connection()?;
        Ok(job_queue::Entity::find()
            .filter(job_queue::Column::Family.eq(family.as_str()))
            .filter(job_queue::Column::State.eq(STATE_QUEUED))
            .count(db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_utils::setup_test_db;
    use crate::jobs::payloads::{SyncPayload, SyncRequest, ThumbnailPayload};

    fn sync_request(id: &str) -> SyncRequest {
        SyncRequest::Entity(SyncPayload {
            job_id: id.to_string(),
            connection_id: "shop-1".to_string(),
            entity_type: "Product".to_string(),
            delete_stale: false,
        })
    }

    #[tokio::test]
    async fn test_unconfigured_queue_is_not_ready() {
        let queue = JobQueue::new(None);
        assert!(!queue.initialize().await);
        assert!(!queue.is_ready());
        let err = queue.enqueue(&sync_request("s-1")).await.unwrap_err();
        assert!(matches!(err, JobError::QueueNotReady));

        assert!(!JobQueue::new(Some("  ".to_string())).initialize().await);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_ready() {
        let queue = JobQueue::new(Some("postgres://nobody@127.0.0.1:1/none".to_string()));
        assert!(!queue.initialize().await);
        assert!(!queue.is_ready());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let queue = JobQueue::with_connection(setup_test_db().await);
        assert!(queue.is_ready());

        assert!(queue.enqueue(&sync_request("s-1")).await.unwrap());
        assert!(!queue.enqueue(&sync_request("s-1")).await.unwrap());
        assert_eq!(queue.queued_count(JobFamily::Sync).await.unwrap(), 1);

        // Same id in another family is separate work
        let thumbnail = ThumbnailPayload {
            run_id: "s-1".to_string(),
            sizes: vec![128],
            sku_ids: None,
            triggered_by: "admin".to_string(),
        };
        assert!(queue.enqueue(&thumbnail).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_marks_entry_active() {
        let queue = JobQueue::with_connection(setup_test_db().await);
        queue.enqueue(&sync_request("s-1")).await.unwrap();
        queue.enqueue(&sync_request("s-2")).await.unwrap();

        let first = queue.claim_next(JobFamily::Sync).await.unwrap().unwrap();
        let second = queue.claim_next(JobFamily::Sync).await.unwrap().unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.payload["kind"], "entity");
        assert!(queue.claim_next(JobFamily::Sync).await.unwrap().is_none());
        assert!(queue.claim_next(JobFamily::Export).await.unwrap().is_none());

        // Active entries still block re-enqueue
        assert!(!queue.enqueue(&sync_request("s-1")).await.unwrap());

        let released = queue
            .release_stale(JobFamily::Sync, Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(released, 2);
        assert_eq!(queue.queued_count(JobFamily::Sync).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = JobQueue::with_connection(setup_test_db().await);
        queue.close();
        queue.close();
        assert!(!queue.is_ready());
        let err = queue.claim_next(JobFamily::Sync).await.unwrap_err();
        assert!(matches!(err, JobError::QueueClosed));
    }
}
