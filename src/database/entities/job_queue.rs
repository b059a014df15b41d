use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Durable broker table: one unit of work per `(family, job_id)`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_queue")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub family: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: String,
    #[sea_orm(column_type = "Text")]
    pub payload: String,
    /// `queued`, `active` or `done`
    pub state: String,
    pub attempts: i32,
    pub enqueued_at: ChronoDateTimeUtc,
    pub locked_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const STATE_QUEUED: &str = "queued";
pub const STATE_ACTIVE: &str = "active";
pub const STATE_DONE: &str = "done";
