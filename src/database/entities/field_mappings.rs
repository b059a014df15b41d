use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "field_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub connection_id: String,
    pub entity_type: String,
    pub field_path: String,
    pub full_path: String,
    pub depth: i32,
    pub target_table: Option<String>,
    pub target_column: Option<String>,
    pub transform_type: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub transform_config: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub source_fields: Option<String>,
    pub is_key: bool,
    pub enabled: bool,
    pub is_protected: bool,
    pub access_status: String,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
