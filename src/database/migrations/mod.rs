pub use sea_orm_migration::prelude::*;

mod m20260901_000001_create_schema_cache;
mod m20260901_000002_create_field_mappings;
mod m20260915_000003_create_background_jobs;
mod m20260915_000004_create_job_queue;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260901_000001_create_schema_cache::Migration),
            Box::new(m20260901_000002_create_field_mappings::Migration),
            Box::new(m20260915_000003_create_background_jobs::Migration),
            Box::new(m20260915_000004_create_job_queue::Migration),
        ]
    }
}
