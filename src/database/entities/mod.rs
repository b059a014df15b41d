pub mod background_jobs;
pub mod field_mappings;
pub mod job_queue;
pub mod schema_cache;
