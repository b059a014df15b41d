//! Domain-specific error types for commerce-sync
//!
//! Errors are split by the layer that raises them so callers can tell a
//! misconfigured mapping apart from a failed write or a broken job.
//!
//! # Error Categories
//!
//! - **SchemaError**: schema cache and field-mapping persistence
//! - **WriterError**: statement construction and execution against a target database
//! - **JobError**: job records, the durable queue and output storage
//! - **ExpressionError**: parsing and evaluating transform formulas
//!
//! Mapping *validation* problems are not errors: the validator returns them as
//! data in a `ValidationResult`.
//!
//! # Examples
//!
//! ```rust
//! use commerce_sync::errors::{JobError, WriterError};
//!
//! let err = WriterError::InvalidIdentifier("users; drop".to_string());
//! assert!(err.is_client_error());
//!
//! let err = JobError::NotFound("job-1".to_string());
//! assert_eq!(err.error_code(), "NOT_FOUND");
//! ```

pub mod expression;
pub mod job;
pub mod schema;
pub mod writer;

pub use expression::ExpressionError;
pub use job::JobError;
pub use schema::SchemaError;
pub use writer::WriterError;

/// Result type alias for schema cache operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Result type alias for database writer operations
pub type WriterResult<T> = Result<T, WriterError>;

/// Result type alias for job queue operations
pub type JobResult<T> = Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_result_alias() {
        let result: SchemaResult<()> = Err(SchemaError::UnknownEntity("Widget".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_writer_result_alias() {
        let result: WriterResult<u64> = Err(WriterError::EmptyColumns("products".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_job_result_alias() {
        let result: JobResult<()> = Err(JobError::QueueNotReady);
        assert!(result.is_err());
    }
}
