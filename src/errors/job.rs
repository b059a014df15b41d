//! Job queue error types
//!
//! There is no cancellation variant: a cancelled job is a terminal state,
//! not a failure.

use thiserror::Error;

/// Job queue, job record and output storage errors
#[derive(Error, Debug)]
pub enum JobError {
    /// Job record not found by ID
    #[error("Job {0} not found")]
    NotFound(String),

    /// Broker is not connected; callers should run the job synchronously
    #[error("Job queue is not ready")]
    QueueNotReady,

    /// Queue has been shut down
    #[error("Job queue is closed")]
    QueueClosed,

    /// Status transition is not allowed
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Job identifier
        id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Enqueue payload could not be decoded for this job family
    #[error("Invalid payload for {family} job: {reason}")]
    InvalidPayload {
        /// Job family
        family: String,
        /// Why the payload was rejected
        reason: String,
    },

    /// Handler raised an error while processing the job
    #[error("Job {id} failed: {reason}")]
    HandlerFailed {
        /// Job identifier
        id: String,
        /// Failure reason
        reason: String,
    },

    /// Output storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// Check if this is a client error (400-series)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            JobError::InvalidTransition { .. } | JobError::InvalidPayload { .. }
        )
    }

    /// Check if this is a not found error (404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobError::NotFound(_))
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "NOT_FOUND",
            JobError::QueueNotReady | JobError::QueueClosed => "UNAVAILABLE",
            JobError::InvalidTransition { .. } => "CONFLICT",
            JobError::InvalidPayload { .. } => "VALIDATION_FAILED",
            JobError::HandlerFailed { .. } => "OPERATION_FAILED",
            JobError::Storage(_) => "IO_ERROR",
            JobError::Database(_) => "DATABASE_ERROR",
            JobError::Json(_) => "JSON_ERROR",
        }
    }
}
