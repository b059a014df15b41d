//! Database writer error types
//!
//! Statement-level failures. Per-chunk failures during `upsert` and
//! `batch_insert` are not surfaced through this type: they are caught and
//! recorded against the affected row indices instead.

use thiserror::Error;

/// Database writer errors
#[derive(Error, Debug)]
pub enum WriterError {
    /// Table or column name failed identifier validation
    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    /// Nothing to write for the given table
    #[error("No columns to write for table {0}")]
    EmptyColumns(String),

    /// A row is missing the key column value
    #[error("Row {index} has no value for key column {column}")]
    MissingKey {
        /// Global row index
        index: usize,
        /// Key column name
        column: String,
    },

    /// Chunk size must be positive
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// Dialect name is not recognised
    #[error("Unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WriterError {
    /// Check if this is a client error (400-series)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WriterError::InvalidIdentifier(_)
                | WriterError::EmptyColumns(_)
                | WriterError::MissingKey { .. }
                | WriterError::InvalidChunkSize(_)
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            WriterError::InvalidIdentifier(_)
            | WriterError::EmptyColumns(_)
            | WriterError::MissingKey { .. }
            | WriterError::InvalidChunkSize(_) => "VALIDATION_FAILED",
            WriterError::UnsupportedDialect(_) => "UNSUPPORTED",
            WriterError::Database(_) => "DATABASE_ERROR",
            WriterError::Json(_) => "JSON_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_identifier() {
        let err = WriterError::InvalidIdentifier("a b".to_string());
        assert_eq!(err.to_string(), "Invalid SQL identifier: a b");
        assert!(err.is_client_error());
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn test_missing_key() {
        let err = WriterError::MissingKey {
            index: 7,
            column: "shopify_id".to_string(),
        };
        assert_eq!(err.to_string(), "Row 7 has no value for key column shopify_id");
    }
}
