//! Schema cache error types
//!
//! Raised while reading or writing cached remote type definitions and
//! persisted field mappings.

use thiserror::Error;

/// Schema cache and field mapping errors
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Entity type is not part of the fixed catalog
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Cache category is not one of the supported categories
    #[error("Unknown schema cache category: {0}")]
    UnknownCategory(String),

    /// Field path does not fit the entityType.fieldPath convention
    #[error("Invalid field path '{path}': {reason}")]
    InvalidFieldPath {
        /// Offending path
        path: String,
        /// Why the path was rejected
        reason: String,
    },

    /// Protected mappings cannot be disabled
    #[error("Mapping '{0}' is protected and cannot be disabled")]
    ProtectedMapping(String),

    /// Mapping not found by full path
    #[error("Mapping '{0}' not found")]
    MappingNotFound(String),

    /// Stored JSON could not be decoded
    #[error("Corrupt schema cache entry for {type_name}: {source}")]
    CorruptEntry {
        /// Cached type name
        type_name: String,
        /// Decoding failure
        #[source]
        source: serde_json::Error,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchemaError {
    /// Check if this is a client error (400-series)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SchemaError::UnknownEntity(_)
                | SchemaError::UnknownCategory(_)
                | SchemaError::InvalidFieldPath { .. }
                | SchemaError::ProtectedMapping(_)
        )
    }

    /// Check if this is a not found error (404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchemaError::MappingNotFound(_))
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            SchemaError::UnknownEntity(_)
            | SchemaError::UnknownCategory(_)
            | SchemaError::InvalidFieldPath { .. } => "VALIDATION_FAILED",
            SchemaError::ProtectedMapping(_) => "FORBIDDEN",
            SchemaError::MappingNotFound(_) => "NOT_FOUND",
            SchemaError::CorruptEntry { .. } | SchemaError::Json(_) => "JSON_ERROR",
            SchemaError::Database(_) => "DATABASE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_mapping() {
        let err = SchemaError::ProtectedMapping("Product.id".to_string());
        assert_eq!(
            err.to_string(),
            "Mapping 'Product.id' is protected and cannot be disabled"
        );
        assert!(err.is_client_error());
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[test]
    fn test_mapping_not_found() {
        let err = SchemaError::MappingNotFound("Order.name".to_string());
        assert!(err.is_not_found());
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
