//! # Error Types
//!
//! Domain-specific error types for history-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  history-core errors (this file)                                       │
//! │  ├── CoreError        - Codec failures (record / batch)                │
//! │  └── ValidationError  - Identifier validation failures                 │
//! │                                                                         │
//! │  history-db errors (separate crate)                                    │
//! │  └── DbError          - Store / guard failures                         │
//! │                                                                         │
//! │  history-sync errors (separate crate)                                  │
//! │  └── SyncError        - Export / import / config failures              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Recoverability
//! - `MalformedRecord` is per record: skip it, count it, keep going.
//! - `BatchUnreadable` is per batch file: leave it unapplied and retry on the
//!   next sync cycle.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Codec and domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A single record failed to decode (truncated or schema mismatch).
    ///
    /// ## When This Occurs
    /// - A batch line is not valid JSON
    /// - The record was written by an unknown codec version
    /// - Required fields are missing or carry the wrong type
    #[error("Malformed record: {reason}")]
    MalformedRecord { reason: String },

    /// A whole batch file cannot be trusted yet.
    ///
    /// ## When This Occurs
    /// - Header or trailer line is missing (file still being copied)
    /// - Trailer record count or digest does not match the body
    #[error("Batch unreadable: {reason}")]
    BatchUnreadable { reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MalformedRecord error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedRecord {
            reason: reason.into(),
        }
    }

    /// Creates a BatchUnreadable error.
    pub fn unreadable(reason: impl Into<String>) -> Self {
        CoreError::BatchUnreadable {
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Identifier validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::malformed("missing identity");
        assert_eq!(err.to_string(), "Malformed record: missing identity");

        let err = CoreError::unreadable("trailer missing");
        assert_eq!(err.to_string(), "Batch unreadable: trailer missing");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "machine_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
