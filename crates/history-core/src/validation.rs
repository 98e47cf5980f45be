//! # Validation Module
//!
//! Rules for the identifiers that end up in file names and unique indexes.
//!
//! ## Where Each Rule Matters
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MachineId  → embedded in batch file names: "<machine>-0001.batch.jsonl"│
//! │               so no path separators, no whitespace                      │
//! │                                                                         │
//! │  RecordId   → UNIQUE index in every LocalStore                          │
//! │               so non-empty, bounded, single line                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted machine id.
pub const MAX_MACHINE_ID_LEN: usize = 64;

/// Longest accepted record identity.
pub const MAX_RECORD_ID_LEN: usize = 512;

/// Validates a machine identifier.
///
/// ## Rules
/// - Must not be empty
/// - At most 64 characters
/// - Letters, digits, `-`, `_` and `.` only (no leading `.`)
///
/// ## Example
/// ```rust
/// use history_core::validation::validate_machine_id;
///
/// assert!(validate_machine_id("PC-LINE-22").is_ok());
/// assert!(validate_machine_id("").is_err());
/// assert!(validate_machine_id("../etc").is_err());
/// ```
pub fn validate_machine_id(id: &str) -> ValidationResult<()> {
    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "machine_id".to_string(),
        });
    }

    if id.len() > MAX_MACHINE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "machine_id".to_string(),
            max: MAX_MACHINE_ID_LEN,
        });
    }

    if id.starts_with('.') {
        return Err(ValidationError::InvalidFormat {
            field: "machine_id".to_string(),
            reason: "must not start with '.'".to_string(),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::InvalidFormat {
            field: "machine_id".to_string(),
            reason: "must contain only letters, digits, '-', '_' and '.'".to_string(),
        });
    }

    Ok(())
}

/// Validates a record identity.
///
/// ## Rules
/// - Must not be empty or whitespace only
/// - At most 512 characters
/// - No line breaks (batch files are line oriented)
pub fn validate_record_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "identity".to_string(),
        });
    }

    if id.len() > MAX_RECORD_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "identity".to_string(),
            max: MAX_RECORD_ID_LEN,
        });
    }

    if id.contains(['\n', '\r']) {
        return Err(ValidationError::InvalidFormat {
            field: "identity".to_string(),
            reason: "must be a single line".to_string(),
        });
    }

    Ok(())
}
