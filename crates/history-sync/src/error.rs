//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │ Shared Location │  │     Checkpoint          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  SharedDir-     │  │  CheckpointCorrupt      │ │
//! │  │  ConfigLoad/    │  │   Unavailable   │  │  CheckpointMismatch     │ │
//! │  │   SaveFailed    │  │  BatchUnreadable│  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │     Store       │  │    Internal     │                              │
//! │  │                 │  │                 │                              │
//! │  │  Store(DbError) │  │  ShuttingDown   │                              │
//! │  │  (StoreCorrupt  │  │  ChannelError   │                              │
//! │  │   stays visible)│  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//! A malformed record never aborts a batch, an unreadable batch never aborts
//! a sync cycle. Those are counted in the cycle report instead of being
//! returned as errors. What does come back as `Err` stops the cycle.

use std::path::PathBuf;

use history_core::CoreError;
use history_db::DbError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Shared Location Errors
    // =========================================================================
    /// The shared folder is missing or cannot be listed.
    ///
    /// ## When This Occurs
    /// - Network share not mounted
    /// - File-sync client has not created the folder yet
    #[error("Shared folder unavailable at {}: {reason}", .path.display())]
    SharedDirUnavailable { path: PathBuf, reason: String },

    /// A batch file could not be read completely.
    ///
    /// Retried on the next cycle, never marked as consumed.
    #[error("Batch {file} unreadable: {reason}")]
    BatchUnreadable { file: String, reason: String },

    /// Writing a batch file failed.
    #[error("Failed to write batch {batch}: {reason}")]
    BatchWriteFailed { batch: String, reason: String },

    // =========================================================================
    // Checkpoint Errors
    // =========================================================================
    /// The checkpoint file exists but cannot be parsed.
    #[error("Checkpoint at {} is corrupt: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    /// The checkpoint belongs to a different machine.
    ///
    /// ## When This Occurs
    /// - A local store directory was copied from another machine
    /// - `machine.id` was changed after first sync
    #[error("Checkpoint belongs to machine '{found}', this machine is '{expected}'")]
    CheckpointMismatch { expected: String, found: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Local or shared store failure. `StoreCorrupt` arrives here unchanged.
    #[error(transparent)]
    Store(#[from] DbError),

    /// Record or batch codec failure.
    #[error(transparent)]
    Codec(#[from] CoreError),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the next sync cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SharedDirUnavailable { .. }
            | SyncError::BatchUnreadable { .. }
            | SyncError::BatchWriteFailed { .. }
            | SyncError::Io(_) => true,
            SyncError::Store(db) => db.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::CheckpointMismatch { .. }
        )
    }

    /// Returns true if a store failed its integrity check.
    pub fn is_store_corrupt(&self) -> bool {
        matches!(self, SyncError::Store(db) if db.is_corrupt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::SharedDirUnavailable {
            path: PathBuf::from("/share"),
            reason: "not mounted".into(),
        }
        .is_retryable());
        assert!(SyncError::Store(DbError::Busy("locked".into())).is_retryable());

        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::Store(DbError::StoreCorrupt("bad page".into())).is_retryable());
    }

    #[test]
    fn test_store_corrupt_stays_visible() {
        let err: SyncError = DbError::StoreCorrupt("quick_check failed".into()).into();
        assert!(err.is_store_corrupt());
        assert_eq!(err.to_string(), "Store corrupt: quick_check failed");
    }

    #[test]
    fn test_config_errors() {
        let err = SyncError::CheckpointMismatch {
            expected: "A".into(),
            found: "B".into(),
        };
        assert!(err.is_config_error());
        assert!(err.to_string().contains("'B'"));
    }
}
