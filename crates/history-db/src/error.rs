//! # Database Error Types
//!
//! Error types for store and guard operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← classified by primary result code             │
//! │       │                                                                 │
//! │       ├── Busy / LockTimeout ──► NetworkSafeGuard retries              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (history-sync) ← StoreCorrupt stays distinguishable         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  CLI reports it, host decides how to recover                           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use history_core::CoreError;
use thiserror::Error;

/// SQLite primary result codes we react to.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Store and guard errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database file failed its integrity check or is not a database.
    ///
    /// ## When This Occurs
    /// - `PRAGMA quick_check` reports anything other than `ok` at open
    /// - SQLite returns SQLITE_CORRUPT or SQLITE_NOTADB
    ///
    /// Never repaired silently. The host decides (restore, rebuild from a
    /// snapshot, or start empty).
    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// The shared legacy database could not be written after all retries.
    #[error("Write unavailable after {attempts} attempts: {last_error}")]
    WriteUnavailable { attempts: u32, last_error: String },

    /// The cross-process lock file could not be acquired in time.
    #[error("Timed out after {:.1}s waiting for lock {}", .waited.as_secs_f64(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// SQLite reported BUSY or LOCKED.
    ///
    /// ## When This Occurs
    /// - Another process holds the write lock on the shared file
    /// - busy_timeout elapsed before the lock was released
    #[error("Database busy: {0}")]
    Busy(String),

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - Network share is not mounted
    /// - File permissions issue
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// File system error (lock file, database directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be turned back into a record.
    #[error("Stored row unreadable: {0}")]
    Codec(#[from] CoreError),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Busy(_) | DbError::LockTimeout { .. } | DbError::PoolExhausted
        )
    }

    /// Returns true if the underlying file cannot be trusted.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, DbError::StoreCorrupt(_))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// code 5 / 6 (BUSY, LOCKED)      → DbError::Busy
/// code 11 / 26 (CORRUPT, NOTADB) → DbError::StoreCorrupt
/// other database error           → DbError::QueryFailed
/// sqlx::Error::PoolTimedOut      → DbError::PoolExhausted
/// sqlx::Error::Io                → DbError::Io
/// Other                          → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = db_err.message().to_string();

                // Extended result codes carry the primary code in the low byte.
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);

                match primary {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => DbError::Busy(msg),
                    Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => DbError::StoreCorrupt(msg),
                    _ => classify_message(msg),
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            sqlx::Error::Io(io) => DbError::Io(io),

            _ => classify_message(err.to_string()),
        }
    }
}

fn classify_message(msg: String) -> DbError {
    let lower = msg.to_lowercase();
    if lower.contains("database is locked") || lower.contains("busy") {
        DbError::Busy(msg)
    } else if lower.contains("malformed") || lower.contains("not a database") {
        DbError::StoreCorrupt(msg)
    } else {
        DbError::QueryFailed(msg)
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        match err {
            sqlx::migrate::MigrateError::Execute(inner) => match DbError::from(inner) {
                busy @ DbError::Busy(_) => busy,
                corrupt @ DbError::StoreCorrupt(_) => corrupt,
                other => DbError::MigrationFailed(other.to_string()),
            },
            other => DbError::MigrationFailed(other.to_string()),
        }
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Busy("database is locked".into()).is_transient());
        assert!(DbError::LockTimeout {
            path: PathBuf::from("/share/history.db.lock"),
            waited: Duration::from_secs(30),
        }
        .is_transient());
        assert!(!DbError::StoreCorrupt("bad page".into()).is_transient());
        assert!(!DbError::QueryFailed("syntax".into()).is_transient());
    }

    #[test]
    fn test_message_fallback() {
        assert!(matches!(
            classify_message("database is locked".into()),
            DbError::Busy(_)
        ));
        assert!(matches!(
            classify_message("database disk image is malformed".into()),
            DbError::StoreCorrupt(_)
        ));
        assert!(matches!(
            classify_message("no such table: x".into()),
            DbError::QueryFailed(_)
        ));
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = DbError::LockTimeout {
            path: PathBuf::from("/share/history.db.lock"),
            waited: Duration::from_millis(1500),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 1.5s waiting for lock /share/history.db.lock"
        );
    }
}
