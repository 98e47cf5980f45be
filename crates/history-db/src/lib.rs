//! # history-db: Storage Layer for Daily Report History
//!
//! Owns every SQLite file the system touches: each machine's local store and,
//! in legacy mode, the single database shared over the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        History Data Flow                                │
//! │                                                                         │
//! │  history-sync (exporter / importer)  or  HistoryStore::append          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    history-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  SharedStore  │    │  Migrations  │  │   │
//! │  │   │  (pool.rs)    │    │  (guard.rs)   │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ WAL, 1 writer │    │ lock + retry  │    │ 0001_history │  │   │
//! │  │   │ quick_check   │    │ DELETE / FULL │    │   _records   │  │   │
//! │  │   └───────┬───────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │           └──────────┬─────────┘                              │   │
//! │  │                      ▼                                        │   │
//! │  │              HistoryRepository (SQL)                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                   │                            │
//! │       ▼                                   ▼                            │
//! │  local disk: history.db          network share: history.db + .lock    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - `DbConfig`, `LocalStore`, lazy query cursor
//! - [`guard`] - `NetworkSafeGuard`, lock file, `SharedStore`
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - SQL for current and legacy tables
//!
//! ## Usage
//!
//! ```rust,ignore
//! use history_db::{DbConfig, LocalStore};
//!
//! let store = LocalStore::open(DbConfig::new("history.db"), machine).await?;
//! store.append(NewRecord::new(RecordId::new("a1")?).field("count", 5)).await?;
//! let records = store.query(HistoryFilter::all()).collect_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod guard;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use guard::{FileLock, GuardConfig, NetworkSafeGuard, SharedStore, WriteState};
pub use pool::{AppendOutcome, AppendSummary, DbConfig, LocalStore, RecordCursor};

// Repository re-exports for convenience
pub use repository::history::{HistoryRepository, StoredRecord};
