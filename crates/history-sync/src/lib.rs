//! # history-sync: Shared-Folder Sync for Daily Report History
//!
//! Keeps every machine's local history store converging on the same set of
//! records, with no database server and no shared database file.
//!
//! ## How Machines Exchange Data
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Machine A                  shared folder                Machine B     │
//! │   ─────────                  ─────────────                ─────────     │
//! │   LocalStore ──export──►  A-0001.batch.jsonl  ──import──► LocalStore    │
//! │   LocalStore ◄──import──  B-0001.batch.jsonl  ◄──export── LocalStore    │
//! │                           archive/…                                    │
//! │                                                                         │
//! │   • Files are immutable once visible (temp + rename)                   │
//! │   • Each machine only ever adds its own files                          │
//! │   • Import dedups by record identity, so re-import changes nothing     │
//! │   • Each machine keeps its own checkpoint next to its database         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - TOML + environment configuration
//! - [`checkpoint`] - Persisted export/import progress
//! - [`shared_dir`] - Listing, atomic publishing and archiving of batch files
//! - [`exporter`] - Local records to batch files
//! - [`importer`] - Peers' batch files to local records
//! - [`coordinator`] - Export-then-import cycles and status
//! - [`agent`] - Background task running cycles on a timer and on demand
//! - [`archive`] - Moving old own batches into `archive/`
//! - [`migrate`] - One-shot import from a legacy shared database file
//! - [`store`] - `HistoryStore`, the append/query facade over both modes
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use history_sync::{HistoryStore, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let mut store = HistoryStore::open(&config).await?;
//! store.start_agent(&config);
//!
//! store.append(NewRecord::new(RecordId::new("a1")?).field("count", 5)).await?;
//! let records = store.query(HistoryFilter::all()).collect_all().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod migrate;
pub mod shared_dir;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{AgentState, SyncAgent, SyncAgentHandle};
pub use archive::{archive_batches, ArchiveReport};
pub use checkpoint::{CycleSummary, PeerProgress, SyncCheckpoint};
pub use config::{StorageMode, SyncConfig};
pub use coordinator::{PeerLag, SyncCoordinator, SyncPhase, SyncReport, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use exporter::{BatchReceipt, SyncExporter};
pub use importer::{ImportReport, SyncImporter};
pub use migrate::{migrate_legacy, MigrationReport};
pub use shared_dir::{BatchFile, SharedDir};
pub use store::{HistoryStore, StoreStatus};
