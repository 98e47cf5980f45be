//! # Sync Coordinator
//!
//! Drives one machine's sync cycles and owns its checkpoint.
//!
//! ## Cycle State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   IDLE ──► RECOVERING ──► EXPORTING ──► IMPORTING ──► DONE             │
//! │    ▲          │              │              │            │              │
//! │    │          │ own batch    │ drain        │ peers'     │ last_sync_at │
//! │    │          │ files newer  │ unexported   │ batches    │ + cycle      │
//! │    │          │ than the     │ records in   │ not yet    │ summary      │
//! │    │          │ checkpoint   │ batches      │ applied    │ persisted    │
//! │    │          ▼              ▼              ▼            │              │
//! │    └──────────────── any error: back to IDLE ◄───────────┘              │
//! │                                                                         │
//! │  Every step persists the checkpoint atomically, so an interrupted      │
//! │  cycle resumes from the last completed step with no duplicate effect.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Export runs first so this machine's new records reach peers before it
//! spends time pulling theirs. Both steps are idempotent, so the order does
//! not affect the end state.
//!
//! One coordinator per local store. Cycles on the same coordinator are
//! serialized by the checkpoint mutex.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use history_core::MachineId;
use history_db::LocalStore;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::archive::{archive_batches, ArchiveReport};
use crate::checkpoint::{CycleSummary, SyncCheckpoint};
use crate::config::{SyncConfig, SyncSettings};
use crate::error::SyncResult;
use crate::exporter::{BatchReceipt, SyncExporter};
use crate::importer::{ImportReport, SyncImporter};
use crate::shared_dir::SharedDir;

// =============================================================================
// Phase
// =============================================================================

/// Where the current (or last) cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Recovering,
    Exporting,
    Importing,
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Recovering => write!(f, "recovering"),
            SyncPhase::Exporting => write!(f, "exporting"),
            SyncPhase::Importing => write!(f, "importing"),
            SyncPhase::Done => write!(f, "done"),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of one `sync_bidirectional` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Batches written this cycle, oldest first.
    pub exported: Vec<BatchReceipt>,
    pub import: ImportReport,
}

impl SyncReport {
    /// Records newly inserted from peers.
    pub fn imported_count(&self) -> usize {
        self.import.inserted
    }

    /// Most recent batch written this cycle, if any.
    pub fn exported_batch(&self) -> Option<&BatchReceipt> {
        self.exported.last()
    }

    fn summary(&self) -> CycleSummary {
        CycleSummary {
            imported: self.import.inserted,
            duplicates: self.import.duplicates,
            malformed_records: self.import.malformed,
            unreadable_batches: self.import.unreadable.len(),
            exported_batch: self.exported_batch().map(|receipt| receipt.id.to_string()),
        }
    }
}

/// Import lag for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerLag {
    pub machine: MachineId,
    /// Every batch up to here has been applied.
    pub imported_through: u64,
    /// Highest batch sequence seen in the shared folder or applied.
    pub highest_seen: u64,
    /// Batches present in the shared folder but not applied yet.
    pub missing: Vec<u64>,
}

/// Snapshot of sync state for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub machine: MachineId,
    pub phase: SyncPhase,
    pub shared_dir: PathBuf,
    pub shared_dir_available: bool,
    pub local_records: i64,
    pub pending_export: i64,
    pub last_export_seq: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_export_at: Option<DateTime<Utc>>,
    pub last_import_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleSummary>,
    pub peers: Vec<PeerLag>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Orchestrates export and import for one local store.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    store: LocalStore,
    shared: SharedDir,
    exporter: SyncExporter,
    importer: SyncImporter,
    checkpoint_path: PathBuf,
    checkpoint: Arc<Mutex<SyncCheckpoint>>,
    phase: Arc<RwLock<SyncPhase>>,
}

impl SyncCoordinator {
    /// Builds a coordinator from the application config.
    pub fn open(store: LocalStore, config: &SyncConfig) -> SyncResult<Self> {
        let shared_dir = config.shared_dir()?.to_path_buf();
        Self::new(store, shared_dir, config.checkpoint_path(), &config.sync)
    }

    /// Builds a coordinator from explicit locations.
    ///
    /// ## Errors
    /// `CheckpointMismatch` / `CheckpointCorrupt` from the checkpoint file.
    pub fn new(
        store: LocalStore,
        shared_dir: impl Into<PathBuf>,
        checkpoint_path: impl Into<PathBuf>,
        settings: &SyncSettings,
    ) -> SyncResult<Self> {
        let checkpoint_path = checkpoint_path.into();
        let checkpoint = SyncCheckpoint::load(&checkpoint_path, store.machine())?;
        let shared = SharedDir::new(shared_dir);

        Ok(SyncCoordinator {
            exporter: SyncExporter::new(store.clone(), shared.clone(), settings),
            importer: SyncImporter::new(store.clone(), shared.clone()),
            store,
            shared,
            checkpoint_path,
            checkpoint: Arc::new(Mutex::new(checkpoint)),
            phase: Arc::new(RwLock::new(SyncPhase::Idle)),
        })
    }

    pub fn machine(&self) -> &MachineId {
        self.store.machine()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn shared_dir(&self) -> &Path {
        self.shared.root()
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Current phase.
    pub async fn phase(&self) -> SyncPhase {
        *self.phase.read().await
    }

    /// Copy of the in-memory checkpoint.
    pub async fn checkpoint(&self) -> SyncCheckpoint {
        self.checkpoint.lock().await.clone()
    }

    async fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write().await = phase;
    }

    /// Runs export then import.
    ///
    /// Safe to call repeatedly and safe to interrupt; see the module docs.
    pub async fn sync_bidirectional(&self) -> SyncResult<SyncReport> {
        let mut checkpoint = self.checkpoint.lock().await;
        let result = self.run_cycle(&mut checkpoint).await;
        if result.is_err() {
            self.set_phase(SyncPhase::Idle).await;
        }
        result
    }

    async fn run_cycle(&self, checkpoint: &mut SyncCheckpoint) -> SyncResult<SyncReport> {
        info!(machine = %self.machine(), "Sync cycle starting");

        self.set_phase(SyncPhase::Recovering).await;
        if self.exporter.recover(checkpoint).await? {
            checkpoint.persist(&self.checkpoint_path).await?;
        }

        self.set_phase(SyncPhase::Exporting).await;
        let exported = self.drain_exports(checkpoint).await?;

        self.set_phase(SyncPhase::Importing).await;
        let import = self
            .importer
            .import_new(checkpoint, &self.checkpoint_path)
            .await?;

        let report = SyncReport { exported, import };
        checkpoint.last_sync_at = Some(Utc::now());
        checkpoint.last_cycle = Some(report.summary());
        checkpoint.persist(&self.checkpoint_path).await?;
        self.set_phase(SyncPhase::Done).await;

        info!(
            machine = %self.machine(),
            exported_batches = report.exported.len(),
            imported = report.import.inserted,
            malformed = report.import.malformed,
            unreadable = report.import.unreadable.len(),
            "Sync cycle finished"
        );
        Ok(report)
    }

    async fn drain_exports(&self, checkpoint: &mut SyncCheckpoint) -> SyncResult<Vec<BatchReceipt>> {
        let mut exported = Vec::new();
        while let Some(receipt) = self
            .exporter
            .export_pending(checkpoint, &self.checkpoint_path)
            .await?
        {
            exported.push(receipt);
        }
        Ok(exported)
    }

    /// Export only.
    pub async fn export_now(&self) -> SyncResult<Vec<BatchReceipt>> {
        let mut checkpoint = self.checkpoint.lock().await;
        if self.exporter.recover(&mut checkpoint).await? {
            checkpoint.persist(&self.checkpoint_path).await?;
        }
        self.drain_exports(&mut checkpoint).await
    }

    /// Import only. Used once at startup to pull peers' data.
    pub async fn import_now(&self) -> SyncResult<ImportReport> {
        let mut checkpoint = self.checkpoint.lock().await;
        if self.exporter.recover(&mut checkpoint).await? {
            checkpoint.persist(&self.checkpoint_path).await?;
        }
        self.importer
            .import_new(&mut checkpoint, &self.checkpoint_path)
            .await
    }

    /// Writes a full snapshot batch for onboarding new machines.
    pub async fn export_snapshot(&self) -> SyncResult<Option<BatchReceipt>> {
        let mut checkpoint = self.checkpoint.lock().await;
        if self.exporter.recover(&mut checkpoint).await? {
            checkpoint.persist(&self.checkpoint_path).await?;
        }
        self.exporter
            .export_snapshot(&mut checkpoint, &self.checkpoint_path)
            .await
    }

    /// Moves this machine's old batches into `archive/`.
    pub async fn archive(
        &self,
        retention_days: u32,
        keep_latest_snapshots: usize,
    ) -> SyncResult<ArchiveReport> {
        // Holding the checkpoint keeps archiving out of a running cycle.
        let _checkpoint = self.checkpoint.lock().await;
        archive_batches(&self.shared, self.machine(), retention_days, keep_latest_snapshots).await
    }

    /// Reports sync progress and per-peer lag.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let checkpoint = self.checkpoint().await;

        let mut peers: BTreeMap<MachineId, PeerLag> = checkpoint
            .imported
            .iter()
            .filter(|(machine, _)| *machine != self.machine())
            .map(|(machine, progress)| {
                let lag = PeerLag {
                    machine: machine.clone(),
                    imported_through: progress.contiguous,
                    highest_seen: progress.highest(),
                    missing: Vec::new(),
                };
                (machine.clone(), lag)
            })
            .collect();

        let shared_dir_available = match self.shared.list().await {
            Ok(files) => {
                for file in files.iter().filter(|f| &f.id.machine != self.machine()) {
                    let lag = peers.entry(file.id.machine.clone()).or_insert_with(|| PeerLag {
                        machine: file.id.machine.clone(),
                        imported_through: 0,
                        highest_seen: 0,
                        missing: Vec::new(),
                    });
                    lag.highest_seen = lag.highest_seen.max(file.id.seq);
                    if !checkpoint.is_imported(&file.id) {
                        lag.missing.push(file.id.seq);
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Shared folder unavailable while building status");
                false
            }
        };

        let status = SyncStatus {
            machine: self.machine().clone(),
            phase: self.phase().await,
            shared_dir: self.shared.root().to_path_buf(),
            shared_dir_available,
            local_records: self.store.count().await?,
            pending_export: self.exporter.pending_count(&checkpoint).await?,
            last_export_seq: checkpoint.last_export_seq,
            last_sync_at: checkpoint.last_sync_at,
            last_export_at: checkpoint.last_export_at,
            last_import_at: checkpoint.last_import_at,
            last_cycle: checkpoint.last_cycle.clone(),
            peers: peers.into_values().collect(),
        };

        debug!(
            pending_export = status.pending_export,
            peers = status.peers.len(),
            "Built sync status"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CHECKPOINT_FILE_NAME;
    use history_core::{HistoryFilter, NewRecord, RecordId};
    use history_db::DbConfig;
    use tempfile::TempDir;

    async fn coordinator(dir: &TempDir, shared: &Path, name: &str) -> SyncCoordinator {
        let machine = MachineId::new(name).unwrap();
        let home = dir.path().join(name);
        let store = LocalStore::open(DbConfig::new(home.join("history.db")), machine)
            .await
            .unwrap();
        SyncCoordinator::new(
            store,
            shared,
            home.join(CHECKPOINT_FILE_NAME),
            &SyncSettings::default(),
        )
        .unwrap()
    }

    fn shared_root(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("shared");
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[tokio::test]
    async fn test_cycle_exports_then_imports() {
        let dir = TempDir::new().unwrap();
        let shared = shared_root(&dir);
        let a = coordinator(&dir, &shared, "A").await;
        let b = coordinator(&dir, &shared, "B").await;

        a.store()
            .append(NewRecord::new(RecordId::new("a1").unwrap()).field("count", 5))
            .await
            .unwrap();

        let report = a.sync_bidirectional().await.unwrap();
        assert_eq!(report.exported_batch().unwrap().id.to_string(), "A-0001");
        assert_eq!(report.imported_count(), 0);
        assert_eq!(a.phase().await, SyncPhase::Done);

        let report = b.sync_bidirectional().await.unwrap();
        assert_eq!(report.imported_count(), 1);
        assert!(report.exported_batch().is_none());

        let records = b.store().query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(records[0].origin_machine.as_str(), "A");
    }

    #[tokio::test]
    async fn test_status_reports_lag_and_pending() {
        let dir = TempDir::new().unwrap();
        let shared = shared_root(&dir);
        let a = coordinator(&dir, &shared, "A").await;
        let b = coordinator(&dir, &shared, "B").await;

        for id in ["a1", "a2"] {
            a.store()
                .append(NewRecord::new(RecordId::new(id).unwrap()).field("count", 1))
                .await
                .unwrap();
        }
        let status = a.status().await.unwrap();
        assert_eq!(status.pending_export, 2);
        assert_eq!(status.local_records, 2);
        assert!(status.last_sync_at.is_none());

        a.sync_bidirectional().await.unwrap();
        assert_eq!(a.status().await.unwrap().pending_export, 0);

        let before = b.status().await.unwrap();
        assert_eq!(before.peers.len(), 1);
        assert_eq!(before.peers[0].missing, vec![1]);
        assert_eq!(before.peers[0].imported_through, 0);

        b.sync_bidirectional().await.unwrap();
        let after = b.status().await.unwrap();
        assert!(after.peers[0].missing.is_empty());
        assert_eq!(after.peers[0].imported_through, 1);
        assert_eq!(after.last_cycle.as_ref().unwrap().imported, 2);
        assert!(after.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_share_fails_cycle_and_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let a = coordinator(&dir, &dir.path().join("unmounted"), "A").await;

        let err = a.sync_bidirectional().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(a.phase().await, SyncPhase::Idle);

        let status = a.status().await.unwrap();
        assert!(!status.shared_dir_available);
    }

    #[tokio::test]
    async fn test_checkpoint_survives_restart() {
        let dir = TempDir::new().unwrap();
        let shared = shared_root(&dir);
        {
            let a = coordinator(&dir, &shared, "A").await;
            a.store()
                .append(NewRecord::new(RecordId::new("a1").unwrap()))
                .await
                .unwrap();
            a.sync_bidirectional().await.unwrap();
            a.store().close().await;
        }

        let a = coordinator(&dir, &shared, "A").await;
        assert_eq!(a.checkpoint().await.last_export_seq, 1);
        let report = a.sync_bidirectional().await.unwrap();
        assert!(report.exported.is_empty());
    }
}
