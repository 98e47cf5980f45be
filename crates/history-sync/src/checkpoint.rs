//! # Sync Checkpoint
//!
//! Durable sync progress for one machine, stored as JSON next to the local
//! database (`sync_checkpoint.json`).
//!
//! ## What Is Tracked
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncCheckpoint                                   │
//! │                                                                         │
//! │  last_export_seq   highest batch sequence this machine has produced    │
//! │                    (incremental and snapshot share the sequence)       │
//! │                                                                         │
//! │  export_cursor     highest local_seq already inside a batch file       │
//! │                                                                         │
//! │  imported          per peer: contiguous high-water mark + any          │
//! │                    out-of-order batches applied above it               │
//! │                                                                         │
//! │     B: contiguous=3 extra={5}   ──► B-0001..3 and B-0005 applied,      │
//! │                                     B-0004 still pending               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomic Writes
//! The file is written to a temporary file in the same directory and renamed
//! over the old one, so a crash leaves either the previous or the new
//! checkpoint, never a torn one.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use history_core::{BatchId, MachineId};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Checkpoint file name, placed next to the local database.
pub const CHECKPOINT_FILE_NAME: &str = "sync_checkpoint.json";

/// Current checkpoint layout version.
pub const CHECKPOINT_VERSION: u32 = 1;

// =============================================================================
// Per-Peer Progress
// =============================================================================

/// Which of one peer's batches have been applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProgress {
    /// Every batch `1..=contiguous` has been applied.
    pub contiguous: u64,

    /// Applied batches above `contiguous`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub extra: BTreeSet<u64>,
}

impl PeerProgress {
    /// Returns true if batch `seq` has been applied.
    pub fn contains(&self, seq: u64) -> bool {
        seq <= self.contiguous || self.extra.contains(&seq)
    }

    /// Marks batch `seq` as applied, folding `extra` into the high-water mark.
    pub fn mark(&mut self, seq: u64) {
        if self.contains(seq) {
            return;
        }
        self.extra.insert(seq);
        while self.extra.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }

    /// Highest applied batch sequence.
    pub fn highest(&self) -> u64 {
        self.extra
            .iter()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.contiguous)
    }
}

// =============================================================================
// Cycle Summary
// =============================================================================

/// Counts from the most recent sync cycle, kept for `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub imported: usize,
    pub duplicates: usize,
    pub malformed_records: usize,
    pub unreadable_batches: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_batch: Option<String>,
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Persisted sync state for one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub version: u32,
    pub machine_id: MachineId,

    #[serde(default)]
    pub last_export_seq: u64,

    #[serde(default)]
    pub export_cursor: i64,

    #[serde(default)]
    pub imported: BTreeMap<MachineId, PeerProgress>,

    /// This machine's own batches up to here are imported again, after the
    /// local store was rebuilt underneath the checkpoint.
    #[serde(default)]
    pub restore_own_through: u64,

    #[serde(default)]
    pub last_export_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_import_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_cycle: Option<CycleSummary>,
}

impl SyncCheckpoint {
    /// Fresh checkpoint for a machine that has never synced.
    pub fn new(machine_id: MachineId) -> Self {
        SyncCheckpoint {
            version: CHECKPOINT_VERSION,
            machine_id,
            last_export_seq: 0,
            export_cursor: 0,
            imported: BTreeMap::new(),
            restore_own_through: 0,
            last_export_at: None,
            last_import_at: None,
            last_sync_at: None,
            last_cycle: None,
        }
    }

    /// Loads the checkpoint at `path`, or a fresh one if the file is absent.
    ///
    /// ## Errors
    /// - `CheckpointCorrupt` if the file cannot be parsed
    /// - `CheckpointMismatch` if it was written by a different machine
    pub fn load(path: &Path, machine_id: &MachineId) -> SyncResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No sync checkpoint yet, starting fresh");
                return Ok(Self::new(machine_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: SyncCheckpoint =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(SyncError::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", checkpoint.version),
            });
        }

        if &checkpoint.machine_id != machine_id {
            return Err(SyncError::CheckpointMismatch {
                expected: machine_id.to_string(),
                found: checkpoint.machine_id.to_string(),
            });
        }

        debug!(
            path = %path.display(),
            last_export_seq = checkpoint.last_export_seq,
            export_cursor = checkpoint.export_cursor,
            peers = checkpoint.imported.len(),
            "Loaded sync checkpoint"
        );
        Ok(checkpoint)
    }

    /// Writes the checkpoint atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::Internal(format!("checkpoint encode: {}", e)))?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    /// Same as [`save`](Self::save), off the async executor.
    pub async fn persist(&self, path: &Path) -> SyncResult<()> {
        let snapshot = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || snapshot.save(&path))
            .await
            .map_err(|e| SyncError::Internal(format!("checkpoint task failed: {}", e)))?
    }

    /// Returns true if this batch has already been applied.
    pub fn is_imported(&self, batch: &BatchId) -> bool {
        self.imported
            .get(&batch.machine)
            .is_some_and(|progress| progress.contains(batch.seq))
    }

    /// Whether the importer should apply this batch: any peer batch not yet
    /// applied, plus own batches being restored after a store rebuild.
    pub fn wants_batch(&self, batch: &BatchId) -> bool {
        if batch.machine == self.machine_id && batch.seq > self.restore_own_through {
            return false;
        }
        !self.is_imported(batch)
    }

    /// Aligns the export cursor with the store it describes.
    ///
    /// The cursor can only be ahead of the store's highest `local_seq` when
    /// the database was replaced (deleted, restored from backup, rebuilt
    /// after corruption) and the checkpoint kept. Exporting then restarts
    /// from the beginning, own batches already published are queued for
    /// re-import, and `last_export_seq` stays so no batch name is reused.
    ///
    /// Returns true if the checkpoint changed.
    pub fn rebase_on_store(&mut self, max_local_seq: i64) -> bool {
        if self.export_cursor <= max_local_seq {
            return false;
        }

        warn!(
            export_cursor = self.export_cursor,
            max_local_seq,
            last_export_seq = self.last_export_seq,
            "Local store is behind the sync checkpoint; re-exporting and restoring own batches"
        );
        self.export_cursor = 0;
        self.restore_own_through = self.restore_own_through.max(self.last_export_seq);
        self.imported.remove(&self.machine_id);
        true
    }

    /// Marks a batch as applied.
    pub fn mark_imported(&mut self, batch: &BatchId, at: DateTime<Utc>) {
        self.imported
            .entry(batch.machine.clone())
            .or_default()
            .mark(batch.seq);
        self.last_import_at = Some(at);
    }

    /// Records a written incremental batch.
    pub fn record_export(&mut self, seq: u64, cursor: i64, at: DateTime<Utc>) {
        self.last_export_seq = self.last_export_seq.max(seq);
        self.export_cursor = self.export_cursor.max(cursor);
        self.last_export_at = Some(at);
    }

    /// Next batch sequence number for this machine.
    pub fn next_export_seq(&self) -> u64 {
        self.last_export_seq + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    #[test]
    fn test_peer_progress_folds_out_of_order_batches() {
        let mut progress = PeerProgress::default();
        progress.mark(2);
        assert!(!progress.contains(1));
        assert!(progress.contains(2));
        assert_eq!(progress.contiguous, 0);
        assert_eq!(progress.highest(), 2);

        progress.mark(1);
        assert_eq!(progress.contiguous, 2);
        assert!(progress.extra.is_empty());

        progress.mark(1);
        assert_eq!(progress.contiguous, 2);
    }

    #[test]
    fn test_rebase_after_store_rebuild() {
        let mut checkpoint = SyncCheckpoint::new(machine("A"));
        checkpoint.record_export(2, 40, Utc::now());
        checkpoint.mark_imported(&BatchId::new(machine("B"), 1), Utc::now());
        let own = BatchId::new(machine("A"), 1);

        assert!(!checkpoint.rebase_on_store(40));
        assert!(!checkpoint.wants_batch(&own));

        assert!(checkpoint.rebase_on_store(3));
        assert_eq!(checkpoint.export_cursor, 0);
        assert_eq!(checkpoint.next_export_seq(), 3);
        assert_eq!(checkpoint.restore_own_through, 2);

        // Own batches are wanted once, then count as imported.
        assert!(checkpoint.wants_batch(&own));
        assert!(!checkpoint.wants_batch(&BatchId::new(machine("A"), 3)));
        checkpoint.mark_imported(&own, Utc::now());
        assert!(!checkpoint.wants_batch(&own));

        // Peer progress is untouched.
        assert!(!checkpoint.wants_batch(&BatchId::new(machine("B"), 1)));
        assert!(checkpoint.wants_batch(&BatchId::new(machine("B"), 2)));
    }

    #[test]
    fn test_missing_file_gives_fresh_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);

        let checkpoint = SyncCheckpoint::load(&path, &machine("A")).unwrap();
        assert_eq!(checkpoint.last_export_seq, 0);
        assert_eq!(checkpoint.next_export_seq(), 1);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);

        let mut checkpoint = SyncCheckpoint::new(machine("A"));
        checkpoint.record_export(1, 2, Utc::now());
        checkpoint.mark_imported(&BatchId::new(machine("B"), 1), Utc::now());
        checkpoint.mark_imported(&BatchId::new(machine("B"), 3), Utc::now());
        checkpoint.save(&path).unwrap();

        let loaded = SyncCheckpoint::load(&path, &machine("A")).unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.is_imported(&BatchId::new(machine("B"), 1)));
        assert!(!loaded.is_imported(&BatchId::new(machine("B"), 2)));
        assert!(loaded.is_imported(&BatchId::new(machine("B"), 3)));
        assert!(!loaded.is_imported(&BatchId::new(machine("C"), 1)));
    }

    #[test]
    fn test_machine_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        SyncCheckpoint::new(machine("A")).save(&path).unwrap();

        let err = SyncCheckpoint::load(&path, &machine("B")).unwrap_err();
        assert!(matches!(err, SyncError::CheckpointMismatch { .. }));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        std::fs::write(&path, b"{\"version\": 1, \"machine_id\"").unwrap();

        let err = SyncCheckpoint::load(&path, &machine("A")).unwrap_err();
        assert!(matches!(err, SyncError::CheckpointCorrupt { .. }));
    }

    #[tokio::test]
    async fn test_persist_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);

        let mut checkpoint = SyncCheckpoint::new(machine("A"));
        checkpoint.persist(&path).await.unwrap();
        checkpoint.record_export(4, 40, Utc::now());
        checkpoint.persist(&path).await.unwrap();

        let loaded = SyncCheckpoint::load(&path, &machine("A")).unwrap();
        assert_eq!(loaded.last_export_seq, 4);
        assert_eq!(loaded.export_cursor, 40);

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
