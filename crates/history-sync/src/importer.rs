//! # Sync Importer
//!
//! Applies peers' batch files to the local store.
//!
//! ## Import Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           import_new                                    │
//! │                                                                         │
//! │  SharedDir.list()  (root + archive/, sorted by machine, seq)           │
//! │       │                                                                 │
//! │       ├── own batch (unless restoring) ──────► skip                    │
//! │       ├── already in checkpoint ─────────────► skip                    │
//! │       ▼                                                                 │
//! │  read + decode_batch                                                   │
//! │       ├── unreadable (torn, still syncing) ──► report, retry next cycle│
//! │       ▼                                                                 │
//! │  malformed lines ──► counted + logged, rest of batch continues         │
//! │       ▼                                                                 │
//! │  LocalStore.append_batch(records, imported_from = "B-0003")            │
//! │       (duplicates by identity are no-ops)                              │
//! │       ▼                                                                 │
//! │  checkpoint.mark_imported(B-0003), persisted                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A store error (corruption, disk full) stops the import and is returned.
//! Everything at record or batch level is counted in the report instead.

use std::path::Path;

use chrono::Utc;
use history_core::{decode_batch, BatchId};
use history_db::LocalStore;
use tracing::{debug, info, warn};

use crate::checkpoint::SyncCheckpoint;
use crate::error::{SyncError, SyncResult};
use crate::shared_dir::{BatchFile, SharedDir};

/// Outcome of one import pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Records newly inserted into the local store.
    pub inserted: usize,
    /// Records already present (by identity).
    pub duplicates: usize,
    /// Record lines skipped because they failed to decode.
    pub malformed: usize,
    /// Batches left for the next cycle, with the reason.
    pub unreadable: Vec<String>,
    /// Batches applied and marked in the checkpoint.
    pub batches_applied: usize,
}

impl ImportReport {
    pub fn unreadable_count(&self) -> usize {
        self.unreadable.len()
    }
}

/// Reads peers' batches into this machine's store.
#[derive(Debug, Clone)]
pub struct SyncImporter {
    store: LocalStore,
    shared: SharedDir,
}

impl SyncImporter {
    pub fn new(store: LocalStore, shared: SharedDir) -> Self {
        SyncImporter { store, shared }
    }

    /// Applies every peer batch not yet recorded in the checkpoint.
    ///
    /// The checkpoint is persisted after each applied batch, so an
    /// interrupted pass resumes where it stopped.
    pub async fn import_new(
        &self,
        checkpoint: &mut SyncCheckpoint,
        checkpoint_path: &Path,
    ) -> SyncResult<ImportReport> {
        let mut report = ImportReport::default();

        let candidates: Vec<BatchFile> = self
            .shared
            .list()
            .await?
            .into_iter()
            .filter(|file| checkpoint.wants_batch(&file.id))
            .collect();

        if candidates.is_empty() {
            debug!("No new batches to import");
            return Ok(report);
        }

        for file in candidates {
            match self.apply(&file, &mut report).await {
                Ok(()) => {
                    checkpoint.mark_imported(&file.id, Utc::now());
                    checkpoint.persist(checkpoint_path).await?;
                    report.batches_applied += 1;
                }
                Err(SyncError::BatchUnreadable { file: name, reason }) => {
                    warn!(batch = %name, reason = %reason, "Batch unreadable, will retry next cycle");
                    report.unreadable.push(format!("{}: {}", name, reason));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            batches = report.batches_applied,
            inserted = report.inserted,
            duplicates = report.duplicates,
            malformed = report.malformed,
            unreadable = report.unreadable.len(),
            "Import pass finished"
        );
        Ok(report)
    }

    /// Decodes and applies one batch file.
    async fn apply(&self, file: &BatchFile, report: &mut ImportReport) -> SyncResult<()> {
        let name = file.file_name();
        let unreadable = |reason: String| SyncError::BatchUnreadable {
            file: name.clone(),
            reason,
        };

        let bytes = self
            .shared
            .read(file)
            .await
            .map_err(|e| unreadable(e.to_string()))?;
        let decoded = decode_batch(&bytes).map_err(|e| unreadable(e.to_string()))?;

        let announced: BatchId = decoded.header.batch_id();
        if announced != file.id || decoded.header.kind != file.kind {
            return Err(unreadable(format!(
                "header names {} ({}), file name says {} ({})",
                announced, decoded.header.kind, file.id, file.kind
            )));
        }

        for reason in &decoded.malformed {
            warn!(batch = %name, reason = %reason, "Skipping malformed record");
        }
        report.malformed += decoded.malformed.len();

        let source = file.id.to_string();
        let summary = self
            .store
            .append_batch(&decoded.records, Some(source.as_str()))
            .await?;

        report.inserted += summary.inserted;
        report.duplicates += summary.duplicates;

        debug!(
            batch = %name,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            malformed = decoded.malformed.len(),
            "Applied batch"
        );
        Ok(())
    }
}
