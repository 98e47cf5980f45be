//! # Sync Exporter
//!
//! Turns newly appended local records into immutable batch files in the
//! shared folder.
//!
//! ## Export Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         export_pending                                  │
//! │                                                                         │
//! │  checkpoint.export_cursor = 40                                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  LocalStore.all_unexported_since(40, max_batch_records)                │
//! │       │        (empty? ──► no-op, no batch)                            │
//! │       ▼                                                                 │
//! │  encode header + records + trailer                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SharedDir.write_batch("A-0007.batch.jsonl")   temp + rename           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  checkpoint: last_export_seq = 7, export_cursor = last local_seq       │
//! │  persisted atomically                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crash Recovery
//! A crash between the rename and the checkpoint write leaves a batch file
//! the checkpoint does not know about. [`SyncExporter::recover`] finds this
//! machine's files numbered above `last_export_seq`, reads their headers and
//! moves the checkpoint forward, so the same records are not exported twice
//! and the sequence number is not reused.
//!
//! ## Rebuilt Store
//! If the database was replaced while the checkpoint survived, the export
//! cursor points past the store's last `local_seq`. `recover` restarts the
//! cursor at zero and queues this machine's published batches for re-import
//! (see [`SyncCheckpoint::rebase_on_store`]).

use std::path::{Path, PathBuf};

use chrono::Utc;
use history_core::{decode_header, encode_batch, BatchHeader, BatchId, BatchKind, HistoryFilter};
use history_db::{LocalStore, StoredRecord};
use tracing::{debug, info, warn};

use crate::checkpoint::SyncCheckpoint;
use crate::config::SyncSettings;
use crate::error::SyncResult;
use crate::shared_dir::SharedDir;

/// A batch file this machine wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReceipt {
    pub id: BatchId,
    pub kind: BatchKind,
    pub path: PathBuf,
    pub records: usize,
    pub first_local_seq: Option<i64>,
    pub last_local_seq: Option<i64>,
}

/// Writes this machine's batches.
#[derive(Debug, Clone)]
pub struct SyncExporter {
    store: LocalStore,
    shared: SharedDir,
    max_batch_records: usize,
    relay_imported: bool,
}

impl SyncExporter {
    pub fn new(store: LocalStore, shared: SharedDir, settings: &SyncSettings) -> Self {
        SyncExporter {
            store,
            shared,
            max_batch_records: settings.max_batch_records.max(1),
            relay_imported: settings.relay_imported,
        }
    }

    /// Whether records imported from peers are exported again.
    pub fn relays_imported(&self) -> bool {
        self.relay_imported
    }

    /// Re-derives export progress from batch files already in the shared
    /// folder. Returns true if the checkpoint moved.
    pub async fn recover(&self, checkpoint: &mut SyncCheckpoint) -> SyncResult<bool> {
        let machine = self.store.machine();
        let mut changed = checkpoint.rebase_on_store(self.store.max_local_seq().await?);

        for file in self.shared.list().await? {
            if &file.id.machine != machine || file.id.seq <= checkpoint.last_export_seq {
                continue;
            }

            let header = match self.shared.read_head(&file).await {
                Ok(bytes) => decode_header(&bytes),
                Err(e) => {
                    warn!(batch = %file.id, error = %e, "Cannot read own batch during recovery");
                    // Still never reuse its sequence number.
                    checkpoint.last_export_seq = checkpoint.last_export_seq.max(file.id.seq);
                    changed = true;
                    continue;
                }
            };

            checkpoint.last_export_seq = checkpoint.last_export_seq.max(file.id.seq);
            changed = true;

            match header {
                Ok(BatchHeader {
                    kind: BatchKind::Incremental,
                    last_local_seq: Some(last),
                    ..
                }) => {
                    checkpoint.export_cursor = checkpoint.export_cursor.max(last);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(batch = %file.id, error = %e, "Own batch has unreadable header");
                }
            }

            info!(
                batch = %file.id,
                export_cursor = checkpoint.export_cursor,
                "Recovered export progress from existing batch file"
            );
        }

        Ok(changed)
    }

    /// Exports up to `max_batch_records` unexported records as one batch.
    ///
    /// Returns `None` without touching the shared folder when there is
    /// nothing to export.
    pub async fn export_pending(
        &self,
        checkpoint: &mut SyncCheckpoint,
        checkpoint_path: &Path,
    ) -> SyncResult<Option<BatchReceipt>> {
        let pending: Vec<StoredRecord> = self
            .store
            .all_unexported_since(
                checkpoint.export_cursor,
                self.max_batch_records,
                self.relay_imported,
            )
            .await?;

        let (Some(first), Some(last)) = (pending.first(), pending.last()) else {
            debug!(cursor = checkpoint.export_cursor, "Nothing to export");
            return Ok(None);
        };
        let (first_seq, last_seq) = (first.local_seq, last.local_seq);

        let id = BatchId::new(self.store.machine().clone(), checkpoint.next_export_seq());
        let now = Utc::now();
        let header =
            BatchHeader::new(&id, BatchKind::Incremental, now).with_local_range(first_seq, last_seq);
        let records: Vec<_> = pending.into_iter().map(|stored| stored.record).collect();

        let bytes = encode_batch(&header, &records)?;
        let path = self
            .shared
            .write_batch(&id, BatchKind::Incremental, bytes)
            .await?;

        checkpoint.record_export(id.seq, last_seq, now);
        checkpoint.persist(checkpoint_path).await?;

        info!(
            batch = %id,
            records = records.len(),
            first_local_seq = first_seq,
            last_local_seq = last_seq,
            "Exported batch"
        );

        Ok(Some(BatchReceipt {
            id,
            kind: BatchKind::Incremental,
            path,
            records: records.len(),
            first_local_seq: Some(first_seq),
            last_local_seq: Some(last_seq),
        }))
    }

    /// Writes every stored record as one snapshot batch for onboarding new
    /// machines. Uses the next sequence number but leaves the incremental
    /// export cursor where it is.
    pub async fn export_snapshot(
        &self,
        checkpoint: &mut SyncCheckpoint,
        checkpoint_path: &Path,
    ) -> SyncResult<Option<BatchReceipt>> {
        let records = self.store.query(HistoryFilter::all()).collect_all().await?;
        if records.is_empty() {
            debug!("Store is empty, no snapshot written");
            return Ok(None);
        }

        let id = BatchId::new(self.store.machine().clone(), checkpoint.next_export_seq());
        let now = Utc::now();
        let header = BatchHeader::new(&id, BatchKind::Snapshot, now);

        let bytes = encode_batch(&header, &records)?;
        let path = self.shared.write_batch(&id, BatchKind::Snapshot, bytes).await?;

        checkpoint.last_export_seq = id.seq;
        checkpoint.last_export_at = Some(now);
        checkpoint.persist(checkpoint_path).await?;

        info!(batch = %id, records = records.len(), "Exported snapshot");

        Ok(Some(BatchReceipt {
            id,
            kind: BatchKind::Snapshot,
            path,
            records: records.len(),
            first_local_seq: None,
            last_local_seq: None,
        }))
    }

    /// Records waiting for export.
    pub async fn pending_count(&self, checkpoint: &SyncCheckpoint) -> SyncResult<i64> {
        Ok(self
            .store
            .count_since(checkpoint.export_cursor, self.relay_imported)
            .await?)
    }
}
