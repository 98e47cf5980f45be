//! # Shared Folder Archiving
//!
//! Keeps the shared folder listing short by moving this machine's old batch
//! files into `archive/`. Nothing is deleted and peers' files are never
//! touched. Importers read `archive/` as well, so a machine that comes back
//! after months still receives everything.

use std::time::{Duration, SystemTime};

use history_core::{BatchKind, MachineId};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::shared_dir::{BatchFile, SharedDir};

/// Counts from one archive pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Own files considered.
    pub scanned: usize,
    pub archived: usize,
    /// Kept: too recent, newest snapshot, or already archived copy exists.
    pub skipped: usize,
    pub errors: usize,
}

/// Archives `machine`'s batch files older than `retention_days`, always
/// keeping the newest `keep_latest_snapshots` snapshots in place.
pub async fn archive_batches(
    shared: &SharedDir,
    machine: &MachineId,
    retention_days: u32,
    keep_latest_snapshots: usize,
) -> SyncResult<ArchiveReport> {
    let retention = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let own: Vec<BatchFile> = shared
        .list()
        .await?
        .into_iter()
        .filter(|file| &file.id.machine == machine && !file.archived)
        .collect();

    // Newest snapshots by sequence number.
    let mut snapshot_seqs: Vec<u64> = own
        .iter()
        .filter(|file| file.kind == BatchKind::Snapshot)
        .map(|file| file.id.seq)
        .collect();
    snapshot_seqs.sort_unstable_by(|a, b| b.cmp(a));
    snapshot_seqs.truncate(keep_latest_snapshots);

    let mut report = ArchiveReport::default();
    for file in &own {
        report.scanned += 1;

        let protected = file.kind == BatchKind::Snapshot && snapshot_seqs.contains(&file.id.seq);
        let old_enough = file.modified.is_some_and(|modified| modified <= cutoff);
        if protected || !old_enough {
            report.skipped += 1;
            continue;
        }

        match shared.archive(file).await {
            Ok(Some(target)) => {
                debug!(batch = %file.id, target = %target.display(), "Archived batch");
                report.archived += 1;
            }
            Ok(None) => {
                warn!(batch = %file.id, "Archived copy already exists, leaving original");
                report.skipped += 1;
            }
            Err(e) => {
                warn!(batch = %file.id, error = %e, "Failed to archive batch");
                report.errors += 1;
            }
        }
    }

    info!(
        machine = %machine,
        scanned = report.scanned,
        archived = report.archived,
        skipped = report.skipped,
        errors = report.errors,
        "Archive pass finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_core::BatchId;

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    async fn write(shared: &SharedDir, origin: &str, seq: u64, kind: BatchKind) {
        shared
            .write_batch(&BatchId::new(machine(origin), seq), kind, b"x\n".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_retention_archives_own_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        write(&shared, "A", 1, BatchKind::Incremental).await;
        write(&shared, "A", 2, BatchKind::Snapshot).await;
        write(&shared, "A", 3, BatchKind::Snapshot).await;
        write(&shared, "B", 1, BatchKind::Incremental).await;

        let report = archive_batches(&shared, &machine("A"), 0, 1).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.archived, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);

        assert!(dir.path().join("A-0003.snapshot.jsonl").exists());
        assert!(dir.path().join("B-0001.batch.jsonl").exists());
        assert!(dir.path().join("archive").join("A-0001.batch.jsonl").exists());
        assert!(dir.path().join("archive").join("A-0002.snapshot.jsonl").exists());

        // Everything is still listed for importers.
        assert_eq!(shared.list().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_recent_files_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        write(&shared, "A", 1, BatchKind::Incremental).await;

        let report = archive_batches(&shared, &machine("A"), 30, 1).await.unwrap();
        assert_eq!(report.archived, 0);
        assert_eq!(report.skipped, 1);
    }
}
