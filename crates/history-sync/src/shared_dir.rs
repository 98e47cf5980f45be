//! # Shared Folder Access
//!
//! The only code that touches the shared folder. Machines add files here and
//! move their own old files into `archive/`; nothing is ever edited in place
//! and nothing belonging to another machine is ever moved or deleted.
//!
//! ## Layout
//! ```text
//! <shared_dir>/
//! ├── A-0001.batch.jsonl
//! ├── A-0002.snapshot.jsonl
//! ├── B-0001.batch.jsonl
//! ├── .tmpXyZ12.part          ◄── in-flight write, never matched
//! └── archive/
//!     └── A-0000…             ◄── still read by importers
//! ```
//!
//! ## Atomic Visibility
//! A batch is written to a hidden temp file in the same directory, synced,
//! then renamed to its final name with no-clobber semantics. Importers list
//! by final name only, so they see the whole file or nothing.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use history_core::{batch_file_name, parse_batch_file_name, BatchId, BatchKind};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Subdirectory holding archived batches.
pub const ARCHIVE_DIR: &str = "archive";

/// One batch file found in the shared folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub id: BatchId,
    pub kind: BatchKind,
    pub path: PathBuf,
    pub archived: bool,
    pub modified: Option<SystemTime>,
}

impl BatchFile {
    /// File name without directory.
    pub fn file_name(&self) -> String {
        batch_file_name(&self.id, self.kind)
    }
}

/// Handle to the shared folder.
#[derive(Debug, Clone)]
pub struct SharedDir {
    root: PathBuf,
}

impl SharedDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SharedDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    /// Whether the shared folder is currently reachable.
    pub async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn unavailable(&self, reason: impl ToString) -> SyncError {
        SyncError::SharedDirUnavailable {
            path: self.root.clone(),
            reason: reason.to_string(),
        }
    }

    /// Lists every batch file in the root and in `archive/`, sorted by
    /// author machine then sequence.
    ///
    /// A batch present in both places (a copy left behind by a file-sync
    /// client) is listed once, preferring the root.
    pub async fn list(&self) -> SyncResult<Vec<BatchFile>> {
        let mut found: BTreeMap<BatchId, BatchFile> = BTreeMap::new();

        let archived = match scan(&self.archive_dir(), true).await {
            Ok(files) => files,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Cannot list archive folder, skipping it this cycle");
                Vec::new()
            }
        };
        for file in archived {
            found.insert(file.id.clone(), file);
        }

        let current = scan(&self.root, false)
            .await
            .map_err(|e| self.unavailable(e))?;
        for file in current {
            found.insert(file.id.clone(), file);
        }

        debug!(root = %self.root.display(), batches = found.len(), "Listed shared folder");
        Ok(found.into_values().collect())
    }

    /// Reads a batch file, following it into `archive/` if it was moved after
    /// being listed.
    pub async fn read(&self, file: &BatchFile) -> std::io::Result<Vec<u8>> {
        match tokio::fs::read(&file.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !file.archived => {
                tokio::fs::read(self.archive_dir().join(file.file_name())).await
            }
            other => other,
        }
    }

    /// Reads just the first line of a batch file.
    pub async fn read_head(&self, file: &BatchFile) -> std::io::Result<Vec<u8>> {
        let bytes = self.read(file).await?;
        let end = bytes
            .iter()
            .position(|b| *b == b'\n')
            .map_or(bytes.len(), |i| i + 1);
        Ok(bytes[..end].to_vec())
    }

    /// Publishes a batch file atomically. Fails if a file with that name
    /// already exists.
    pub async fn write_batch(
        &self,
        id: &BatchId,
        kind: BatchKind,
        bytes: Vec<u8>,
    ) -> SyncResult<PathBuf> {
        if !self.is_available().await {
            return Err(self.unavailable("folder does not exist"));
        }

        let root = self.root.clone();
        let target = root.join(batch_file_name(id, kind));
        let batch = id.to_string();

        tokio::task::spawn_blocking(move || -> SyncResult<PathBuf> {
            let failed = |reason: String| SyncError::BatchWriteFailed {
                batch: batch.clone(),
                reason,
            };

            let mut tmp = tempfile::Builder::new()
                .prefix(".tmp")
                .suffix(".part")
                .tempfile_in(&root)
                .map_err(|e| failed(e.to_string()))?;
            tmp.write_all(&bytes).map_err(|e| failed(e.to_string()))?;
            tmp.as_file().sync_all().map_err(|e| failed(e.to_string()))?;
            tmp.persist_noclobber(&target)
                .map_err(|e| failed(e.error.to_string()))?;
            Ok(target)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("batch write task failed: {}", e)))?
    }

    /// Moves a batch file into `archive/`. Returns the new path, or `None` if
    /// an archived copy already exists (the original is left alone).
    pub async fn archive(&self, file: &BatchFile) -> SyncResult<Option<PathBuf>> {
        let dir = self.archive_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let target = dir.join(file.file_name());
        if tokio::fs::try_exists(&target).await? {
            return Ok(None);
        }
        tokio::fs::rename(&file.path, &target).await?;
        Ok(Some(target))
    }
}

/// Lists batch files directly inside `dir`, ignoring everything else.
async fn scan(dir: &Path, archived: bool) -> std::io::Result<Vec<BatchFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((id, kind)) = parse_batch_file_name(name) else {
            continue;
        };

        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };

        files.push(BatchFile {
            id,
            kind,
            path: entry.path(),
            archived,
            modified: metadata.modified().ok(),
        });
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_core::MachineId;

    fn id(machine: &str, seq: u64) -> BatchId {
        BatchId::new(MachineId::new(machine).unwrap(), seq)
    }

    #[tokio::test]
    async fn test_write_then_list_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());

        shared.write_batch(&id("B", 1), BatchKind::Incremental, b"b1\n".to_vec()).await.unwrap();
        shared.write_batch(&id("A", 2), BatchKind::Snapshot, b"a2\n".to_vec()).await.unwrap();
        shared.write_batch(&id("A", 1), BatchKind::Incremental, b"a1\n".to_vec()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.path().join("A-0003.batch.jsonl.part"), b"ignored").unwrap();

        let files = shared.list().await.unwrap();
        let names: Vec<String> = files.iter().map(BatchFile::file_name).collect();
        assert_eq!(
            names,
            vec!["A-0001.batch.jsonl", "A-0002.snapshot.jsonl", "B-0001.batch.jsonl"]
        );
    }

    #[tokio::test]
    async fn test_write_never_clobbers() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());

        shared.write_batch(&id("A", 1), BatchKind::Incremental, b"first\n".to_vec()).await.unwrap();
        let err = shared
            .write_batch(&id("A", 1), BatchKind::Incremental, b"second\n".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BatchWriteFailed { .. }));

        let file = &shared.list().await.unwrap()[0];
        assert_eq!(shared.read(file).await.unwrap(), b"first\n");

        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path().join("not-mounted"));

        assert!(!shared.is_available().await);
        let err = shared.list().await.unwrap_err();
        assert!(matches!(err, SyncError::SharedDirUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_archived_files_still_listed_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        shared.write_batch(&id("A", 1), BatchKind::Incremental, b"a1\n".to_vec()).await.unwrap();

        let listed = shared.list().await.unwrap();
        let moved = shared.archive(&listed[0]).await.unwrap();
        assert!(moved.is_some());

        // The stale listing still reads through to the archive.
        assert_eq!(shared.read(&listed[0]).await.unwrap(), b"a1\n");

        let relisted = shared.list().await.unwrap();
        assert_eq!(relisted.len(), 1);
        assert!(relisted[0].archived);
    }
}
