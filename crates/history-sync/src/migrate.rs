//! # Legacy Migration
//!
//! Copies everything from a legacy shared database file into this machine's
//! local store. Safe to run any number of times: rows already present by
//! identity are counted as duplicates and left alone.
//!
//! Two layouts are read when present:
//! - `history_records`: the current record table (files that were already
//!   written through the guarded shared mode)
//! - `history_rows`: the original flat table, one row per card action

use std::path::Path;

use chrono::Utc;
use history_core::MachineId;
use history_db::guard::{has_record_table, open_read_only};
use history_db::repository::legacy::{has_table, read_legacy_page, LEGACY_TABLE};
use history_db::{HistoryRepository, LocalStore};
use tracing::info;

use crate::error::SyncResult;

/// Rows read per page.
const MIGRATION_PAGE_SIZE: usize = 500;

/// Counts from one migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub scanned: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

/// Imports every record from the legacy file at `shared_path`.
///
/// Rows from `history_rows` get `legacy_origin` as their origin machine.
pub async fn migrate_legacy(
    store: &LocalStore,
    shared_path: &Path,
    legacy_origin: &MachineId,
) -> SyncResult<MigrationReport> {
    info!(path = %shared_path.display(), "Migrating legacy shared history");

    let pool = open_read_only(shared_path).await?;
    let source = format!("legacy:{}", shared_path.display());
    let mut report = MigrationReport::default();

    if has_record_table(&pool).await? {
        let repo = HistoryRepository::new(pool.clone());
        let mut after = 0;
        loop {
            let page = repo.fetch_since(after, MIGRATION_PAGE_SIZE, true).await?;
            let Some(last) = page.last() else { break };
            after = last.local_seq;

            let records: Vec<_> = page.into_iter().map(|stored| stored.record).collect();
            report.scanned += records.len();
            let summary = store.append_batch(&records, Some(source.as_str())).await?;
            report.inserted += summary.inserted;
            report.duplicates += summary.duplicates;
        }
    }

    if has_table(&pool, LEGACY_TABLE).await? {
        let fallback_at = Utc::now();
        let mut after = 0;
        loop {
            let page = read_legacy_page(
                &pool,
                after,
                MIGRATION_PAGE_SIZE,
                legacy_origin,
                fallback_at,
            )
            .await?;
            let Some((last_row, _)) = page.last() else { break };
            after = *last_row;

            let records: Vec<_> = page.into_iter().map(|(_, record)| record).collect();
            report.scanned += records.len();
            let summary = store.append_batch(&records, Some(source.as_str())).await?;
            report.inserted += summary.inserted;
            report.duplicates += summary.duplicates;
        }
    }

    pool.close().await;

    info!(
        scanned = report.scanned,
        inserted = report.inserted,
        duplicates = report.duplicates,
        "Legacy migration finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_core::{HistoryFilter, NewRecord, RecordId};
    use history_db::{DbConfig, GuardConfig, SharedStore};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    async fn local(dir: &TempDir) -> LocalStore {
        LocalStore::open(DbConfig::new(dir.path().join("local.db")), machine("B"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_migrates_current_layout_idempotently() {
        let dir = TempDir::new().unwrap();
        let shared_path = dir.path().join("shared.db");

        let shared = SharedStore::open(&shared_path, GuardConfig::default(), machine("A"))
            .await
            .unwrap();
        shared
            .append(NewRecord::new(RecordId::new("a1").unwrap()).field("count", 5))
            .await
            .unwrap();
        shared
            .append(NewRecord::new(RecordId::new("a2").unwrap()).field("count", 7))
            .await
            .unwrap();
        shared.close().await;

        let store = local(&dir).await;
        let first = migrate_legacy(&store, &shared_path, &machine("legacy")).await.unwrap();
        assert_eq!(first, MigrationReport { scanned: 2, inserted: 2, duplicates: 0 });

        let second = migrate_legacy(&store, &shared_path, &machine("legacy")).await.unwrap();
        assert_eq!(second, MigrationReport { scanned: 2, inserted: 0, duplicates: 2 });

        let records = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.origin_machine.as_str() == "A"));
    }

    #[tokio::test]
    async fn test_migrates_original_row_table() {
        let dir = TempDir::new().unwrap();
        let shared_path = dir.path().join("old.db");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&shared_path)
                    .create_if_missing(true),
            )
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE history_rows (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                save_id TEXT, saved_at TEXT,
                card_index TEXT, detail_index TEXT, action_index TEXT,
                link_up TEXT, func_location TEXT, date_field TEXT, shift TEXT,
                user TEXT, issue TEXT, detail TEXT, action TEXT
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO history_rows
                (save_id, saved_at, card_index, detail_index, action_index, link_up, shift, action)
             VALUES ('s1', '2026-01-05 07:30:00', 0, 0, 0, 'L1', 'Day', 'Replaced belt'),
                    ('s1', '2026-01-05 07:30:00', 0, 0, 1, 'L1', 'Day', 'Checked tension')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;

        let store = local(&dir).await;
        let report = migrate_legacy(&store, &shared_path, &machine("legacy")).await.unwrap();
        assert_eq!(report.inserted, 2);

        let records = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(records[0].identity.as_str(), "s1/0/0/0");
        assert_eq!(records[0].origin_machine.as_str(), "legacy");

        let again = migrate_legacy(&store, &shared_path, &machine("legacy")).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = local(&dir).await;
        let result = migrate_legacy(&store, &dir.path().join("nope.db"), &machine("legacy")).await;
        assert!(result.is_err());
    }
}
