//! # History Repository
//!
//! SQL for the `history_records` table. Used by [`LocalStore`] and by the
//! guarded [`SharedStore`], which wrap it with their own write discipline.
//!
//! ## Row Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Row Lifecycle                                     │
//! │                                                                         │
//! │  1. INSERT OR IGNORE                                                   │
//! │     └── identity already present? nothing happens (first write wins)   │
//! │                                                                         │
//! │  2. READ                                                               │
//! │     ├── fetch_page()   ORDER BY created_at, identity (keyset paging)   │
//! │     └── fetch_since()  ORDER BY local_seq (export cursor)              │
//! │                                                                         │
//! │  There is no UPDATE and no DELETE.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`LocalStore`]: crate::LocalStore
//! [`SharedStore`]: crate::SharedStore

use chrono::{DateTime, Utc};
use history_core::codec::{format_ts, parse_ts};
use history_core::{CoreError, HistoryFilter, HistoryRecord, MachineId, Payload, RecordId};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;

const SELECT_COLUMNS: &str =
    "SELECT local_seq, identity, origin_machine, created_at, payload, imported_from \
     FROM history_records";

/// A record together with its position in one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Insertion order in this store. Not comparable across stores.
    pub local_seq: i64,
    pub record: HistoryRecord,
    /// Batch the row arrived in, `None` for local appends.
    pub imported_from: Option<String>,
}

/// Keyset position for ordered paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageKey {
    pub created_at: String,
    pub identity: String,
}

impl PageKey {
    pub fn after(record: &HistoryRecord) -> Self {
        PageKey {
            created_at: format_ts(record.created_at),
            identity: record.identity.as_str().to_string(),
        }
    }
}

/// Repository for history record operations.
#[derive(Debug, Clone)]
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    /// Creates a new HistoryRepository.
    pub fn new(pool: SqlitePool) -> Self {
        HistoryRepository { pool }
    }

    /// Checks whether a record with this identity is stored.
    pub async fn exists(&self, identity: &RecordId) -> DbResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM history_records WHERE identity = ?1")
                .bind(identity.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Fetches one record by identity.
    pub async fn get(&self, identity: &RecordId) -> DbResult<Option<StoredRecord>> {
        let sql = format!("{} WHERE identity = ?1", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_stored(&r)).transpose()
    }

    /// Fetches one page of records matching `filter`, strictly after `after`,
    /// ordered by `(created_at, identity)`.
    pub async fn fetch_page(
        &self,
        filter: &HistoryFilter,
        after: Option<&PageKey>,
        page_size: usize,
    ) -> DbResult<Vec<HistoryRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE 1 = 1");

        if let Some(from) = filter.from {
            qb.push(" AND created_at >= ").push_bind(format_ts(from));
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at < ").push_bind(format_ts(until));
        }
        if let Some(ref origin) = filter.origin {
            qb.push(" AND origin_machine = ")
                .push_bind(origin.as_str().to_string());
        }
        if let Some(key) = after {
            qb.push(" AND (created_at > ")
                .push_bind(key.created_at.clone())
                .push(" OR (created_at = ")
                .push_bind(key.created_at.clone())
                .push(" AND identity > ")
                .push_bind(key.identity.clone())
                .push("))");
        }

        qb.push(" ORDER BY created_at ASC, identity ASC LIMIT ")
            .push_bind(page_size as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| row_to_stored(r).map(|s| s.record))
            .collect()
    }

    /// Fetches records with `local_seq > after_seq` in insertion order.
    ///
    /// With `include_imported = false` only locally created rows are returned.
    pub async fn fetch_since(
        &self,
        after_seq: i64,
        limit: usize,
        include_imported: bool,
    ) -> DbResult<Vec<StoredRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE local_seq > ").push_bind(after_seq);
        if !include_imported {
            qb.push(" AND imported_from IS NULL");
        }
        qb.push(" ORDER BY local_seq ASC LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored).collect()
    }

    /// Counts records with `local_seq > after_seq`.
    pub async fn count_since(&self, after_seq: i64, include_imported: bool) -> DbResult<i64> {
        let sql = if include_imported {
            "SELECT COUNT(*) FROM history_records WHERE local_seq > ?1"
        } else {
            "SELECT COUNT(*) FROM history_records WHERE local_seq > ?1 AND imported_from IS NULL"
        };
        let count: i64 = sqlx::query_scalar(sql)
            .bind(after_seq)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Counts all stored records.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM history_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Highest local sequence in use (0 for an empty store).
    pub async fn max_local_seq(&self) -> DbResult<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(local_seq) FROM history_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.unwrap_or(0))
    }

    /// Latest `created_at` among records first created by `origin`.
    pub async fn last_created_at(&self, origin: &MachineId) -> DbResult<Option<DateTime<Utc>>> {
        let max: Option<String> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM history_records WHERE origin_machine = ?1",
        )
        .bind(origin.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(max.map(|ts| parse_ts(&ts)).transpose()?)
    }
}

/// Inserts a record unless its identity is already present.
///
/// Runs on a caller-provided connection so it can share a transaction.
/// Returns the new `local_seq`, or `None` for a duplicate.
pub async fn insert_record(
    conn: &mut SqliteConnection,
    record: &HistoryRecord,
    imported_from: Option<&str>,
) -> DbResult<Option<i64>> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| CoreError::malformed(e.to_string()))?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO history_records (
            identity, origin_machine, created_at, payload, imported_from, appended_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(record.identity.as_str())
    .bind(record.origin_machine.as_str())
    .bind(format_ts(record.created_at))
    .bind(payload)
    .bind(imported_from)
    .bind(format_ts(Utc::now()))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        debug!(identity = %record.identity, "Record already present");
        Ok(None)
    } else {
        Ok(Some(result.last_insert_rowid()))
    }
}

fn row_to_stored(row: &SqliteRow) -> DbResult<StoredRecord> {
    let local_seq: i64 = row.try_get("local_seq")?;
    let identity: String = row.try_get("identity")?;
    let origin: String = row.try_get("origin_machine")?;
    let created_at: String = row.try_get("created_at")?;
    let payload: String = row.try_get("payload")?;
    let imported_from: Option<String> = row.try_get("imported_from")?;

    let payload: Payload = serde_json::from_str(&payload).map_err(|e| {
        CoreError::malformed(format!("payload of '{}': {}", identity, e))
    })?;

    let record = HistoryRecord::new(
        RecordId::new(identity).map_err(CoreError::from)?,
        MachineId::new(origin).map_err(CoreError::from)?,
        parse_ts(&created_at)?,
        payload,
    );

    Ok(StoredRecord {
        local_seq,
        record,
        imported_from,
    })
}
