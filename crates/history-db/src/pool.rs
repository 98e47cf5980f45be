//! # Local Store
//!
//! One machine's embedded history database. The store is the only writer of
//! its file; peers' records reach it through the sync importer.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         LocalStore                                      │
//! │                                                                         │
//! │  LocalStore::open(DbConfig, machine)                                   │
//! │       │                                                                 │
//! │       ├── connect (WAL, synchronous NORMAL, busy_timeout)              │
//! │       ├── PRAGMA quick_check ── not "ok"? ──► StoreCorrupt (fail fast) │
//! │       ├── run migrations                                               │
//! │       └── load last created_at for this machine                        │
//! │                                                                         │
//! │  ┌─────────────────────────────┐   ┌────────────────────────────────┐  │
//! │  │ writer gate (tokio Mutex)   │   │  SqlitePool (readers)          │  │
//! │  │  append / append_batch      │   │   query / exists / export scan │  │
//! │  │  one write at a time        │   │   run concurrently             │  │
//! │  └─────────────────────────────┘   └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! Readers never block the writer and never observe a half-written row.
//! The store file is local to the machine, so WAL's shared-memory index is
//! safe here (unlike on a network share, see [`crate::guard`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use history_core::{normalize_timestamp, HistoryFilter, HistoryRecord, MachineId, NewRecord, RecordId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::history::{insert_record, HistoryRepository, PageKey, StoredRecord};

/// Default page size for lazy query cursors.
pub const DEFAULT_PAGE_SIZE: usize = 500;

// =============================================================================
// Configuration
// =============================================================================

/// Local store configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/data/history.db")
///     .max_connections(4)
///     .busy_timeout(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 4
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection acquire timeout.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// How long SQLite waits on a locked database before returning BUSY.
    /// Default: 3 seconds
    pub busy_timeout: Duration,

    /// Run `PRAGMA quick_check` before first use.
    /// Default: true
    pub integrity_check: bool,

    /// Whether to run migrations on open.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for the given file. The file is created if
    /// it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(3),
            integrity_check: true,
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the busy timeout.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets whether to check integrity on open.
    pub fn integrity_check(mut self, check: bool) -> Self {
        self.integrity_check = check;
        self
    }

    /// Sets whether to run migrations on open.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }
}

// =============================================================================
// Append Results
// =============================================================================

/// Outcome of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was stored at this local sequence.
    Inserted { local_seq: i64 },
    /// A record with the same identity already exists; nothing changed.
    AlreadyPresent,
}

impl AppendOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, AppendOutcome::Inserted { .. })
    }
}

/// Outcome of a multi-record append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug)]
struct WriterState {
    /// Latest `created_at` assigned to a record created on this machine.
    last_created_at: Option<DateTime<Utc>>,
}

// =============================================================================
// LocalStore
// =============================================================================

/// Handle to one machine's local history database.
///
/// Cheap to clone; clones share the pool and the writer gate.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    path: PathBuf,
    machine: MachineId,
    writer: Arc<Mutex<WriterState>>,
}

impl LocalStore {
    /// Opens (or creates) the local store for `machine`.
    ///
    /// ## Errors
    /// - `StoreCorrupt` if the file fails its integrity check
    /// - `ConnectionFailed` if the file cannot be opened or created
    pub async fn open(config: DbConfig, machine: MachineId) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            machine = %machine,
            "Opening local history store"
        );

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| match DbError::from(e) {
                corrupt @ DbError::StoreCorrupt(_) => corrupt,
                other => DbError::ConnectionFailed(other.to_string()),
            })?;

        debug!(max_connections = config.max_connections, "Local pool created");

        if config.integrity_check {
            check_integrity(&pool, &config.database_path).await?;
        }

        if config.run_migrations {
            migrations::run_migrations(&pool).await?;
        }

        let last_created_at = HistoryRepository::new(pool.clone())
            .last_created_at(&machine)
            .await?;

        Ok(LocalStore {
            pool,
            path: config.database_path,
            machine,
            writer: Arc::new(Mutex::new(WriterState { last_created_at })),
        })
    }

    /// Machine this store belongs to.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the history repository.
    pub fn records(&self) -> HistoryRepository {
        HistoryRepository::new(self.pool.clone())
    }

    /// Appends one record unless its identity is already stored.
    ///
    /// Assigns `created_at` when absent, as `max(now, last + 1µs)` so this
    /// machine's records keep their creation order even if the clock steps
    /// back. Records without an origin are stamped with this machine.
    pub async fn append(&self, new: NewRecord) -> DbResult<AppendOutcome> {
        let mut writer = self.writer.lock().await;

        let assigned = new.created_at.is_none();
        let at = match new.created_at {
            Some(at) => at,
            None => next_created_at(Utc::now(), writer.last_created_at),
        };
        let record = new.into_record(&self.machine, at);

        let mut conn = self.pool.acquire().await?;
        let outcome = match insert_record(&mut *conn, &record, None).await? {
            Some(local_seq) => {
                if assigned || record.origin_machine == self.machine {
                    if writer.last_created_at.map_or(true, |last| record.created_at > last) {
                        writer.last_created_at = Some(record.created_at);
                    }
                }
                debug!(identity = %record.identity, local_seq, "Appended record");
                AppendOutcome::Inserted { local_seq }
            }
            None => AppendOutcome::AlreadyPresent,
        };

        Ok(outcome)
    }

    /// Appends many complete records in one transaction.
    ///
    /// Used by import and migration. `imported_from` tags every inserted row
    /// with its source (batch id or legacy file).
    pub async fn append_batch(
        &self,
        records: &[HistoryRecord],
        imported_from: Option<&str>,
    ) -> DbResult<AppendSummary> {
        let _writer = self.writer.lock().await;

        let mut summary = AppendSummary::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            match insert_record(&mut *tx, record, imported_from).await? {
                Some(_) => summary.inserted += 1,
                None => summary.duplicates += 1,
            }
        }
        tx.commit().await?;

        debug!(
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            source = imported_from.unwrap_or("local"),
            "Appended batch"
        );
        Ok(summary)
    }

    /// Checks whether a record with this identity is stored.
    pub async fn exists(&self, identity: &RecordId) -> DbResult<bool> {
        self.records().exists(identity).await
    }

    /// Returns a lazy, restartable cursor over matching records ordered by
    /// `created_at` ascending, ties broken by identity.
    pub fn query(&self, filter: HistoryFilter) -> RecordCursor {
        RecordCursor::new(self.records(), filter, DEFAULT_PAGE_SIZE)
    }

    /// Records with `local_seq > after_seq`, in creation order.
    ///
    /// Includes imported rows when `include_imported` is set (relay).
    pub async fn all_unexported_since(
        &self,
        after_seq: i64,
        limit: usize,
        include_imported: bool,
    ) -> DbResult<Vec<StoredRecord>> {
        self.records()
            .fetch_since(after_seq, limit, include_imported)
            .await
    }

    /// Number of records after `after_seq` (pending export count).
    pub async fn count_since(&self, after_seq: i64, include_imported: bool) -> DbResult<i64> {
        self.records().count_since(after_seq, include_imported).await
    }

    /// Embedded vs. applied schema migrations.
    pub async fn migration_status(&self) -> DbResult<(usize, usize)> {
        migrations::migration_status(&self.pool).await
    }

    /// Total number of stored records.
    pub async fn count(&self) -> DbResult<i64> {
        self.records().count().await
    }

    /// Highest local sequence in use.
    pub async fn max_local_seq(&self) -> DbResult<i64> {
        self.records().max_local_seq().await
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        info!(path = %self.path.display(), "Closing local history store");
        self.pool.close().await;
    }

    /// Checks if the database can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Next creation time for a locally created record.
pub fn next_created_at(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = normalize_timestamp(now);
    match last {
        Some(last) if now <= last => last + chrono::Duration::microseconds(1),
        _ => now,
    }
}

/// Runs `PRAGMA quick_check` and fails with `StoreCorrupt` on any finding.
pub(crate) async fn check_integrity(pool: &SqlitePool, path: &Path) -> DbResult<()> {
    let findings: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await?;

    if findings.len() == 1 && findings[0] == "ok" {
        return Ok(());
    }

    let summary = findings.join("; ");
    error!(path = %path.display(), findings = %summary, "Integrity check failed");
    Err(DbError::StoreCorrupt(format!(
        "{}: {}",
        path.display(),
        summary
    )))
}

// =============================================================================
// Record Cursor
// =============================================================================

/// Lazy, finite, restartable sequence of query results.
///
/// Pages through the store with keyset pagination on
/// `(created_at, identity)`, so rows appended while iterating are picked up
/// if they sort after the current position.
#[derive(Debug, Clone)]
pub struct RecordCursor {
    repo: HistoryRepository,
    filter: HistoryFilter,
    page_size: usize,
    after: Option<PageKey>,
    yielded: usize,
    done: bool,
}

impl RecordCursor {
    pub(crate) fn new(repo: HistoryRepository, filter: HistoryFilter, page_size: usize) -> Self {
        RecordCursor {
            repo,
            filter,
            page_size: page_size.max(1),
            after: None,
            yielded: 0,
            done: false,
        }
    }

    /// Sets the page size used for subsequent fetches.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Fetches the next page. Returns `None` once the sequence is exhausted.
    pub async fn next_page(&mut self) -> DbResult<Option<Vec<HistoryRecord>>> {
        if self.done {
            return Ok(None);
        }

        let mut want = self.page_size;
        if let Some(limit) = self.filter.limit {
            want = want.min(limit.saturating_sub(self.yielded));
        }
        if want == 0 {
            self.done = true;
            return Ok(None);
        }

        let page = self
            .repo
            .fetch_page(&self.filter, self.after.as_ref(), want)
            .await?;

        if page.len() < want {
            self.done = true;
        }
        match page.last() {
            Some(last) => self.after = Some(PageKey::after(last)),
            None => {
                self.done = true;
                return Ok(None);
            }
        }
        self.yielded += page.len();

        Ok(Some(page))
    }

    /// Drains the remaining pages into one vector.
    pub async fn collect_all(&mut self) -> DbResult<Vec<HistoryRecord>> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
        }
        Ok(out)
    }

    /// Rewinds to the beginning of the sequence.
    pub fn restart(&mut self) {
        self.after = None;
        self.yielded = 0;
        self.done = false;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use history_core::FieldValue;
    use tempfile::TempDir;

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    async fn open_store(dir: &TempDir, id: &str) -> LocalStore {
        let config = DbConfig::new(dir.path().join(format!("{}.db", id)));
        LocalStore::open(config, machine(id)).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_and_health_check() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "A").await;
        assert!(store.health_check().await);
        assert_eq!(store.count().await.unwrap(), 0);

        let (total, applied) = store.migration_status().await.unwrap();
        assert!(total > 0);
        assert_eq!(applied, total);
    }

    #[tokio::test]
    async fn test_float_payload_reads_back_bit_exact() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "A").await;
        let values = [2.5e-308, 1.0715660391465826e-75, f64::MIN_POSITIVE, 0.1];

        for (i, value) in values.iter().enumerate() {
            store
                .append(NewRecord::new(rid(&format!("f{}", i))).field("value", *value))
                .await
                .unwrap();
        }

        let records = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        for (record, value) in records.iter().zip(values) {
            match record.field("value") {
                Some(FieldValue::Float(out)) => assert_eq!(out.to_bits(), value.to_bits()),
                other => panic!("expected a float, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_append_is_once_per_identity() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "A").await;

        let first = store
            .append(NewRecord::new(rid("a1")).field("count", 5))
            .await
            .unwrap();
        let second = store
            .append(NewRecord::new(rid("a1")).field("count", 99))
            .await
            .unwrap();

        assert!(first.is_inserted());
        assert_eq!(second, AppendOutcome::AlreadyPresent);
        assert!(store.exists(&rid("a1")).await.unwrap());
        assert!(!store.exists(&rid("zz")).await.unwrap());

        let all = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].field("count"), Some(&FieldValue::Integer(5)));
        assert_eq!(all[0].origin_machine, machine("A"));
    }

    #[tokio::test]
    async fn test_query_orders_own_appends_by_creation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "A").await;

        // Identities deliberately sort opposite to append order.
        for id in ["z", "y", "x", "w"] {
            store.append(NewRecord::new(rid(id))).await.unwrap();
        }

        let ids: Vec<String> = store
            .query(HistoryFilter::all())
            .collect_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.identity.to_string())
            .collect();
        assert_eq!(ids, vec!["z", "y", "x", "w"]);
    }

    #[tokio::test]
    async fn test_query_filters_and_pages() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "A").await;
        let t = |h| Utc.with_ymd_and_hms(2026, 1, 24, h, 0, 0).unwrap();

        let records: Vec<HistoryRecord> = (0..6)
            .map(|i| {
                let origin = if i % 2 == 0 { "A" } else { "B" };
                NewRecord::new(rid(&format!("r{}", i)))
                    .into_record(&machine(origin), t(i as u32))
            })
            .collect();
        store.append_batch(&records, Some("B-0001")).await.unwrap();

        let mut cursor = store
            .query(HistoryFilter::all().from(t(1)).until(t(5)))
            .page_size(2);
        let first = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let rest = cursor.collect_all().await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(cursor.next_page().await.unwrap().is_none());

        cursor.restart();
        assert_eq!(cursor.collect_all().await.unwrap().len(), 4);

        let only_b = store
            .query(HistoryFilter::all().origin(machine("B")))
            .collect_all()
            .await
            .unwrap();
        assert_eq!(only_b.len(), 3);

        let limited = store
            .query(HistoryFilter::all().limit(5))
            .page_size(2)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(limited.len(), 5);
    }

    #[tokio::test]
    async fn test_append_batch_counts_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "B").await;
        let now = Utc::now();

        let records: Vec<HistoryRecord> = ["a1", "a2"]
            .iter()
            .map(|id| NewRecord::new(rid(id)).into_record(&machine("A"), now))
            .collect();

        let first = store.append_batch(&records, Some("A-0001")).await.unwrap();
        let second = store.append_batch(&records, Some("A-0001")).await.unwrap();

        assert_eq!(first, AppendSummary { inserted: 2, duplicates: 0 });
        assert_eq!(second, AppendSummary { inserted: 0, duplicates: 2 });
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unexported_since_respects_relay_flag() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "B").await;

        store.append(NewRecord::new(rid("b1"))).await.unwrap();
        let foreign = NewRecord::new(rid("a1")).into_record(&machine("A"), Utc::now());
        store.append_batch(&[foreign], Some("A-0001")).await.unwrap();
        store.append(NewRecord::new(rid("b2"))).await.unwrap();

        let all = store.all_unexported_since(0, 100, true).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].local_seq < w[1].local_seq));
        assert_eq!(all[1].imported_from.as_deref(), Some("A-0001"));

        let own = store.all_unexported_since(0, 100, false).await.unwrap();
        assert_eq!(own.len(), 2);

        let after_first = store
            .all_unexported_since(all[0].local_seq, 100, true)
            .await
            .unwrap();
        assert_eq!(after_first.len(), 2);
        assert_eq!(store.count_since(all[0].local_seq, true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reopen_keeps_creation_order() {
        let dir = TempDir::new().unwrap();
        let future = Utc::now() + chrono::Duration::hours(1);
        {
            let store = open_store(&dir, "A").await;
            store
                .append(NewRecord::new(rid("early")).created_at(future))
                .await
                .unwrap();
            store.close().await;
        }

        // Clock appears to have stepped back relative to the stored record.
        let store = open_store(&dir, "A").await;
        store.append(NewRecord::new(rid("later"))).await.unwrap();

        let all = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(all[0].identity, rid("early"));
        assert_eq!(all[1].identity, rid("later"));
        assert!(all[1].created_at > all[0].created_at);
    }

    #[tokio::test]
    async fn test_garbage_file_is_store_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.db");
        std::fs::write(&path, vec![0x42u8; 8192]).unwrap();

        let err = LocalStore::open(DbConfig::new(&path), machine("A"))
            .await
            .unwrap_err();
        assert!(err.is_corrupt(), "expected StoreCorrupt, got {:?}", err);
    }

    #[test]
    fn test_next_created_at_is_monotonic() {
        let t = Utc.with_ymd_and_hms(2026, 1, 24, 8, 0, 0).unwrap();
        assert_eq!(next_created_at(t, None), t);
        assert_eq!(
            next_created_at(t, Some(t)),
            t + chrono::Duration::microseconds(1)
        );
        let later = t + chrono::Duration::seconds(5);
        assert_eq!(
            next_created_at(t, Some(later)),
            later + chrono::Duration::microseconds(1)
        );
        assert_eq!(next_created_at(later, Some(t)), later);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .max_connections(10)
            .min_connections(2)
            .integrity_check(false);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert!(!config.integrity_check);
    }
}
