//! # Network-Safe Guard
//!
//! Hardening for the legacy mode where several machines write one SQLite
//! file on a network share. This reduces the corruption risk of that setup;
//! it cannot remove it. The local store plus file sync is the supported
//! model, and this layer exists only for shares that are already deployed.
//!
//! ## Write Attempt State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   ATTEMPT ──► acquire "<db>.lock" (poll every 100ms, bounded wait)      │
//! │      │                                                                  │
//! │      ├── not acquired in time ─────────────────────► LOCK_TIMEOUT      │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │   LOCK_ACQUIRED                                                         │
//! │      │  fresh connection: journal DELETE, synchronous FULL,            │
//! │      │  busy_timeout 30s, small page cache                             │
//! │      │                                                                  │
//! │      ├── operation commits ────────────────────────► WRITE_OK          │
//! │      └── operation fails ──────────────────────────► WRITE_FAILED      │
//! │                                                                         │
//! │   LOCK_TIMEOUT / transient WRITE_FAILED (BUSY, LOCKED)                  │
//! │      └── sleep with exponential backoff, next ATTEMPT                  │
//! │          after max_retries: WriteUnavailable                           │
//! │                                                                         │
//! │   Non-transient WRITE_FAILED (StoreCorrupt, ...) is returned at once.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why Not WAL
//! WAL keeps its index in shared memory next to the database. Shared memory
//! does not work across machines on a network filesystem, so the share uses
//! the rollback journal instead.

use std::borrow::Cow;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use history_core::{HistoryFilter, HistoryRecord, MachineId, NewRecord, RecordId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Connection, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::pool::{next_created_at, AppendOutcome, AppendSummary, RecordCursor, DEFAULT_PAGE_SIZE};
use crate::repository::history::{insert_record, HistoryRepository};
use crate::repository::legacy;

// =============================================================================
// Configuration
// =============================================================================

/// Guard settings for the shared database file.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// How long one attempt waits for the lock file.
    /// Default: 30 seconds
    pub lock_timeout: Duration,

    /// How often the lock file is polled while waiting.
    /// Default: 100 milliseconds
    pub lock_poll_interval: Duration,

    /// Retries after the first attempt.
    /// Default: 5
    pub max_retries: u32,

    /// First backoff delay, doubled per retry.
    /// Default: 100 milliseconds
    pub initial_backoff: Duration,

    /// Backoff ceiling.
    /// Default: 5 seconds
    pub max_backoff: Duration,

    /// SQLite busy_timeout on guarded connections.
    /// Default: 30 seconds
    pub busy_timeout: Duration,

    /// Page cache size in KiB (negative `cache_size` pragma).
    /// Default: 2000
    pub cache_size_kib: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            lock_timeout: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(100),
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(30),
            cache_size_kib: 2000,
        }
    }
}

// =============================================================================
// Attempt States
// =============================================================================

/// States of one guarded write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Attempt,
    LockAcquired,
    WriteOk,
    WriteFailed,
    LockTimeout,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteState::Attempt => write!(f, "attempt"),
            WriteState::LockAcquired => write!(f, "lock_acquired"),
            WriteState::WriteOk => write!(f, "write_ok"),
            WriteState::WriteFailed => write!(f, "write_failed"),
            WriteState::LockTimeout => write!(f, "lock_timeout"),
        }
    }
}

/// Terminal state of one attempt.
enum AttemptOutcome<T> {
    WriteOk(T),
    WriteFailed(DbError),
    LockTimeout(DbError),
}

/// Boxed future returned by guarded operations.
pub type GuardedFuture<'c, T> = Pin<Box<dyn Future<Output = DbResult<T>> + Send + 'c>>;

// =============================================================================
// Lock File
// =============================================================================

/// Exclusive advisory lock on `<db>.lock`, released on drop.
///
/// The lock file itself is left in place; removing it would let a waiting
/// process lock a file another process is about to recreate.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Polls for the lock until `timeout` elapses.
    pub async fn acquire(path: &Path, timeout: Duration, poll: Duration) -> DbResult<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        let contended = fs2::lock_contended_error().raw_os_error();

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");
                    return Ok(FileLock {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.raw_os_error() == contended => {
                    if started.elapsed() >= timeout {
                        return Err(DbError::LockTimeout {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        });
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(DbError::Io(e)),
            }
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

// =============================================================================
// NetworkSafeGuard
// =============================================================================

/// Wraps every write to a shared database file in lock + retry.
#[derive(Debug, Clone)]
pub struct NetworkSafeGuard {
    db_path: PathBuf,
    lock_path: PathBuf,
    config: GuardConfig,
}

impl NetworkSafeGuard {
    /// Creates a guard for `db_path`; the lock file is `<db_path>.lock`.
    pub fn new(db_path: impl Into<PathBuf>, config: GuardConfig) -> Self {
        let db_path = db_path.into();
        let mut lock_name = db_path.as_os_str().to_os_string();
        lock_name.push(".lock");

        NetworkSafeGuard {
            db_path,
            lock_path: PathBuf::from(lock_name),
            config,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Connection settings for the shared file.
    pub fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(self.config.busy_timeout)
            .pragma(
                "cache_size",
                Cow::<'static, str>::Owned(format!("-{}", self.config.cache_size_kib)),
            )
    }

    /// Runs `op` inside a transaction while holding the lock, retrying
    /// transient failures.
    ///
    /// ## Errors
    /// - `WriteUnavailable` once all retries are spent
    /// - any non-transient error (e.g. `StoreCorrupt`) immediately
    pub async fn write<T, F>(&self, label: &str, op: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> GuardedFuture<'c, T>,
    {
        self.run(label, op).await
    }

    /// Applies pending migrations under the lock, with the same retry policy
    /// as [`write`](Self::write).
    pub async fn migrate(&self) -> DbResult<()> {
        let max_attempts = self.config.max_retries + 1;
        let mut backoff = self.create_backoff();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.migrate_once().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Shared database migration failed, retrying");
                    last_error = e.to_string();
                }
                Err(e) => return Err(e),
            }

            if attempt < max_attempts {
                let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                tokio::time::sleep(delay).await;
            }
        }

        Err(DbError::WriteUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn migrate_once(&self) -> DbResult<()> {
        let _lock = FileLock::acquire(
            &self.lock_path,
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
        .await?;

        let mut conn = SqliteConnection::connect_with(&self.connect_options()).await?;
        let result = migrations::run_migrations_on(&mut conn).await;
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Closing migration connection failed");
        }
        result
    }

    async fn run<T, F>(&self, label: &str, mut op: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> GuardedFuture<'c, T>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut backoff = self.create_backoff();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(op = label, attempt, state = %WriteState::Attempt, "Guarded write");

            let err = match self.attempt(&mut op).await {
                AttemptOutcome::WriteOk(value) => {
                    debug!(op = label, attempt, state = %WriteState::WriteOk, "Guarded write");
                    return Ok(value);
                }
                AttemptOutcome::LockTimeout(e) => {
                    warn!(op = label, attempt, state = %WriteState::LockTimeout, error = %e, "Guarded write");
                    e
                }
                AttemptOutcome::WriteFailed(e) => {
                    warn!(op = label, attempt, state = %WriteState::WriteFailed, error = %e, "Guarded write");
                    if !e.is_transient() {
                        return Err(e);
                    }
                    e
                }
            };

            last_error = err.to_string();

            if attempt < max_attempts {
                let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                debug!(?delay, attempt, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }
        }

        Err(DbError::WriteUnavailable {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt<T, F>(&self, op: &mut F) -> AttemptOutcome<T>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> GuardedFuture<'c, T>,
    {
        let lock = match FileLock::acquire(
            &self.lock_path,
            self.config.lock_timeout,
            self.config.lock_poll_interval,
        )
        .await
        {
            Ok(lock) => lock,
            Err(e @ DbError::LockTimeout { .. }) => return AttemptOutcome::LockTimeout(e),
            Err(e) => return AttemptOutcome::WriteFailed(e),
        };
        debug!(lock = %lock.path().display(), state = %WriteState::LockAcquired, "Guarded write");

        let mut conn = match SqliteConnection::connect_with(&self.connect_options()).await {
            Ok(conn) => conn,
            Err(e) => return AttemptOutcome::WriteFailed(e.into()),
        };

        let result = run_in_transaction(&mut conn, op).await;

        if let Err(e) = conn.close().await {
            debug!(error = %e, "Closing guarded connection failed");
        }
        drop(lock);

        match result {
            Ok(value) => AttemptOutcome::WriteOk(value),
            Err(e) => AttemptOutcome::WriteFailed(e),
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            current_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

async fn run_in_transaction<T, F>(conn: &mut SqliteConnection, op: &mut F) -> DbResult<T>
where
    F: for<'c> FnMut(&'c mut SqliteConnection) -> GuardedFuture<'c, T>,
{
    let mut tx = conn.begin().await?;
    let value = op(&mut *tx).await?;
    tx.commit().await?;
    Ok(value)
}

// =============================================================================
// SharedStore
// =============================================================================

/// A history store backed by one database file on a network share.
///
/// Writes go through [`NetworkSafeGuard`]; reads use a small pool with the
/// same conservative settings.
#[derive(Debug, Clone)]
pub struct SharedStore {
    guard: NetworkSafeGuard,
    pool: SqlitePool,
    machine: MachineId,
    last_created_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SharedStore {
    /// Opens the shared file, creating the schema under the lock if needed.
    pub async fn open(
        db_path: impl Into<PathBuf>,
        config: GuardConfig,
        machine: MachineId,
    ) -> DbResult<Self> {
        let guard = NetworkSafeGuard::new(db_path, config);
        info!(
            path = %guard.db_path().display(),
            machine = %machine,
            "Opening shared history database (legacy mode)"
        );

        guard.migrate().await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .min_connections(0)
            .connect_with(guard.connect_options().create_if_missing(false))
            .await
            .map_err(|e| match DbError::from(e) {
                corrupt @ DbError::StoreCorrupt(_) => corrupt,
                other => DbError::ConnectionFailed(other.to_string()),
            })?;

        Ok(SharedStore {
            guard,
            pool,
            machine,
            last_created_at: Arc::new(Mutex::new(None)),
        })
    }

    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    pub fn guard(&self) -> &NetworkSafeGuard {
        &self.guard
    }

    /// Returns the history repository (reads only).
    pub fn records(&self) -> HistoryRepository {
        HistoryRepository::new(self.pool.clone())
    }

    /// Appends one record through the guard.
    pub async fn append(&self, new: NewRecord) -> DbResult<AppendOutcome> {
        let mut last = self.last_created_at.lock().await;
        let at = match new.created_at {
            Some(at) => at,
            None => next_created_at(Utc::now(), *last),
        };
        let record = Arc::new(new.into_record(&self.machine, at));

        let inserted = self
            .guard
            .write("append", |conn| {
                let record = Arc::clone(&record);
                Box::pin(async move { insert_record(conn, &record, None).await })
            })
            .await?;

        match inserted {
            Some(local_seq) => {
                if last.map_or(true, |prev| record.created_at > prev) {
                    *last = Some(record.created_at);
                }
                Ok(AppendOutcome::Inserted { local_seq })
            }
            None => Ok(AppendOutcome::AlreadyPresent),
        }
    }

    /// Appends complete records in one guarded transaction.
    pub async fn append_batch(
        &self,
        records: Vec<HistoryRecord>,
        imported_from: Option<String>,
    ) -> DbResult<AppendSummary> {
        let records = Arc::new(records);
        let source = Arc::new(imported_from);

        self.guard
            .write("append_batch", |conn| {
                let records = Arc::clone(&records);
                let source = Arc::clone(&source);
                Box::pin(async move {
                    let mut summary = AppendSummary::default();
                    for record in records.iter() {
                        match insert_record(&mut *conn, record, source.as_deref()).await? {
                            Some(_) => summary.inserted += 1,
                            None => summary.duplicates += 1,
                        }
                    }
                    Ok(summary)
                })
            })
            .await
    }

    pub async fn exists(&self, identity: &RecordId) -> DbResult<bool> {
        self.records().exists(identity).await
    }

    /// Lazy ordered query, same contract as [`crate::LocalStore::query`].
    pub fn query(&self, filter: HistoryFilter) -> RecordCursor {
        RecordCursor::new(self.records(), filter, DEFAULT_PAGE_SIZE)
    }

    /// Embedded vs. applied schema migrations.
    pub async fn migration_status(&self) -> DbResult<(usize, usize)> {
        migrations::migration_status(&self.pool).await
    }

    pub async fn count(&self) -> DbResult<i64> {
        self.records().count().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens a legacy shared file read-only for migration. No lock, no schema
/// changes.
pub async fn open_read_only(path: &Path) -> DbResult<SqlitePool> {
    if !path.exists() {
        return Err(DbError::ConnectionFailed(format!(
            "{} does not exist",
            path.display()
        )));
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .create_if_missing(false)
        .busy_timeout(GuardConfig::default().busy_timeout);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| match DbError::from(e) {
            corrupt @ DbError::StoreCorrupt(_) => corrupt,
            other => DbError::ConnectionFailed(other.to_string()),
        })
}

/// Whether the database carries the current record table.
pub async fn has_record_table(pool: &SqlitePool) -> DbResult<bool> {
    legacy::has_table(pool, "history_records").await
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_config() -> GuardConfig {
        GuardConfig {
            lock_timeout: Duration::from_millis(200),
            lock_poll_interval: Duration::from_millis(10),
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..GuardConfig::default()
        }
    }

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    #[test]
    fn test_lock_path() {
        let guard = NetworkSafeGuard::new("/share/history.db", GuardConfig::default());
        assert_eq!(guard.lock_path(), Path::new("/share/history.db.lock"));
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("h.db.lock");

        let held = FileLock::acquire(&path, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        let err = FileLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::LockTimeout { .. }));

        drop(held);
        assert!(FileLock::acquire(&path, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .is_ok());
        assert!(path.exists(), "lock file is never removed");
    }

    #[tokio::test]
    async fn test_write_unavailable_after_retries() {
        let dir = TempDir::new().unwrap();
        let guard = NetworkSafeGuard::new(dir.path().join("h.db"), fast_config());

        let _held = FileLock::acquire(guard.lock_path(), Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();

        let err = guard
            .write("noop", |_conn| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();

        match err {
            DbError::WriteUnavailable { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("waiting for lock"));
            }
            other => panic!("expected WriteUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let guard = NetworkSafeGuard::new(dir.path().join("h.db"), fast_config());
        let mut calls = 0u32;

        let err = guard
            .write("bad", |_conn| {
                calls += 1;
                Box::pin(async { Err::<(), _>(DbError::QueryFailed("no such table".into())) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::QueryFailed(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_shared_store_uses_rollback_journal() {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::open(dir.path().join("h.db"), fast_config(), machine("A"))
            .await
            .unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "delete");
    }

    #[tokio::test]
    async fn test_shared_store_append_and_query() {
        let dir = TempDir::new().unwrap();
        let store = SharedStore::open(dir.path().join("h.db"), fast_config(), machine("A"))
            .await
            .unwrap();

        let id = RecordId::new("a1").unwrap();
        let first = store.append(NewRecord::new(id.clone()).field("count", 5)).await.unwrap();
        let again = store.append(NewRecord::new(id.clone()).field("count", 6)).await.unwrap();

        assert!(first.is_inserted());
        assert_eq!(again, AppendOutcome::AlreadyPresent);
        assert!(store.exists(&id).await.unwrap());

        let all = store.query(HistoryFilter::all()).collect_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].origin_machine, machine("A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_five_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let config = GuardConfig {
            lock_poll_interval: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(10),
            ..GuardConfig::default()
        };

        let mut handles = Vec::new();
        for i in 0..5 {
            let path = path.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                let who = machine(&format!("PC-{}", i));
                let store = SharedStore::open(path, config, who.clone()).await?;
                for n in 0..4 {
                    let id = RecordId::new(format!("{}/{}", who, n)).unwrap();
                    store.append(NewRecord::new(id).field("n", n as i64)).await?;
                }
                store.close().await;
                Ok::<_, DbError>(())
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let pool = open_read_only(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM history_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 20);

        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(check, "ok");
    }
}
