//! # Database Migrations
//!
//! Embedded SQL migrations shared by the local store and the legacy
//! shared database file.
//!
//! ## How Migrations Work
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Migration Process                                  │
//! │                                                                         │
//! │  LocalStore::open / SharedStore::open                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Check _sqlx_migrations table                                          │
//! │       │                                                                 │
//! │       ├── Table doesn't exist? Create it                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Run pending migrations in order                                       │
//! │       │                                                                 │
//! │       └── 0001_history_records.sql                                     │
//! │                                                                         │
//! │  SharedStore runs this while holding the lock file, so two machines    │
//! │  starting at once never race on schema creation.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. **NEVER** modify existing migrations, always add new ones
//! 3. Older builds on other machines must keep reading the table, so only
//!    add nullable columns

use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::DbResult;

/// Embedded migrations from the `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Runs pending migrations on a single connection.
///
/// Used by the guard, which holds the shared file's lock for the duration.
pub async fn run_migrations_on(conn: &mut SqliteConnection) -> DbResult<()> {
    MIGRATOR.run_direct(conn).await?;
    Ok(())
}

/// Returns (total_migrations, applied_migrations).
///
/// For diagnostics in `status`.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}
