//! # history
//!
//! Operator CLI for the daily report history store.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  history init-config --shared-dir //server/reports/history-sync        │
//! │  history status [--json]                                               │
//! │  history sync                                                          │
//! │  history append --id a1 --field count=5                                │
//! │  history query --from 2026-03-01 --origin A                            │
//! │  history migrate-legacy //server/reports/history.db                    │
//! │  history snapshot                                                      │
//! │  history archive --retention-days 30 --keep-snapshots 1                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Logging
//! `RUST_LOG` controls verbosity, default `info,history=debug,sqlx=warn`.

mod cli;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use history_core::{FieldValue, HistoryFilter, MachineId, NewRecord, RecordId};
use history_db::LocalStore;
use history_sync::{
    migrate_legacy, HistoryStore, StorageMode, StoreStatus, SyncConfig, SyncCoordinator,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Command::InitConfig { shared_dir, force } => init_config(cli.config, shared_dir, force),
        Command::Status { json } => {
            let config = SyncConfig::load(cli.config)?;
            let store = HistoryStore::open(&config).await?;
            let status = store.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
            store.close().await?;
            Ok(())
        }
        Command::Sync => {
            let config = SyncConfig::load(cli.config)?;
            let store = HistoryStore::open(&config).await?;
            let report = store.sync_bidirectional().await?;
            match report.exported_batch() {
                Some(batch) => println!("exported: {} ({} records)", batch.id, batch.records),
                None => println!("exported: nothing new"),
            }
            println!(
                "imported: {} new, {} duplicates, {} malformed skipped, {} batches unreadable",
                report.import.inserted,
                report.import.duplicates,
                report.import.malformed,
                report.import.unreadable.len()
            );
            for reason in &report.import.unreadable {
                println!("  unreadable: {}", reason);
            }
            store.close().await?;
            Ok(())
        }
        Command::Append { id, fields } => {
            let config = SyncConfig::load(cli.config)?;
            let mut record = NewRecord::new(RecordId::new(id)?);
            for field in &fields {
                let (name, value) = parse_field(field)?;
                record = record.field(name, value);
            }
            let store = HistoryStore::open(&config).await?;
            let outcome = store.append(record).await?;
            if outcome.is_inserted() {
                println!("appended");
            } else {
                println!("already present, nothing changed");
            }
            store.close().await?;
            Ok(())
        }
        Command::Query {
            from,
            to,
            origin,
            limit,
        } => {
            let config = SyncConfig::load(cli.config)?;
            let mut filter = HistoryFilter::all();
            if let Some(from) = from {
                filter = filter.from(parse_instant(&from)?);
            }
            if let Some(to) = to {
                filter = filter.until(parse_instant(&to)?);
            }
            if let Some(origin) = origin {
                filter = filter.origin(MachineId::new(origin)?);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }

            let store = HistoryStore::open(&config).await?;
            let mut cursor = store.query(filter);
            while let Some(page) = cursor.next_page().await? {
                for record in page {
                    let fields: Vec<String> = record
                        .payload
                        .iter()
                        .map(|(name, value)| format!("{}={}", name, value))
                        .collect();
                    println!(
                        "{}  {}  {}  {}",
                        record.created_at.to_rfc3339(),
                        record.origin_machine,
                        record.identity,
                        fields.join(" ")
                    );
                }
            }
            store.close().await?;
            Ok(())
        }
        Command::MigrateLegacy { path } => {
            let config = SyncConfig::load(cli.config)?;
            if config.storage.mode != StorageMode::LocalSync {
                bail!("migrate-legacy copies into the local store; set storage.mode = \"local_sync\"");
            }
            let store = LocalStore::open(config.to_db_config(), config.machine_id()?).await?;
            let report = migrate_legacy(&store, &path, &config.legacy_origin()?)
                .await
                .with_context(|| format!("migrating {}", path.display()))?;
            println!(
                "scanned {}, inserted {}, already present {}",
                report.scanned, report.inserted, report.duplicates
            );
            store.close().await;
            Ok(())
        }
        Command::Snapshot => {
            let (coordinator, _config) = open_coordinator(cli.config).await?;
            match coordinator.export_snapshot().await? {
                Some(batch) => println!("snapshot {} ({} records)", batch.id, batch.records),
                None => println!("store is empty, no snapshot written"),
            }
            coordinator.store().close().await;
            Ok(())
        }
        Command::Archive {
            retention_days,
            keep_snapshots,
        } => {
            let (coordinator, config) = open_coordinator(cli.config).await?;
            let report = coordinator
                .archive(
                    retention_days.unwrap_or(config.sync.retention_days),
                    keep_snapshots.unwrap_or(config.sync.keep_latest_snapshots),
                )
                .await?;
            println!(
                "scanned {}, archived {}, kept {}, errors {}",
                report.scanned, report.archived, report.skipped, report.errors
            );
            coordinator.store().close().await;
            Ok(())
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=history_sync=trace` - Trace the sync engine only
/// - Default: INFO, DEBUG for history crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,history=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn init_config(
    path: Option<std::path::PathBuf>,
    shared_dir: Option<std::path::PathBuf>,
    force: bool,
) -> Result<()> {
    let target = path
        .or_else(SyncConfig::default_config_path)
        .context("no config path available on this platform")?;
    if target.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", target.display());
    }

    let mut config = SyncConfig::new();
    config.sync.shared_dir = shared_dir;
    let written = config.save(Some(target))?;
    info!(machine = %config.machine.id, "Config initialized");
    println!("wrote {}", written.display());
    Ok(())
}

async fn open_coordinator(
    path: Option<std::path::PathBuf>,
) -> Result<(SyncCoordinator, SyncConfig)> {
    let config = SyncConfig::load(path)?;
    if config.storage.mode != StorageMode::LocalSync {
        bail!("this command needs storage.mode = \"local_sync\"");
    }
    let store = LocalStore::open(config.to_db_config(), config.machine_id()?).await?;
    let coordinator = SyncCoordinator::open(store, &config)?;
    Ok((coordinator, config))
}

fn print_status(status: &StoreStatus) {
    println!("machine:        {}", status.machine);
    println!("mode:           {}", status.mode);
    println!("records:        {}", status.local_records);
    println!(
        "schema:         {}/{} migrations applied",
        status.migrations_applied, status.migrations_total
    );

    let Some(sync) = &status.sync else {
        return;
    };
    let when = |at: Option<DateTime<Utc>>| at.map_or_else(|| "never".to_string(), |t| t.to_rfc3339());

    println!(
        "shared folder:  {}{}",
        sync.shared_dir.display(),
        if sync.shared_dir_available { "" } else { " (UNAVAILABLE)" }
    );
    println!("last sync:      {}", when(sync.last_sync_at));
    println!("last export:    {} (seq {})", when(sync.last_export_at), sync.last_export_seq);
    println!("last import:    {}", when(sync.last_import_at));
    println!("pending export: {}", sync.pending_export);

    if let Some(cycle) = &sync.last_cycle {
        println!(
            "last cycle:     {} imported, {} malformed skipped, {} batches unreadable",
            cycle.imported, cycle.malformed_records, cycle.unreadable_batches
        );
    }

    if sync.peers.is_empty() {
        println!("peers:          none seen");
    }
    for peer in &sync.peers {
        let missing = if peer.missing.is_empty() {
            String::new()
        } else {
            format!(
                ", waiting on {}",
                peer.missing
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            )
        };
        println!(
            "peer {:<10} imported through {} of {}{}",
            peer.machine, peer.imported_through, peer.highest_seen, missing
        );
    }
}

/// Parses `name=value`. Integers, floats and RFC 3339 timestamps keep their
/// type; anything else is text.
fn parse_field(raw: &str) -> Result<(String, FieldValue)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("field '{}' is not NAME=VALUE", raw);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("field '{}' has an empty name", raw);
    }

    let value = if let Ok(v) = value.parse::<i64>() {
        FieldValue::Integer(v)
    } else if let Some(v) = value.parse::<f64>().ok().filter(|v| v.is_finite()) {
        FieldValue::Float(v)
    } else if let Ok(v) = DateTime::parse_from_rfc3339(value) {
        FieldValue::Timestamp(v.with_timezone(&Utc))
    } else {
        FieldValue::Text(value.to_string())
    };
    Ok((name.to_string(), value))
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or RFC 3339.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("'{}' is not a date or RFC 3339 timestamp", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_types() {
        assert_eq!(parse_field("count=5").unwrap().1, FieldValue::Integer(5));
        assert_eq!(parse_field("ratio=0.5").unwrap().1, FieldValue::Float(0.5));
        assert_eq!(
            parse_field("shift=Day shift").unwrap(),
            ("shift".to_string(), FieldValue::Text("Day shift".into()))
        );
        assert!(matches!(
            parse_field("at=2026-03-02T09:00:00Z").unwrap().1,
            FieldValue::Timestamp(_)
        ));
        assert_eq!(parse_field("note=a=b").unwrap().1, FieldValue::Text("a=b".into()));
        assert!(parse_field("count").is_err());
        assert!(parse_field("=5").is_err());
    }

    #[test]
    fn test_parse_instant() {
        let day = parse_instant("2026-03-02").unwrap();
        assert_eq!(day.to_rfc3339(), "2026-03-02T00:00:00+00:00");
        assert!(parse_instant("2026-03-02T09:00:00+02:00").is_ok());
        assert!(parse_instant("March 2nd").is_err());
    }
}
