//! Command line definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "history", version, about = "Daily report history store")]
pub struct Cli {
    /// Config file (default: platform config dir / history.toml).
    #[arg(long, global = true, env = "DAILY_REPORT_HISTORY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a config file with defaults for this machine.
    InitConfig {
        /// Shared folder for batch files.
        #[arg(long)]
        shared_dir: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show sync progress, pending exports and per-peer lag.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Run one export-then-import cycle now.
    Sync,

    /// Append one record.
    Append {
        /// Record identity.
        #[arg(long)]
        id: String,

        /// Payload field as name=value; repeatable.
        #[arg(long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
    },

    /// List records in creation order.
    Query {
        /// Inclusive start (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        from: Option<String>,

        /// Exclusive end (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        to: Option<String>,

        /// Only records created on this machine.
        #[arg(long)]
        origin: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Copy every record from a legacy shared database into the local store.
    MigrateLegacy {
        /// Path to the legacy shared history.db.
        path: PathBuf,
    },

    /// Write a full snapshot batch for onboarding new machines.
    Snapshot,

    /// Move this machine's old batches into the archive folder.
    Archive {
        #[arg(long)]
        retention_days: Option<u32>,

        #[arg(long)]
        keep_snapshots: Option<usize>,
    },
}
