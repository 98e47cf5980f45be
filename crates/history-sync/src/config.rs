//! # Sync Configuration
//!
//! Configuration management for the history store and sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     DAILY_REPORT_HISTORY_MODE=shared_file                              │
//! │     DAILY_REPORT_SYNC_DIR=/mnt/share/history                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/daily-report/history.toml (Linux)                        │
//! │     %APPDATA%\daily-report\history\config\history.toml (Windows)       │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     StorageMode::LocalSync, machine id from host name                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # history.toml
//! [machine]
//! id = "FRONT-DESK-01"
//! name = "Front desk"
//!
//! [storage]
//! mode = "local_sync"  # local_sync | shared_file
//! local_db_path = "C:/DailyReport/history.db"
//! shared_db_path = "//fileserver/reports/history.db"
//!
//! [sync]
//! shared_dir = "//fileserver/reports/history-sync"
//! interval_secs = 60
//!
//! [legacy]
//! lock_timeout_secs = 30
//! max_retries = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use history_core::validation::MAX_MACHINE_ID_LEN;
use history_core::MachineId;
use history_db::{DbConfig, GuardConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// File name of the config file inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "history.toml";

// =============================================================================
// Storage Mode
// =============================================================================

/// How this machine stores history.
///
/// ## Mode Selection
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                       Storage Mode Behavior                             │
/// │                                                                         │
/// │  LOCAL_SYNC (Default)                                                  │
/// │  ────────────────────                                                  │
/// │  • Own SQLite file on local disk, single writer                        │
/// │  • Batches exchanged through the shared folder                         │
/// │  • Eventually every machine holds every record                         │
/// │                                                                         │
/// │  SHARED_FILE (Legacy)                                                  │
/// │  ────────────────────                                                  │
/// │  • All machines write one SQLite file on a network share               │
/// │  • Every write takes a lock file and retries on busy                   │
/// │  • Kept for already-deployed installs; can still corrupt               │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Local store plus batch exchange.
    #[default]
    LocalSync,

    /// Direct writes to one shared database file.
    SharedFile,
}

impl StorageMode {
    /// Returns true if this mode exchanges batches through the shared folder.
    pub fn uses_shared_dir(&self) -> bool {
        matches!(self, StorageMode::LocalSync)
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::LocalSync => write!(f, "local_sync"),
            StorageMode::SharedFile => write!(f, "shared_file"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "local_sync" | "local" | "sync" => Ok(StorageMode::LocalSync),
            "shared_file" | "shared" | "legacy" => Ok(StorageMode::SharedFile),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown storage mode: '{}'. Valid options: local_sync, shared_file",
                other
            ))),
        }
    }
}

// =============================================================================
// Machine Configuration
// =============================================================================

/// Configuration for this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine identifier, stamped as `origin_machine` on local records and
    /// used in batch file names. Must not change after the first sync.
    #[serde(default = "default_machine_id")]
    pub id: String,

    /// Human-readable machine name.
    #[serde(default)]
    pub name: String,
}

/// This host's name, else a fresh UUID.
///
/// `COMPUTERNAME` wins on Windows so the id matches what operators see in
/// Explorer. Elsewhere the OS host name is read directly, since shells do not
/// export `HOSTNAME`.
fn default_machine_id() -> String {
    std::env::var("COMPUTERNAME")
        .ok()
        .and_then(|name| machine_id_from_host(&name))
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .and_then(|name| machine_id_from_host(&name))
        })
        .unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            warn!(machine = %id, "No usable host name; set machine.id to keep this identity");
            id
        })
}

/// Maps a host name onto the machine id alphabet. Returns `None` when nothing
/// usable is left.
fn machine_id_from_host(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_MACHINE_ID_LEN)
        .collect();

    MachineId::new(cleaned.as_str()).ok().map(|_| cleaned)
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            id: default_machine_id(),
            name: String::new(),
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Where the databases live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Storage strategy, chosen once at startup.
    #[serde(default)]
    pub mode: StorageMode,

    /// This machine's own database file.
    #[serde(default = "default_local_db_path")]
    pub local_db_path: PathBuf,

    /// The legacy shared database file. Required in `shared_file` mode.
    #[serde(default)]
    pub shared_db_path: Option<PathBuf>,
}

fn default_local_db_path() -> PathBuf {
    ProjectDirs::from("com", "daily-report", "history")
        .map(|dirs| dirs.data_dir().join("history.db"))
        .unwrap_or_else(|| PathBuf::from("history.db"))
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            mode: StorageMode::default(),
            local_db_path: default_local_db_path(),
            shared_db_path: None,
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Shared folder batches are exchanged through. Required in
    /// `local_sync` mode.
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,

    /// Interval between background sync cycles (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Nudge the background agent after every local append.
    #[serde(default = "default_true")]
    pub export_on_append: bool,

    /// Re-export records imported from peers, so a machine that only sees
    /// some of the others still forwards their data.
    #[serde(default = "default_true")]
    pub relay_imported: bool,

    /// Upper bound on records per incremental batch.
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,

    /// Own batches older than this are moved to `archive/`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Newest snapshots that are never archived.
    #[serde(default = "default_keep_snapshots")]
    pub keep_latest_snapshots: usize,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> u64 {
    60
}
fn default_max_batch_records() -> usize {
    5000
}
fn default_retention_days() -> u32 {
    30
}
fn default_keep_snapshots() -> usize {
    1
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            shared_dir: None,
            interval_secs: default_interval(),
            export_on_append: true,
            relay_imported: true,
            max_batch_records: default_max_batch_records(),
            retention_days: default_retention_days(),
            keep_latest_snapshots: default_keep_snapshots(),
        }
    }
}

impl SyncSettings {
    /// Returns the sync interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// =============================================================================
// Legacy Shared-File Settings
// =============================================================================

/// Lock and retry knobs for the shared database file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySettings {
    /// How long to wait for the lock file (seconds).
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Retry delay cap (milliseconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// SQLite busy_timeout on the shared file (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Origin stamped on rows migrated from the old `history_rows` table.
    #[serde(default = "default_legacy_origin")]
    pub origin_machine: String,
}

fn default_lock_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    5000
}
fn default_busy_timeout() -> u64 {
    30_000
}
fn default_legacy_origin() -> String {
    "legacy".to_string()
}

impl Default for LegacySettings {
    fn default() -> Self {
        LegacySettings {
            lock_timeout_secs: default_lock_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            busy_timeout_ms: default_busy_timeout(),
            origin_machine: default_legacy_origin(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete history configuration.
///
/// Built once at startup and passed into constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Machine identity.
    #[serde(default)]
    pub machine: MachineConfig,

    /// Database locations and mode.
    #[serde(default)]
    pub storage: StorageSettings,

    /// Batch exchange settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Shared-file mode settings.
    #[serde(default)]
    pub legacy: LegacySettings,
}

impl SyncConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (history.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading history config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| SyncError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<PathBuf> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "History config saved");
        Ok(path)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        MachineId::new(self.machine.id.as_str())
            .map_err(|e| SyncError::InvalidConfig(format!("machine.id: {}", e)))?;

        match self.storage.mode {
            StorageMode::LocalSync => {
                if self.sync.shared_dir.is_none() {
                    return Err(SyncError::InvalidConfig(
                        "sync.shared_dir is required in local_sync mode".into(),
                    ));
                }
            }
            StorageMode::SharedFile => {
                if self.storage.shared_db_path.is_none() {
                    return Err(SyncError::InvalidConfig(
                        "storage.shared_db_path is required in shared_file mode".into(),
                    ));
                }
            }
        }

        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.max_batch_records == 0 {
            return Err(SyncError::InvalidConfig(
                "max_batch_records must be greater than 0".into(),
            ));
        }

        MachineId::new(self.legacy.origin_machine.as_str())
            .map_err(|e| SyncError::InvalidConfig(format!("legacy.origin_machine: {}", e)))?;

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("DAILY_REPORT_MACHINE_ID") {
            debug!(machine = %id, "Overriding machine ID from environment");
            self.machine.id = id;
        }

        if let Ok(mode) = std::env::var("DAILY_REPORT_HISTORY_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding storage mode from environment");
                    self.storage.mode = parsed;
                }
                Err(e) => warn!("Ignoring DAILY_REPORT_HISTORY_MODE: {}", e),
            }
        }

        if let Ok(dir) = std::env::var("DAILY_REPORT_SYNC_DIR") {
            debug!(dir = %dir, "Overriding shared folder from environment");
            self.sync.shared_dir = Some(PathBuf::from(dir));
        }

        if let Ok(path) = std::env::var("DAILY_REPORT_SHARED_DB_PATH") {
            self.storage.shared_db_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("DAILY_REPORT_LOCAL_DB_PATH") {
            self.storage.local_db_path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path for the platform.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "daily-report", "history")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Returns the validated machine id.
    pub fn machine_id(&self) -> SyncResult<MachineId> {
        MachineId::new(self.machine.id.as_str())
            .map_err(|e| SyncError::InvalidConfig(format!("machine.id: {}", e)))
    }

    /// Returns the origin assigned to migrated legacy rows.
    pub fn legacy_origin(&self) -> SyncResult<MachineId> {
        MachineId::new(self.legacy.origin_machine.as_str())
            .map_err(|e| SyncError::InvalidConfig(format!("legacy.origin_machine: {}", e)))
    }

    /// Returns the shared folder, or an error if it is not configured.
    pub fn shared_dir(&self) -> SyncResult<&Path> {
        self.sync
            .shared_dir
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("sync.shared_dir is not set".into()))
    }

    /// Checkpoint file kept next to the local database.
    pub fn checkpoint_path(&self) -> PathBuf {
        let dir = self
            .storage
            .local_db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(crate::checkpoint::CHECKPOINT_FILE_NAME)
    }

    /// Local store settings.
    pub fn to_db_config(&self) -> DbConfig {
        DbConfig::new(&self.storage.local_db_path)
    }

    /// Guard settings for the shared database file.
    pub fn to_guard_config(&self) -> GuardConfig {
        GuardConfig {
            lock_timeout: Duration::from_secs(self.legacy.lock_timeout_secs),
            max_retries: self.legacy.max_retries,
            initial_backoff: Duration::from_millis(self.legacy.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.legacy.max_backoff_ms),
            busy_timeout: Duration::from_millis(self.legacy.busy_timeout_ms),
            ..GuardConfig::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> SyncConfig {
        let mut config = SyncConfig::new();
        config.machine.id = "A".into();
        config.sync.shared_dir = Some(PathBuf::from("/share/history"));
        config
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.storage.mode, StorageMode::LocalSync);
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.max_batch_records, 5000);
        assert_eq!(config.legacy.max_retries, 5);
        assert_eq!(config.legacy.origin_machine, "legacy");
        assert!(config.sync.export_on_append);
        assert!(MachineId::new(config.machine.id.as_str()).is_ok());
    }

    #[test]
    fn test_storage_mode_parsing() {
        assert_eq!("local_sync".parse::<StorageMode>().unwrap(), StorageMode::LocalSync);
        assert_eq!("shared-file".parse::<StorageMode>().unwrap(), StorageMode::SharedFile);
        assert_eq!("LEGACY".parse::<StorageMode>().unwrap(), StorageMode::SharedFile);
        assert!("cloud".parse::<StorageMode>().is_err());
        assert_eq!(StorageMode::SharedFile.to_string(), "shared_file");
    }

    #[test]
    fn test_validation_requires_location_per_mode() {
        let mut config = local_config();
        assert!(config.validate().is_ok());

        config.sync.shared_dir = None;
        assert!(config.validate().unwrap_err().is_config_error());

        config.storage.mode = StorageMode::SharedFile;
        assert!(config.validate().is_err());
        config.storage.shared_db_path = Some(PathBuf::from("/share/history.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_machine_id() {
        let mut config = local_config();
        config.machine.id = "front desk/1".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [machine]
            id = "B"

            [storage]
            mode = "shared_file"
            shared_db_path = "/share/history.db"

            [legacy]
            max_retries = 9
            "#,
        )
        .unwrap();

        assert_eq!(parsed.machine.id, "B");
        assert_eq!(parsed.storage.mode, StorageMode::SharedFile);
        assert_eq!(parsed.legacy.max_retries, 9);
        assert_eq!(parsed.legacy.lock_timeout_secs, 30);
        assert_eq!(parsed.sync.interval_secs, 60);

        let guard = parsed.to_guard_config();
        assert_eq!(guard.max_retries, 9);
        assert_eq!(guard.lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let config = local_config();
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.shared_dir, config.sync.shared_dir);
    }

    #[test]
    fn test_host_names_map_to_valid_ids() {
        assert_eq!(machine_id_from_host("FRONT-DESK-1").as_deref(), Some("FRONT-DESK-1"));
        assert_eq!(machine_id_from_host(" front desk\n").as_deref(), Some("front-desk"));
        assert_eq!(machine_id_from_host("..hidden").as_deref(), Some("hidden"));
        assert_eq!(machine_id_from_host("büro").as_deref(), Some("b-ro"));
        assert_eq!(machine_id_from_host(&"h".repeat(100)).map(|id| id.len()), Some(64));
        assert_eq!(machine_id_from_host(""), None);
        assert_eq!(machine_id_from_host("..."), None);
    }

    #[test]
    fn test_machine_id_stable_across_loads_without_id() {
        if std::env::var("DAILY_REPORT_MACHINE_ID").is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[sync]\nshared_dir = \"/share/history\"\n").unwrap();

        let first = SyncConfig::load(Some(path.clone())).unwrap();
        let second = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(first.machine.id, second.machine.id);
        assert!(first.machine_id().is_ok());
    }

    #[test]
    fn test_checkpoint_path_next_to_db() {
        let mut config = local_config();
        config.storage.local_db_path = PathBuf::from("/data/history.db");
        assert_eq!(
            config.checkpoint_path(),
            PathBuf::from("/data").join(crate::checkpoint::CHECKPOINT_FILE_NAME)
        );
    }
}
