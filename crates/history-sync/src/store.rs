//! # History Store
//!
//! The single entry point the report layer uses: `append`, `query`,
//! `sync_bidirectional`, `status`. The storage strategy is picked once at
//! startup from `storage.mode` and never changes while the process runs.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          HistoryStore                                   │
//! │                                                                         │
//! │  LocalSync                          │  SharedFile (legacy)              │
//! │  ─────────                          │  ───────────────────              │
//! │  LocalStore (local disk, WAL)       │  SharedStore (network share)      │
//! │  SyncCoordinator + SyncAgent        │  every write under lock + retry   │
//! │  append nudges the agent            │  sync_bidirectional is a no-op    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use history_core::{HistoryFilter, MachineId, NewRecord, RecordId};
use history_db::{AppendOutcome, LocalStore, RecordCursor, SharedStore};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{SyncAgent, SyncAgentHandle};
use crate::config::{StorageMode, SyncConfig};
use crate::coordinator::{SyncCoordinator, SyncReport, SyncStatus};
use crate::error::{SyncError, SyncResult};

/// Status across both strategies.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub machine: MachineId,
    pub mode: StorageMode,
    pub local_records: i64,
    /// Schema migrations embedded in this build.
    pub migrations_total: usize,
    /// Schema migrations applied to the database.
    pub migrations_applied: usize,
    /// Present in `local_sync` mode only.
    pub sync: Option<SyncStatus>,
}

/// Local store plus batch exchange.
#[derive(Debug)]
pub struct LocalSyncStore {
    coordinator: SyncCoordinator,
    agent: Option<SyncAgentHandle>,
    agent_task: Option<JoinHandle<()>>,
    export_on_append: bool,
}

/// History store, one strategy per process.
#[derive(Debug)]
pub enum HistoryStore {
    LocalSync(LocalSyncStore),
    SharedFile(Arc<SharedStore>),
}

impl HistoryStore {
    /// Opens the store selected by `config.storage.mode`.
    ///
    /// In `local_sync` mode this does not start the background agent; call
    /// [`start_agent`](Self::start_agent) for that.
    pub async fn open(config: &SyncConfig) -> SyncResult<Self> {
        let machine = config.machine_id()?;

        match config.storage.mode {
            StorageMode::LocalSync => {
                let store = LocalStore::open(config.to_db_config(), machine).await?;
                let coordinator = SyncCoordinator::open(store, config)?;
                info!(
                    shared_dir = %coordinator.shared_dir().display(),
                    "History store ready (local_sync)"
                );
                Ok(HistoryStore::LocalSync(LocalSyncStore {
                    coordinator,
                    agent: None,
                    agent_task: None,
                    export_on_append: config.sync.export_on_append,
                }))
            }
            StorageMode::SharedFile => {
                let path = config.storage.shared_db_path.as_ref().ok_or_else(|| {
                    SyncError::InvalidConfig("storage.shared_db_path is not set".into())
                })?;
                warn!(
                    path = %path.display(),
                    "Using shared database file directly; local_sync is the safer mode"
                );
                let store = SharedStore::open(path, config.to_guard_config(), machine).await?;
                Ok(HistoryStore::SharedFile(Arc::new(store)))
            }
        }
    }

    /// Starts the background sync agent (local_sync only). The agent runs one
    /// import pass right away, then syncs on the configured interval and
    /// whenever `append` nudges it.
    pub fn start_agent(&mut self, config: &SyncConfig) {
        if let HistoryStore::LocalSync(local) = self {
            if local.agent.is_some() {
                return;
            }
            let (agent, handle) = SyncAgent::new(local.coordinator.clone(), config.sync.interval());
            local.agent_task = Some(agent.spawn());
            local.agent = Some(handle);
        }
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            HistoryStore::LocalSync(_) => StorageMode::LocalSync,
            HistoryStore::SharedFile(_) => StorageMode::SharedFile,
        }
    }

    pub fn machine(&self) -> &MachineId {
        match self {
            HistoryStore::LocalSync(local) => local.coordinator.machine(),
            HistoryStore::SharedFile(shared) => shared.machine(),
        }
    }

    /// The coordinator, in local_sync mode.
    pub fn coordinator(&self) -> Option<&SyncCoordinator> {
        match self {
            HistoryStore::LocalSync(local) => Some(&local.coordinator),
            HistoryStore::SharedFile(_) => None,
        }
    }

    /// Appends a record. A record whose identity is already stored is left
    /// untouched and reported as `AlreadyPresent`.
    pub async fn append(&self, record: NewRecord) -> SyncResult<AppendOutcome> {
        match self {
            HistoryStore::LocalSync(local) => {
                let outcome = local.coordinator.store().append(record).await?;
                if outcome.is_inserted() && local.export_on_append {
                    if let Some(agent) = &local.agent {
                        agent.nudge();
                    }
                }
                Ok(outcome)
            }
            HistoryStore::SharedFile(shared) => Ok(shared.append(record).await?),
        }
    }

    pub async fn exists(&self, identity: &RecordId) -> SyncResult<bool> {
        Ok(match self {
            HistoryStore::LocalSync(local) => local.coordinator.store().exists(identity).await?,
            HistoryStore::SharedFile(shared) => shared.exists(identity).await?,
        })
    }

    /// Lazy ordered query over matching records.
    pub fn query(&self, filter: HistoryFilter) -> RecordCursor {
        match self {
            HistoryStore::LocalSync(local) => local.coordinator.store().query(filter),
            HistoryStore::SharedFile(shared) => shared.query(filter),
        }
    }

    /// Runs one sync cycle now. Zero work in shared_file mode.
    pub async fn sync_bidirectional(&self) -> SyncResult<SyncReport> {
        match self {
            HistoryStore::LocalSync(local) => local.coordinator.sync_bidirectional().await,
            HistoryStore::SharedFile(_) => Ok(SyncReport::default()),
        }
    }

    pub async fn status(&self) -> SyncResult<StoreStatus> {
        match self {
            HistoryStore::LocalSync(local) => {
                let sync = local.coordinator.status().await?;
                let (migrations_total, migrations_applied) =
                    local.coordinator.store().migration_status().await?;
                Ok(StoreStatus {
                    machine: sync.machine.clone(),
                    mode: StorageMode::LocalSync,
                    local_records: sync.local_records,
                    migrations_total,
                    migrations_applied,
                    sync: Some(sync),
                })
            }
            HistoryStore::SharedFile(shared) => {
                let (migrations_total, migrations_applied) = shared.migration_status().await?;
                Ok(StoreStatus {
                    machine: shared.machine().clone(),
                    mode: StorageMode::SharedFile,
                    local_records: shared.count().await?,
                    migrations_total,
                    migrations_applied,
                    sync: None,
                })
            }
        }
    }

    /// Stops the agent (if running) and closes the database.
    pub async fn close(self) -> SyncResult<()> {
        match self {
            HistoryStore::LocalSync(local) => {
                if let Some(agent) = &local.agent {
                    agent.shutdown().await?;
                }
                if let Some(task) = local.agent_task {
                    task.await
                        .map_err(|e| SyncError::Internal(format!("sync agent panicked: {}", e)))?;
                }
                local.coordinator.store().close().await;
            }
            HistoryStore::SharedFile(shared) => shared.close().await,
        }
        Ok(())
    }
}
