//! # Sync Agent
//!
//! Background task that keeps one machine in sync without blocking callers.
//!
//! ## Agent Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncAgent::run                                 │
//! │                                                                         │
//! │  startup ──► import_now()   (pull peers' data before anything else)    │
//! │                                                                         │
//! │  loop select! {                                                        │
//! │      interval.tick()   ──► sync_bidirectional()   every interval_secs  │
//! │      trigger_rx.recv() ──► sync_bidirectional()   nudged after append  │
//! │      shutdown_rx.recv() ──► break                                      │
//! │  }                                                                     │
//! │                                                                         │
//! │  Nudges coalesce: the trigger channel holds one pending nudge, extra   │
//! │  nudges while a cycle runs are dropped.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed cycle is logged and recorded in [`AgentState`]; the loop keeps
//! going and the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::{SyncCoordinator, SyncReport};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Agent State
// =============================================================================

/// What the agent has done so far.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub running: bool,
    /// Completed cycles, including the startup import.
    pub cycles: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

// =============================================================================
// Handle
// =============================================================================

/// Handle for nudging and stopping the agent.
#[derive(Debug, Clone)]
pub struct SyncAgentHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    state: Arc<RwLock<AgentState>>,
}

impl SyncAgentHandle {
    /// Requests a sync cycle soon. Never blocks.
    ///
    /// Returns false once the agent has stopped.
    pub fn nudge(&self) -> bool {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }

    /// Current agent state.
    pub async fn state(&self) -> AgentState {
        self.state.read().await.clone()
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Shutdown channel closed".into()))
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Runs sync cycles on a timer and on demand.
pub struct SyncAgent {
    coordinator: SyncCoordinator,
    interval: Duration,
    import_on_start: bool,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
    state: Arc<RwLock<AgentState>>,
}

impl SyncAgent {
    /// Creates a new agent and returns a handle.
    pub fn new(coordinator: SyncCoordinator, interval: Duration) -> (Self, SyncAgentHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let state = Arc::new(RwLock::new(AgentState::default()));

        let agent = SyncAgent {
            coordinator,
            interval,
            import_on_start: true,
            trigger_rx,
            shutdown_rx,
            state: Arc::clone(&state),
        };

        let handle = SyncAgentHandle {
            trigger_tx,
            shutdown_tx,
            state,
        };

        (agent, handle)
    }

    /// Skips the startup import pass.
    pub fn without_startup_import(mut self) -> Self {
        self.import_on_start = false;
        self
    }

    /// Spawns the agent on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs the agent loop until shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            machine = %self.coordinator.machine(),
            interval_secs = self.interval.as_secs(),
            "Sync agent starting"
        );
        self.state.write().await.running = true;

        if self.import_on_start {
            match self.coordinator.import_now().await {
                Ok(report) => {
                    info!(inserted = report.inserted, "Startup import finished");
                    self.state.write().await.cycles += 1;
                }
                Err(e) => self.record_failure(&e).await,
            }
        }

        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("Scheduled sync");
                    self.cycle().await;
                }

                Some(()) = self.trigger_rx.recv() => {
                    debug!("Sync nudged");
                    self.cycle().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Sync agent shutting down");
                    break;
                }
            }
        }

        self.state.write().await.running = false;
        info!("Sync agent stopped");
    }

    async fn cycle(&self) {
        match self.coordinator.sync_bidirectional().await {
            Ok(report) => {
                let mut state = self.state.write().await;
                state.cycles += 1;
                state.last_error = None;
                state.last_report = Some(report);
            }
            Err(e) => self.record_failure(&e).await,
        }
    }

    async fn record_failure(&self, e: &SyncError) {
        if e.is_store_corrupt() {
            error!(error = %e, "Local store is corrupt, operator action required");
        } else if e.is_retryable() {
            warn!(error = %e, "Sync cycle failed, will retry");
        } else {
            error!(error = %e, "Sync cycle failed");
        }

        let mut state = self.state.write().await;
        state.failures += 1;
        state.last_error = Some(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CHECKPOINT_FILE_NAME;
    use crate::config::SyncSettings;
    use history_core::{MachineId, NewRecord, RecordId};
    use history_db::{DbConfig, LocalStore};
    use tempfile::TempDir;

    async fn coordinator(dir: &TempDir, shared: &std::path::Path) -> SyncCoordinator {
        let store = LocalStore::open(
            DbConfig::new(dir.path().join("history.db")),
            MachineId::new("A").unwrap(),
        )
        .await
        .unwrap();
        SyncCoordinator::new(
            store,
            shared,
            dir.path().join(CHECKPOINT_FILE_NAME),
            &SyncSettings::default(),
        )
        .unwrap()
    }

    async fn wait_for<F: Fn(&AgentState) -> bool>(handle: &SyncAgentHandle, done: F) -> AgentState {
        for _ in 0..200 {
            let state = handle.state().await;
            if done(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.state().await
    }

    #[tokio::test]
    async fn test_nudge_runs_cycle_and_shutdown_stops() {
        let dir = TempDir::new().unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir_all(&shared).unwrap();
        let coordinator = coordinator(&dir, &shared).await;

        coordinator
            .store()
            .append(NewRecord::new(RecordId::new("a1").unwrap()))
            .await
            .unwrap();

        let (agent, handle) = SyncAgent::new(coordinator, Duration::from_secs(3600));
        let task = agent.without_startup_import().spawn();

        assert!(handle.nudge());
        let state = wait_for(&handle, |s| s.cycles >= 1).await;
        assert_eq!(state.cycles, 1);
        assert!(state.last_report.unwrap().exported_batch().is_some());
        assert!(shared.join("A-0001.batch.jsonl").exists());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(!handle.state().await.running);
        assert!(!handle.nudge());
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, &dir.path().join("unmounted")).await;

        let (agent, handle) = SyncAgent::new(coordinator, Duration::from_secs(3600));
        let task = agent.spawn();

        let state = wait_for(&handle, |s| s.failures >= 1).await;
        assert_eq!(state.failures, 1);
        assert!(state.last_error.unwrap().contains("unavailable"));
        assert!(state.running);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
