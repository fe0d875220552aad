//! Loop manager.
//!
//! Holds at most one live engine per project and routes lifecycle commands.
//! Dormant projects are answered from their persisted snapshot; `resume`
//! revives a snapshot into a fresh engine when no in-memory run exists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::RwLock;
use tokio::sync::watch;

use crate::domain::{CleanupStep, LoopRun, LoopState, Ticket};
use crate::error::{ForemanError, Result};
use crate::orchestrator::engine::{self, LoopHandle, WorkerChannel};
use crate::orchestrator::snapshot::SnapshotStore;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Snapshot file location.
    pub snapshot_path: PathBuf,
    /// Cleanup pipeline run after each ticket's primary step.
    pub pipeline: Vec<CleanupStep>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            snapshot_path: crate::paths::default_snapshot_path(),
            pipeline: CleanupStep::default_pipeline(),
        }
    }
}

impl OrchestratorConfig {
    /// Config with a custom snapshot path.
    pub fn with_snapshot_path(path: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_path: path.into(),
            ..Default::default()
        }
    }
}

/// Per-project loop lifecycle, one live engine per project at most.
pub struct LoopManager<C: WorkerChannel> {
    channel: Arc<C>,
    store: SnapshotStore,
    pipeline: Vec<CleanupStep>,
    active: RwLock<HashMap<String, LoopHandle>>,
}

impl<C: WorkerChannel> LoopManager<C> {
    /// Create a manager submitting through `channel`.
    pub fn new(channel: Arc<C>, config: OrchestratorConfig) -> Self {
        Self {
            channel,
            store: SnapshotStore::new(config.snapshot_path),
            pipeline: config.pipeline,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// The snapshot store backing this manager.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Start a loop over `tickets` for one project.
    ///
    /// An empty queue creates no run. A project with a live engine, or with
    /// an unfinished snapshot, is rejected; resume or discard it first.
    pub async fn start(&self, project_id: &str, working_directory: PathBuf, tickets: Vec<Ticket>) -> Result<()> {
        if tickets.is_empty() {
            return Err(ForemanError::NoTickets);
        }

        let mut active = self.active.write().await;
        active.retain(|_, handle| !handle.is_finished());
        if active.contains_key(project_id) {
            return Err(ForemanError::InvalidState(format!(
                "project {} already has a live run",
                project_id
            )));
        }
        if self.store.load(project_id)?.is_some() {
            return Err(ForemanError::InvalidState(format!(
                "project {} has an unfinished run; resume or discard it",
                project_id
            )));
        }

        let run = LoopRun::new(project_id, working_directory, tickets);
        info!(
            "starting loop {} for project {} ({} tickets)",
            run.run_id,
            project_id,
            run.queue.len()
        );
        self.store.save(&run)?;

        let handle = engine::spawn(
            Arc::clone(&self.channel),
            self.store.clone(),
            self.pipeline.clone(),
            run,
        );
        active.insert(project_id.to_string(), handle);
        Ok(())
    }

    /// Pause a project's live loop at its next step boundary.
    pub async fn pause(&self, project_id: &str, reason: impl Into<String>) -> Result<()> {
        let active = self.active.read().await;
        match active.get(project_id) {
            Some(handle) if !handle.is_finished() => handle.pause(reason).await,
            _ => Err(ForemanError::InvalidState(format!(
                "project {} has no live run",
                project_id
            ))),
        }
    }

    /// Resume a project's loop.
    ///
    /// A live paused engine is resumed in place; otherwise the last
    /// snapshot is reloaded and a fresh engine continues from its recorded
    /// position without re-running completed steps.
    pub async fn resume(&self, project_id: &str) -> Result<()> {
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(project_id)
                && !handle.is_finished()
            {
                return handle.resume().await;
            }
        }

        let mut active = self.active.write().await;
        active.retain(|_, handle| !handle.is_finished());
        if let Some(handle) = active.get(project_id) {
            return handle.resume().await;
        }

        let run = self
            .store
            .load(project_id)?
            .ok_or_else(|| ForemanError::InvalidState(format!("project {} has no run to resume", project_id)))?;
        info!(
            "resuming loop {} for project {} at ticket index {}",
            run.run_id, project_id, run.next_index
        );
        let handle = engine::spawn(
            Arc::clone(&self.channel),
            self.store.clone(),
            self.pipeline.clone(),
            run,
        );
        active.insert(project_id.to_string(), handle);
        Ok(())
    }

    /// Cancel a project's loop. A live engine is cancelled cooperatively; a
    /// dormant snapshot is discarded outright.
    pub async fn cancel(&self, project_id: &str) -> Result<()> {
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(project_id)
                && !handle.is_finished()
            {
                return handle.cancel().await;
            }
        }

        if self.store.load(project_id)?.is_some() {
            debug!("discarding dormant run for project {}", project_id);
            return self.store.remove(project_id);
        }
        Err(ForemanError::InvalidState(format!(
            "project {} has no run to cancel",
            project_id
        )))
    }

    /// Drop a project's persisted snapshot without running it.
    pub async fn discard(&self, project_id: &str) -> Result<()> {
        let active = self.active.read().await;
        if let Some(handle) = active.get(project_id)
            && !handle.is_finished()
        {
            return Err(ForemanError::InvalidState(format!(
                "project {} has a live run; cancel it first",
                project_id
            )));
        }
        drop(active);
        self.store.remove(project_id)
    }

    /// The project's current state: live engine state, else persisted
    /// snapshot state, else idle.
    pub async fn state(&self, project_id: &str) -> Result<LoopState> {
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(project_id) {
                return Ok(handle.state());
            }
        }
        match self.store.load(project_id)? {
            Some(run) => Ok(run.state),
            None => Ok(LoopState::Idle),
        }
    }

    /// Watch a live project's state transitions.
    pub async fn watch(&self, project_id: &str) -> Option<watch::Receiver<LoopState>> {
        let active = self.active.read().await;
        active.get(project_id).map(|handle| handle.state_changes())
    }

    /// Wait for a project's live engine to finish and return its final
    /// state. Returns the stored/idle state when no engine is live.
    pub async fn join(&self, project_id: &str) -> Result<LoopState> {
        let handle = {
            let mut active = self.active.write().await;
            active.remove(project_id)
        };
        match handle {
            Some(handle) => Ok(handle.join().await),
            None => self.state(project_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunSummary;
    use crate::error::Result as ForemanResult;
    use crate::protocol::EventEnvelope;
    use crate::session::{PendingStep, StepSubmission};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// Channel where every step succeeds instantly.
    struct InstantChannel {
        events: broadcast::Sender<EventEnvelope>,
    }

    impl InstantChannel {
        fn new() -> Self {
            let (events, _) = broadcast::channel(256);
            Self { events }
        }
    }

    #[async_trait]
    impl WorkerChannel for InstantChannel {
        async fn submit(&self, submission: StepSubmission) -> ForemanResult<PendingStep> {
            let events = self.events.subscribe();
            let tx = self.events.clone();
            let rid = submission.request_id.clone();
            tokio::spawn(async move {
                let _ = tx.send(EventEnvelope::TicketCompleted {
                    request_id: rid,
                    success: true,
                    summary: None,
                });
            });
            Ok(PendingStep::attach(submission.request_id, "wt-1".into(), false, events))
        }

        async fn cancel(&self, _request_id: &str) -> ForemanResult<()> {
            Ok(())
        }
    }

    fn test_manager() -> (LoopManager<InstantChannel>, TempDir) {
        let temp = TempDir::new().unwrap();
        let config = OrchestratorConfig::with_snapshot_path(temp.path().join("loops.json"));
        (LoopManager::new(Arc::new(InstantChannel::new()), config), temp)
    }

    fn tickets(n: usize) -> Vec<Ticket> {
        (1..=n)
            .map(|i| Ticket::new(format!("T-{}", i), format!("Ticket {}", i), "work"))
            .collect()
    }

    #[test]
    fn test_orchestrator_config_default() {
        let config = OrchestratorConfig::default();
        assert!(config.snapshot_path.ends_with("foreman/loops.json"));
        assert_eq!(config.pipeline.len(), 6);
    }

    #[tokio::test]
    async fn test_empty_queue_creates_no_run() {
        let (manager, _temp) = test_manager();
        let err = manager
            .start("proj", PathBuf::from("/tmp/w"), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::NoTickets));
        assert!(manager.store().load("proj").unwrap().is_none());
        assert_eq!(manager.state("proj").await.unwrap(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_start_and_join_completes() {
        let (manager, _temp) = test_manager();
        manager
            .start("proj", PathBuf::from("/tmp/w"), tickets(2))
            .await
            .unwrap();

        let final_state = manager.join("proj").await.unwrap();
        assert_eq!(
            final_state,
            LoopState::Completed {
                summary: RunSummary {
                    total: 2,
                    completed: 2,
                    cancelled: false,
                }
            }
        );
        // Back to idle after terminal completion
        assert_eq!(manager.state("proj").await.unwrap(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_double_start_rejected_while_live() {
        let (manager, _temp) = test_manager();
        // A queue long enough to still be running when the second start lands
        manager
            .start("proj", PathBuf::from("/tmp/w"), tickets(50))
            .await
            .unwrap();

        let second = manager.start("proj", PathBuf::from("/tmp/w"), tickets(1)).await;
        assert!(matches!(second, Err(ForemanError::InvalidState(_))));

        manager.join("proj").await.unwrap();
    }

    #[tokio::test]
    async fn test_projects_run_independently() {
        let (manager, _temp) = test_manager();
        manager.start("proj-a", PathBuf::from("/tmp/a"), tickets(1)).await.unwrap();
        manager.start("proj-b", PathBuf::from("/tmp/b"), tickets(1)).await.unwrap();

        assert!(matches!(
            manager.join("proj-a").await.unwrap(),
            LoopState::Completed { .. }
        ));
        assert!(matches!(
            manager.join("proj-b").await.unwrap(),
            LoopState::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_without_any_run_is_invalid() {
        let (manager, _temp) = test_manager();
        let err = manager.resume("proj").await.unwrap_err();
        assert!(matches!(err, ForemanError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_resume_revives_dormant_snapshot() {
        let temp = TempDir::new().unwrap();
        let config = OrchestratorConfig::with_snapshot_path(temp.path().join("loops.json"));

        // A snapshot left behind by an earlier process
        let run = LoopRun::new("proj", PathBuf::from("/tmp/w"), tickets(1));
        {
            let store = SnapshotStore::new(temp.path().join("loops.json"));
            store.save(&run).unwrap();
        }

        let manager = LoopManager::new(Arc::new(InstantChannel::new()), config);
        manager.resume("proj").await.unwrap();
        let final_state = manager.join("proj").await.unwrap();
        assert!(matches!(final_state, LoopState::Completed { .. }));
        assert!(manager.store().load("proj").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_rejected_while_unfinished_snapshot_exists() {
        let (manager, _temp) = test_manager();
        let run = LoopRun::new("proj", PathBuf::from("/tmp/w"), tickets(1));
        manager.store().save(&run).unwrap();

        let err = manager
            .start("proj", PathBuf::from("/tmp/w"), tickets(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidState(_)));

        // Discard clears the way
        manager.discard("proj").await.unwrap();
        manager.start("proj", PathBuf::from("/tmp/w"), tickets(1)).await.unwrap();
        manager.join("proj").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_dormant_run_discards_snapshot() {
        let (manager, _temp) = test_manager();
        let run = LoopRun::new("proj", PathBuf::from("/tmp/w"), tickets(1));
        manager.store().save(&run).unwrap();

        manager.cancel("proj").await.unwrap();
        assert!(manager.store().load("proj").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_nothing_is_invalid() {
        let (manager, _temp) = test_manager();
        let err = manager.cancel("proj").await.unwrap_err();
        assert!(matches!(err, ForemanError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_pause_requires_live_run() {
        let (manager, _temp) = test_manager();
        let err = manager.pause("proj", "because").await.unwrap_err();
        assert!(matches!(err, ForemanError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_state_reads_snapshot_for_dormant_project() {
        let (manager, _temp) = test_manager();
        let run = LoopRun::new("proj", PathBuf::from("/tmp/w"), tickets(1));
        manager.store().save(&run).unwrap();

        let state = manager.state("proj").await.unwrap();
        assert_eq!(state, LoopState::PreparingQueue);
    }
}
