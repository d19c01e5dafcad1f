//! Operator control surface
//!
//! The store decides whether a run is active. The controller keeps the id
//! of the run it launched as a hint only, and drops the hint whenever the
//! store disagrees.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::manual;
use crate::orchestrator::{Orchestrator, RunSummary};
use crate::store::{DeletedRun, ReconciledRun, RunId, RunStats, SyncRun, SyncStore};

/// Message written on runs halted with [`SyncController::force_finish`]
pub const FORCE_STOPPED: &str = "Force-stopped by operator";

#[derive(Debug, Clone)]
pub struct SyncStatus {
    /// Run in `running` or `stopping`, as the store reports it
    pub active: Option<SyncRun>,
    pub active_stats: Option<RunStats>,
    pub latest_paused: Option<SyncRun>,
}

impl SyncStatus {
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

#[derive(Clone)]
pub struct SyncController {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SyncStore>,
    hint: Arc<Mutex<Option<RunId>>>,
}

impl SyncController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator,
            store,
            hint: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Force-close runs orphaned by a crash.
    pub async fn reconcile(&self) -> SyncResult<Vec<ReconciledRun>> {
        let threshold = self.orchestrator.config().stale_run_threshold();
        let reconciled = self.store.reconcile_stale_runs(threshold).await?;
        for run in &reconciled {
            warn!(run_id = %run.id, status = %run.status, "Reconciled stale run");
        }
        Ok(reconciled)
    }

    /// Reconcile, refuse if a run is still active, then create a new run.
    async fn begin(&self, manual: bool) -> SyncResult<SyncRun> {
        self.reconcile().await?;
        if let Some(active) = self.store.active_run().await? {
            return Err(SyncError::AlreadyRunning(active.id));
        }

        let run = self.store.create_run(manual).await?;
        *self.hint.lock().await = Some(run.id);
        info!(run_id = %run.id, manual, "Sync run created");
        Ok(run)
    }

    /// Run a sync in the foreground and return when it ends.
    pub async fn run_sync(&self, manual: bool) -> SyncResult<RunSummary> {
        let run = self.begin(manual).await?;
        let result = self.orchestrator.execute(&run).await;
        self.clear_hint(run.id).await;
        result
    }

    /// Start a sync on a background task.
    pub async fn start(
        &self,
        manual: bool,
    ) -> SyncResult<(RunId, JoinHandle<SyncResult<RunSummary>>)> {
        let run = self.begin(manual).await?;
        let run_id = run.id;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.orchestrator.execute(&run).await;
            this.clear_hint(run.id).await;
            result
        });
        Ok((run_id, handle))
    }

    /// Ingest an operator-supplied `.zip` or `.xml` in its own manual run.
    pub async fn ingest_file(&self, path: &Path) -> SyncResult<RunSummary> {
        let run = self.begin(true).await?;
        let result = manual::ingest_into_run(&self.orchestrator, &run, path).await;
        self.clear_hint(run.id).await;
        result
    }

    /// Ask a run to stop at its next checkpoint. Idempotent.
    pub async fn request_stop(&self, run_id: RunId) -> SyncResult<()> {
        if !self.store.request_stop(run_id).await? {
            return Err(SyncError::not_found("Sync run", run_id));
        }
        info!(run_id = %run_id, "Stop requested");
        Ok(())
    }

    /// Request a stop of whichever run is active, if any.
    pub async fn stop_active(&self) -> SyncResult<Option<RunId>> {
        match self.store.active_run().await? {
            Some(run) => {
                self.request_stop(run.id).await?;
                Ok(Some(run.id))
            },
            None => Ok(None),
        }
    }

    /// Close a run as `stopped` right away, without waiting for the worker.
    /// `None` targets the active run.
    pub async fn force_finish(&self, run_id: Option<RunId>) -> SyncResult<RunId> {
        let run_id = match run_id {
            Some(id) => id,
            None => self
                .store
                .active_run()
                .await?
                .map(|run| run.id)
                .ok_or_else(|| SyncError::not_found("Active sync run", "any"))?,
        };

        // Raise the flag first so a live worker winds down on its own
        self.store.request_stop(run_id).await?;
        if !self.store.force_finish(run_id, FORCE_STOPPED).await? {
            return match self.store.get_run(run_id).await? {
                Some(run) => Err(SyncError::invalid(format!(
                    "Sync run {} already finished as {}",
                    run_id, run.status
                ))),
                None => Err(SyncError::not_found("Sync run", run_id)),
            };
        }
        self.clear_hint(run_id).await;
        warn!(run_id = %run_id, "Sync run force-stopped");
        Ok(run_id)
    }

    /// Start a fresh run if a paused one exists. The paused run stays as
    /// history.
    pub async fn resume(&self) -> SyncResult<RunSummary> {
        let paused = self
            .store
            .latest_paused_run()
            .await?
            .ok_or_else(|| SyncError::not_found("Paused sync run", "any"))?;
        info!(paused_run = %paused.id, "Resuming with a fresh run");
        self.run_sync(paused.is_manual).await
    }

    /// Remove a finished run and its log entries. Archives it downloaded are
    /// kept and detached.
    pub async fn delete_run(&self, run_id: RunId) -> SyncResult<DeletedRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Sync run", run_id))?;
        if run.status.is_active() {
            return Err(SyncError::invalid(format!(
                "Sync run {} is still {}; stop it first",
                run_id, run.status
            )));
        }

        let deleted = self.store.delete_run(run_id).await?;
        info!(
            run_id = %run_id,
            archives_detached = deleted.archives_detached,
            logs_deleted = deleted.logs_deleted,
            "Sync run deleted"
        );
        Ok(deleted)
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let active = self.store.active_run().await?;

        {
            let mut hint = self.hint.lock().await;
            if let Some(hinted) = *hint {
                if active.as_ref().map(|run| run.id) != Some(hinted) {
                    debug!(run_id = %hinted, "Dropping stale in-process run hint");
                    *hint = None;
                }
            }
        }

        let active_stats = match &active {
            Some(run) => Some(self.store.run_stats(run.id).await?),
            None => None,
        };
        let latest_paused = self.store.latest_paused_run().await?;

        Ok(SyncStatus {
            active,
            active_stats,
            latest_paused,
        })
    }

    /// Run id this process launched, if the hint has not been cleared.
    pub async fn hinted_run(&self) -> Option<RunId> {
        *self.hint.lock().await
    }

    async fn clear_hint(&self, run_id: RunId) {
        let mut hint = self.hint.lock().await;
        if *hint == Some(run_id) {
            *hint = None;
        }
    }
}
