//! Operator-facing run log
//!
//! Entries go to the `operation_log` table and are mirrored to `tracing` at
//! the matching level. Writing an entry never fails from the caller's point
//! of view.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::store::{LogSeverity, LogStage, NewLogEntry, RunId, SyncStore};

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(
        &self,
        run_id: Option<RunId>,
        category: &str,
        message: &str,
        level: LogSeverity,
        stage: LogStage,
    );

    async fn info(&self, run_id: Option<RunId>, category: &str, message: &str, stage: LogStage) {
        self.log(run_id, category, message, LogSeverity::Info, stage)
            .await
    }

    async fn warning(&self, run_id: Option<RunId>, category: &str, message: &str, stage: LogStage) {
        self.log(run_id, category, message, LogSeverity::Warning, stage)
            .await
    }

    async fn error(&self, run_id: Option<RunId>, category: &str, message: &str, stage: LogStage) {
        self.log(run_id, category, message, LogSeverity::Error, stage)
            .await
    }
}

/// Sink that persists through a [`SyncStore`]
pub struct StoreLogSink {
    store: Arc<dyn SyncStore>,
}

impl StoreLogSink {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }
}

fn trace_entry(run_id: Option<RunId>, category: &str, message: &str, level: LogSeverity, stage: LogStage) {
    let run = run_id.map(|id| id.to_string()).unwrap_or_default();
    match level {
        LogSeverity::Info => info!(run_id = %run, category, stage = %stage, "{}", message),
        LogSeverity::Warning => warn!(run_id = %run, category, stage = %stage, "{}", message),
        LogSeverity::Error => error!(run_id = %run, category, stage = %stage, "{}", message),
    }
}

#[async_trait]
impl LogSink for StoreLogSink {
    async fn log(
        &self,
        run_id: Option<RunId>,
        category: &str,
        message: &str,
        level: LogSeverity,
        stage: LogStage,
    ) {
        trace_entry(run_id, category, message, level, stage);

        let entry = NewLogEntry {
            run_id,
            category: category.to_string(),
            message: message.to_string(),
            level,
            stage,
        };
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(error = %e, category, "Failed to persist log entry");
        }
    }
}

/// Sink that only emits tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn log(
        &self,
        run_id: Option<RunId>,
        category: &str,
        message: &str,
        level: LogSeverity,
        stage: LogStage,
    ) {
        trace_entry(run_id, category, message, level, stage);
    }
}
