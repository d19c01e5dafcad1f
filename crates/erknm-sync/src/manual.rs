//! Ingestion of operator-supplied files
//!
//! A local `.zip` goes through the same hash dedup, selection and
//! extraction as a downloaded archive; a bare `.xml` document is extracted
//! directly. Either way the file is tracked as the archive
//! `manual://{file name}` and processed in its own manual run.

use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::ingest::fetch::{check_archive, not_zip_diagnostic};
use crate::ingest::{ArchiveOutcome, SkipReason, StopSignal};
use crate::orchestrator::{Orchestrator, RunSummary};
use crate::store::{ArchiveStatus, LogStage, RunCounters, RunStatus, SyncRun, STOPPED_BY_OPERATOR};

const LOG_CATEGORY: &str = "manual";

/// How a local file should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFileKind {
    Zip,
    Xml,
}

impl LocalFileKind {
    /// By extension, case-insensitive
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "zip" => Some(LocalFileKind::Zip),
            "xml" => Some(LocalFileKind::Xml),
            _ => None,
        }
    }
}

pub fn manual_url(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!("manual://{}", name)
}

/// Create a manual run and ingest `path` into it.
pub async fn ingest_local_file(orchestrator: &Orchestrator, path: &Path) -> SyncResult<RunSummary> {
    let run = orchestrator.store().create_run(true).await?;
    ingest_into_run(orchestrator, &run, path).await
}

/// Ingest `path` into an existing run and finish the run.
pub async fn ingest_into_run(
    orchestrator: &Orchestrator,
    run: &SyncRun,
    path: &Path,
) -> SyncResult<RunSummary> {
    let started = Instant::now();
    let store = orchestrator.store();
    let log = orchestrator.log_sink();

    let result = ingest(orchestrator, run, path).await;

    let mut counters = RunCounters::default();
    let (status, message) = match &result {
        Ok(ArchiveOutcome::Cancelled { records }) => {
            counters.records_loaded = *records;
            (RunStatus::Stopped, Some(STOPPED_BY_OPERATOR.to_string()))
        },
        Ok(outcome) => {
            counters.add_archive(outcome.records());
            log.info(
                Some(run.id),
                LOG_CATEGORY,
                &format!(
                    "Finished {}: {} files processed, {} records loaded",
                    path.display(),
                    counters.files_processed,
                    counters.records_loaded
                ),
                LogStage::General,
            )
            .await;
            (RunStatus::Completed, None)
        },
        Err(e) => {
            let message = format!("Failed to process {}: {}", path.display(), e);
            log.error(Some(run.id), LOG_CATEGORY, &message, LogStage::General)
                .await;
            (RunStatus::Error, Some(message))
        },
    };

    let status = store
        .finish_run(run.id, status, message.as_deref(), counters)
        .await?;
    result?;

    Ok(RunSummary {
        run_id: run.id,
        status,
        counters,
        message,
        duration_secs: started.elapsed().as_secs_f64(),
    })
}

async fn ingest(
    orchestrator: &Orchestrator,
    run: &SyncRun,
    path: &Path,
) -> SyncResult<ArchiveOutcome> {
    if !tokio::fs::try_exists(path).await? {
        return Err(SyncError::not_found("File", path.display()));
    }
    let kind = LocalFileKind::detect(path).ok_or_else(|| {
        SyncError::invalid(format!("{} is neither a .zip nor an .xml file", path.display()))
    })?;

    let store = orchestrator.store();
    let pipeline = orchestrator.pipeline();
    let stop = StopSignal::for_run(store.clone(), run.id);
    let url = manual_url(path);

    orchestrator
        .log_sink()
        .info(
            Some(run.id),
            LOG_CATEGORY,
            &format!("Processing file {}", path.display()),
            LogStage::General,
        )
        .await;

    if let Some(existing) = store.find_archive_by_url(&url).await? {
        if existing.status == ArchiveStatus::Processed {
            info!(url = %url, "Manual file already processed");
            return Ok(ArchiveOutcome::Skipped(SkipReason::AlreadyProcessed));
        }
    }

    match kind {
        LocalFileKind::Zip => {
            let check_path = path.to_path_buf();
            let verdict = tokio::task::spawn_blocking(move || check_archive(&check_path))
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))??;
            if let Err(bad) = verdict {
                return Err(SyncError::invalid(not_zip_diagnostic(&url, "local file", &bad)));
            }

            let archive = store.register_archive(&url, Some(run.id)).await?;
            pipeline.process_local(&archive, path, Some(run.id), &stop).await
        },
        LocalFileKind::Xml => {
            let archive = store.register_archive(&url, Some(run.id)).await?;
            pipeline
                .process_document(&archive, path, Some(run.id), &stop)
                .await
        },
    }
}
