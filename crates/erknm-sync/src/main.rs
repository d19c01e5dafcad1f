//! ERKNM Sync - open-data synchronisation tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use erknm_common::logging::{init_logging, LogConfig, LogLevel};
use erknm_sync::config::SyncConfig;
use erknm_sync::control::SyncController;
use erknm_sync::db::{create_pool, run_migrations, DbConfig};
use erknm_sync::orchestrator::{Orchestrator, RunSummary};
use erknm_sync::reclassify::Reclassifier;
use erknm_sync::store::{PgSyncStore, RecordKind, RunId, SyncStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "erknm-sync")]
#[command(author, version, about = "ERKNM open-data synchronisation tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the feed and ingest new archives
    Sync {
        /// Record the run as operator-initiated
        #[arg(long)]
        manual: bool,
    },

    /// Ingest a local .zip or .xml file
    IngestFile { path: PathBuf },

    /// Close runs orphaned by a crash
    Reconcile,

    /// Ask a run to stop at its next checkpoint
    Stop { run_id: RunId },

    /// Close a run as stopped immediately (defaults to the active run)
    ForceStop { run_id: Option<RunId> },

    /// Start a fresh run after a paused one
    Resume,

    /// Show the active run, if any
    Status,

    /// Delete a finished run and its log entries
    DeleteRun { run_id: RunId },

    /// Re-extract one fragment as the given kind
    ReclassifyFragment { fragment_id: Uuid, kind: RecordKind },

    /// Set a dataset's kind and re-extract its failed or mistyped fragments
    ReclassifyDataset { dataset_id: Uuid, kind: RecordKind },

    /// Apply database migrations
    Migrate,
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Run {} finished as {}: {} files processed, {} records loaded ({:.1}s)",
        summary.run_id,
        summary.status,
        summary.counters.files_processed,
        summary.counters.records_loaded,
        summary.duration_secs
    );
    if let Some(message) = &summary.message {
        println!("  {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("erknm-sync")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let db_config = DbConfig::from_env().context("Failed to load database configuration")?;
    let pool = create_pool(&db_config).await?;

    if matches!(cli.command, Command::Migrate | Command::Sync { .. }) {
        run_migrations(&pool).await?;
        if matches!(cli.command, Command::Migrate) {
            info!("Migrations applied");
            return Ok(());
        }
    }

    let config = SyncConfig::from_env()?;
    config.validate()?;
    let store: Arc<dyn SyncStore> = Arc::new(PgSyncStore::new(pool));
    let orchestrator = Arc::new(Orchestrator::from_config(config, store.clone())?);
    let controller = SyncController::new(orchestrator.clone());

    match cli.command {
        Command::Sync { manual } => {
            let summary = controller.run_sync(manual).await?;
            print_summary(&summary);
        },
        Command::IngestFile { path } => {
            let summary = controller.ingest_file(&path).await?;
            print_summary(&summary);
        },
        Command::Reconcile => {
            let reconciled = controller.reconcile().await?;
            println!("Reconciled {} stale runs", reconciled.len());
            for run in reconciled {
                println!("  {} -> {}", run.id, run.status);
            }
        },
        Command::Stop { run_id } => {
            controller.request_stop(run_id).await?;
            println!("Stop requested for run {}", run_id);
        },
        Command::ForceStop { run_id } => {
            let run_id = controller.force_finish(run_id).await?;
            println!("Run {} force-stopped", run_id);
        },
        Command::Resume => {
            let summary = controller.resume().await?;
            print_summary(&summary);
        },
        Command::Status => {
            let status = controller.status().await?;
            match (&status.active, &status.active_stats) {
                (Some(run), stats) => {
                    println!(
                        "Run {} is {} (started {}, stop requested: {})",
                        run.id, run.status, run.started_at, run.stop_requested
                    );
                    if let Some(stats) = stats {
                        println!(
                            "  {} archives, {} fragments, {} records, {} log entries",
                            stats.archives, stats.fragments, stats.records, stats.log_entries
                        );
                    }
                },
                (None, _) => println!("No sync run is active"),
            }
            if let Some(paused) = &status.latest_paused {
                println!("Paused run {} can be resumed", paused.id);
            }
        },
        Command::DeleteRun { run_id } => {
            let deleted = controller.delete_run(run_id).await?;
            println!(
                "Run {} deleted: {} archives detached, {} log entries removed",
                run_id, deleted.archives_detached, deleted.logs_deleted
            );
        },
        Command::ReclassifyFragment { fragment_id, kind } => {
            let reclassifier = Reclassifier::new(
                store.clone(),
                orchestrator.pipeline().extractor().clone(),
            );
            let outcome = reclassifier.reclassify_fragment(fragment_id, kind).await?;
            println!("Fragment {}: {:?}", fragment_id, outcome);
        },
        Command::ReclassifyDataset { dataset_id, kind } => {
            let reclassifier = Reclassifier::new(
                store.clone(),
                orchestrator.pipeline().extractor().clone(),
            );
            let summary = reclassifier.reclassify_dataset(dataset_id, kind).await?;
            println!(
                "Dataset {}: {} fragments re-extracted, {} records, {} failed",
                dataset_id,
                summary.fragments,
                summary.records,
                summary.failed.len()
            );
            for (fragment, reason) in &summary.failed {
                println!("  {}: {}", fragment, reason);
            }
        },
        Command::Migrate => {},
    }

    Ok(())
}
