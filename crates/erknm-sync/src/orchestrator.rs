//! One synchronisation run over the feed
//!
//! The walk is strictly sequential: batch, dataset, version, archive. Every
//! failure below the feed listing is logged and skipped; only a listing
//! failure ends the run with `error`. The stop flag is polled before each
//! batch, dataset and version, once a second during inter-batch pauses, and
//! inside the pipeline and extraction.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::classifier::classify_dataset;
use crate::config::{SyncConfig, SyncOrder};
use crate::error::{SyncError, SyncResult};
use crate::feed::{FeedEntry, FeedLister, HttpFeedClient, ManifestCache, VersionEntry};
use crate::ingest::{ArchiveFetcher, ArchiveOutcome, ArchivePipeline, Extractor, StopSignal};
use crate::log_sink::{LogSink, StoreLogSink};
use crate::store::{
    LogStage, NewDataset, NewDatasetVersion, RunCounters, RunId, RunStatus, SyncRun, SyncStore,
    STOPPED_BY_OPERATOR,
};

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub message: Option<String>,
    pub duration_secs: f64,
}

/// What one dataset contributed to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DatasetOutcome {
    /// At least one version loaded records
    NewData,
    /// Every version was already known
    Repeat,
    /// No versions, or the dataset failed; leaves the repeat counter alone
    Neutral,
    Stopped,
}

/// Mutable state of one walk
struct Walk {
    run_id: RunId,
    config: SyncConfig,
    stop: StopSignal,
    counters: RunCounters,
    consecutive_repeats: u32,
}

fn ordered<T>(mut items: Vec<T>, order: SyncOrder) -> Vec<T> {
    if order == SyncOrder::NewToOld {
        items.reverse();
    }
    items
}

pub fn repeats_message(threshold: u32) -> String {
    format!(
        "Stopped on repeats: {} consecutive already-processed datasets",
        threshold
    )
}

pub struct Orchestrator {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    lister: Arc<dyn FeedLister>,
    manifests: ManifestCache,
    pipeline: ArchivePipeline,
    log: Arc<dyn LogSink>,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn SyncStore>,
        lister: Arc<dyn FeedLister>,
        manifests: ManifestCache,
        pipeline: ArchivePipeline,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            config,
            store,
            lister,
            manifests,
            pipeline,
            log,
        }
    }

    /// Wire the production collaborators: HTTP feed client, manifest cache
    /// under `{download_dir}/meta`, and a log sink writing to the store.
    pub fn from_config(config: SyncConfig, store: Arc<dyn SyncStore>) -> SyncResult<Self> {
        let feed = Arc::new(
            HttpFeedClient::new(config.list_url(), &config.fetch).map_err(SyncError::Feed)?,
        );
        let log: Arc<dyn LogSink> = Arc::new(StoreLogSink::new(store.clone()));
        let fetcher = ArchiveFetcher::new(&config.fetch, config.politeness)?;
        let extractor = Extractor::new(store.clone(), config.commit_batch_size);
        let pipeline = ArchivePipeline::new(
            store.clone(),
            fetcher,
            extractor,
            log.clone(),
            config.zips_dir(),
        );
        let manifests = ManifestCache::new(config.meta_dir(), feed.clone());

        Ok(Self::new(config, store, feed, manifests, pipeline, log))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &ArchivePipeline {
        &self.pipeline
    }

    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log
    }

    /// Create a run and walk the feed to the end.
    pub async fn start(&self, manual: bool) -> SyncResult<RunSummary> {
        let run = self.store.create_run(manual).await?;
        self.execute(&run).await
    }

    /// Walk the feed for a run that already exists in `running`.
    pub async fn execute(&self, run: &SyncRun) -> SyncResult<RunSummary> {
        let started = Instant::now();

        let mut config = self.config.clone();
        match self.store.load_settings().await {
            Ok(settings) => config.apply_overrides(&settings),
            Err(e) => warn!(error = %e, "Could not load settings, using configured defaults"),
        }

        let mut walk = Walk {
            run_id: run.id,
            stop: StopSignal::for_run(self.store.clone(), run.id),
            config,
            counters: RunCounters::default(),
            consecutive_repeats: 0,
        };

        self.general(
            &walk,
            &format!("Sync started, processing order {}", walk.config.sync_order),
        )
        .await;
        if walk.config.stop_on_repeats_enabled {
            self.general(
                &walk,
                &format!(
                    "Stop on repeats enabled: stopping after {} consecutive already-processed datasets",
                    walk.config.stop_on_repeats_count
                ),
            )
            .await;
        }

        self.log
            .info(Some(run.id), "list", "Fetching dataset list", LogStage::List)
            .await;
        let entries = match self.lister.list().await {
            Ok(entries) => entries,
            Err(e) => {
                let message = format!("Failed to retrieve dataset list: {:#}", e);
                self.log
                    .error(Some(run.id), "list", &message, LogStage::List)
                    .await;
                self.store
                    .finish_run(run.id, RunStatus::Error, Some(&message), walk.counters)
                    .await?;
                return Err(SyncError::Feed(e));
            },
        };
        let entries = ordered(entries, walk.config.sync_order);
        self.log
            .info(
                Some(run.id),
                "list",
                &format!("Dataset list parsed, {} datasets", entries.len()),
                LogStage::List,
            )
            .await;

        let (status, message) = self.walk_batches(&mut walk, &entries).await;
        let status = self
            .store
            .finish_run(run.id, status, message.as_deref(), walk.counters)
            .await?;

        let summary = RunSummary {
            run_id: run.id,
            status,
            counters: walk.counters,
            message: if status == RunStatus::Stopped {
                Some(STOPPED_BY_OPERATOR.to_string())
            } else {
                message
            },
            duration_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            run_id = %run.id,
            status = %summary.status,
            files = summary.counters.files_processed,
            records = summary.counters.records_loaded,
            "Sync finished in {:.2}s",
            summary.duration_secs
        );
        Ok(summary)
    }

    async fn walk_batches(
        &self,
        walk: &mut Walk,
        entries: &[FeedEntry],
    ) -> (RunStatus, Option<String>) {
        let batch_size = walk.config.batch_size.max(1);
        let total = entries.len();

        for (index, batch) in entries.chunks(batch_size).enumerate() {
            if walk.stop.should_stop().await {
                return self.stopped(walk, "before batch").await;
            }

            let first = index * batch_size + 1;
            let last = first + batch.len() - 1;
            self.general(walk, &format!("Processing datasets {}-{} of {}", first, last, total))
                .await;

            for entry in batch {
                if walk.stop.should_stop().await {
                    return self.stopped(walk, "before dataset").await;
                }

                match self.process_dataset(walk, entry).await {
                    DatasetOutcome::Stopped => return self.stopped(walk, "during dataset").await,
                    DatasetOutcome::NewData => walk.consecutive_repeats = 0,
                    DatasetOutcome::Neutral => {},
                    DatasetOutcome::Repeat => {
                        if !walk.config.stop_on_repeats_enabled {
                            continue;
                        }
                        walk.consecutive_repeats += 1;
                        let threshold = walk.config.stop_on_repeats_count;
                        self.general(
                            walk,
                            &format!(
                                "Dataset {} already processed (repeat {}/{})",
                                entry.identifier, walk.consecutive_repeats, threshold
                            ),
                        )
                        .await;
                        if walk.consecutive_repeats >= threshold {
                            let message = repeats_message(threshold);
                            self.general(walk, &message).await;
                            return (RunStatus::Completed, Some(message));
                        }
                    },
                }
            }

            if last < total {
                let pause = walk.config.next_batch_pause();
                self.general(
                    walk,
                    &format!("Pausing {:.1}s after datasets {}-{}", pause.as_secs_f64(), first, last),
                )
                .await;
                if self.interruptible_sleep(&walk.stop, pause).await {
                    return self.stopped(walk, "during pause").await;
                }
            }
        }

        if walk.stop.should_stop().await {
            return self.stopped(walk, "at end of run").await;
        }

        self.general(
            walk,
            &format!(
                "Sync completed: {} files processed, {} records loaded",
                walk.counters.files_processed, walk.counters.records_loaded
            ),
        )
        .await;
        (RunStatus::Completed, None)
    }

    async fn process_dataset(&self, walk: &mut Walk, entry: &FeedEntry) -> DatasetOutcome {
        let run_id = Some(walk.run_id);
        self.log
            .info(
                run_id,
                "dataset",
                &format!("Processing dataset {} - {} ({})", entry.identifier, entry.title, entry.link),
                LogStage::Dataset,
            )
            .await;

        let kind = classify_dataset(&entry.identifier, &entry.title, &entry.link);
        let dataset = match self
            .store
            .upsert_dataset(&NewDataset {
                identifier: entry.identifier.clone(),
                title: entry.title.clone(),
                link: entry.link.clone(),
                kind,
            })
            .await
        {
            Ok(dataset) => dataset,
            Err(e) => {
                self.dataset_error(walk, &format!("Failed to store dataset {}: {}", entry.identifier, e))
                    .await;
                return DatasetOutcome::Neutral;
            },
        };

        let manifest = match self.manifests.load(&entry.identifier, &entry.link).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.dataset_error(
                    walk,
                    &format!("Failed to process manifest for {}: {:#}", entry.identifier, e),
                )
                .await;
                return DatasetOutcome::Neutral;
            },
        };

        let versions = ordered(manifest.versions, walk.config.sync_order);
        self.log
            .info(
                run_id,
                "dataset",
                &format!("Manifest of {} lists {} versions", entry.identifier, versions.len()),
                LogStage::Dataset,
            )
            .await;
        if versions.is_empty() {
            return DatasetOutcome::Neutral;
        }

        let mut has_new_data = false;
        for version in &versions {
            if walk.stop.should_stop().await {
                return DatasetOutcome::Stopped;
            }
            match self.process_version(walk, dataset.id, version).await {
                Some(ArchiveOutcome::Cancelled { records }) => {
                    walk.counters.records_loaded += records;
                    return DatasetOutcome::Stopped;
                },
                Some(outcome) => {
                    let records = outcome.records();
                    walk.counters.add_archive(records);
                    has_new_data |= records > 0;
                },
                None => {},
            }
        }

        if has_new_data {
            DatasetOutcome::NewData
        } else {
            DatasetOutcome::Repeat
        }
    }

    /// `None` when the version failed; the failure is already logged.
    async fn process_version(
        &self,
        walk: &Walk,
        dataset_id: crate::store::DatasetId,
        version: &VersionEntry,
    ) -> Option<ArchiveOutcome> {
        let run_id = Some(walk.run_id);
        let record = NewDatasetVersion {
            dataset_id,
            source_url: version.source.clone(),
            created: version.created.clone(),
            provenance: version.provenance.clone(),
            structure: version.structure.clone(),
        };
        if let Err(e) = self.store.insert_version(&record).await {
            self.dataset_error(walk, &format!("Failed to store version {}: {}", version.source, e))
                .await;
            return None;
        }

        self.log
            .info(
                run_id,
                "dataset",
                &format!("Processing archive {}", version.source),
                LogStage::Dataset,
            )
            .await;

        match self
            .pipeline
            .ensure_processed(&version.source, run_id, &walk.stop)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.dataset_error(walk, &format!("Failed to process archive {}: {}", version.source, e))
                    .await;
                None
            },
        }
    }

    /// Sleep for `total`, polling the stop flag once a second. Returns
    /// whether a stop was observed.
    async fn interruptible_sleep(&self, stop: &StopSignal, total: Duration) -> bool {
        let step = Duration::from_secs(1);
        let mut remaining = total;
        while remaining >= step {
            if stop.should_stop().await {
                return true;
            }
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
        false
    }

    async fn stopped(&self, walk: &Walk, step: &str) -> (RunStatus, Option<String>) {
        self.log
            .warning(
                Some(walk.run_id),
                "sync",
                &format!(
                    "Stop requested, halted {} ({} files processed, {} records loaded)",
                    step, walk.counters.files_processed, walk.counters.records_loaded
                ),
                LogStage::General,
            )
            .await;
        (RunStatus::Stopped, Some(STOPPED_BY_OPERATOR.to_string()))
    }

    async fn general(&self, walk: &Walk, message: &str) {
        self.log
            .info(Some(walk.run_id), "sync", message, LogStage::General)
            .await;
    }

    async fn dataset_error(&self, walk: &Walk, message: &str) {
        self.log
            .error(Some(walk.run_id), "dataset", message, LogStage::Dataset)
            .await;
    }
}
