//! Shared fixtures for erknm-sync integration tests
//!
//! [`MemoryStore`] mirrors the state rules of the Postgres store closely
//! enough to drive the orchestrator and pipeline without a database.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use erknm_sync::config::PolitenessConfig;
use erknm_sync::db::{DbError, DbResult};
use erknm_sync::feed::{FeedEntry, FeedLister, ManifestCache, MetadataFetcher};
use erknm_sync::ingest::{ArchiveFetcher, ArchivePipeline, BackoffPolicy, Extractor};
use erknm_sync::log_sink::StoreLogSink;
use erknm_sync::orchestrator::Orchestrator;
use erknm_sync::config::SyncConfig;
use erknm_sync::store::*;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[ctor::ctor]
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,erknm_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct State {
    pub runs: Vec<SyncRun>,
    pub datasets: Vec<Dataset>,
    pub versions: Vec<NewDatasetVersion>,
    pub archives: Vec<Archive>,
    pub fragments: Vec<Fragment>,
    pub records: Vec<NewRecord>,
    pub logs: Vec<NewLogEntry>,
    pub settings: HashMap<String, String>,
    pub insert_calls: usize,
    /// Largest batch handed to `insert_records`
    pub max_batch: usize,
    /// Raise the stop flag of every active run after this many batches
    pub stop_after_batches: Option<usize>,
    /// Records with these keys fail to insert
    pub failing_keys: HashSet<String>,
    /// Every `append_log` fails
    pub fail_logs: bool,
    /// Count inserted records without keeping them
    pub discard_records: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    pub state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.with(|s| s.settings.insert(key.to_string(), value.to_string()));
    }

    pub fn stop_after_batches(&self, batches: usize) {
        self.with(|s| s.stop_after_batches = Some(batches));
    }

    pub fn record_count(&self) -> usize {
        self.with(|s| s.records.len())
    }

    pub fn run(&self, id: RunId) -> SyncRun {
        self.with(|s| s.runs.iter().find(|r| r.id == id).cloned().unwrap())
    }

    pub fn archive(&self, url: &str) -> Option<Archive> {
        self.with(|s| s.archives.iter().find(|a| a.url == url).cloned())
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.with(|s| s.logs.iter().map(|l| l.message.clone()).collect())
    }

    /// Insert a run directly, bypassing the engine
    pub fn insert_run(&self, status: RunStatus, age: Duration) -> RunId {
        let run = SyncRun {
            id: Uuid::new_v4(),
            started_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
            finished_at: None,
            status,
            is_manual: false,
            stop_requested: false,
            files_processed: 0,
            records_loaded: 0,
            error_message: None,
        };
        let id = run.id;
        self.with(|s| s.runs.push(run));
        id
    }
}

fn latest<'a>(runs: impl Iterator<Item = &'a SyncRun>) -> Option<SyncRun> {
    runs.max_by_key(|r| r.started_at).cloned()
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn create_run(&self, manual: bool) -> DbResult<SyncRun> {
        let run = SyncRun {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            is_manual: manual,
            stop_requested: false,
            files_processed: 0,
            records_loaded: 0,
            error_message: None,
        };
        self.with(|s| s.runs.push(run.clone()));
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> DbResult<Option<SyncRun>> {
        Ok(self.with(|s| s.runs.iter().find(|r| r.id == id).cloned()))
    }

    async fn active_run(&self) -> DbResult<Option<SyncRun>> {
        Ok(self.with(|s| latest(s.runs.iter().filter(|r| r.status.is_active()))))
    }

    async fn latest_paused_run(&self) -> DbResult<Option<SyncRun>> {
        Ok(self.with(|s| latest(s.runs.iter().filter(|r| r.status == RunStatus::Paused))))
    }

    async fn is_stop_requested(&self, id: RunId) -> DbResult<bool> {
        Ok(self.with(|s| s.runs.iter().any(|r| r.id == id && r.stop_requested)))
    }

    async fn request_stop(&self, id: RunId) -> DbResult<bool> {
        Ok(self.with(|s| match s.runs.iter_mut().find(|r| r.id == id) {
            Some(run) => {
                if run.status.is_active() {
                    run.stop_requested = true;
                    run.status = RunStatus::Stopping;
                }
                true
            },
            None => false,
        }))
    }

    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        message: Option<&str>,
        counters: RunCounters,
    ) -> DbResult<RunStatus> {
        self.with(|s| {
            let run = s
                .runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| DbError::not_found("Run", id))?;
            if run.status.is_terminal() {
                return Ok(run.status);
            }
            if run.status == RunStatus::Stopping || run.stop_requested {
                run.status = RunStatus::Stopped;
                run.error_message =
                    Some(message.unwrap_or(STOPPED_BY_OPERATOR).to_string());
            } else {
                run.status = status;
                run.error_message = message.map(str::to_string);
            }
            run.finished_at = Some(Utc::now());
            run.files_processed = counters.files_processed as i64;
            run.records_loaded = counters.records_loaded as i64;
            run.stop_requested = false;
            Ok(run.status)
        })
    }

    async fn force_finish(&self, id: RunId, message: &str) -> DbResult<bool> {
        Ok(self.with(|s| match s.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if !run.status.is_terminal() => {
                run.status = RunStatus::Stopped;
                run.finished_at = Some(Utc::now());
                run.error_message = Some(message.to_string());
                run.stop_requested = true;
                true
            },
            _ => false,
        }))
    }

    async fn reconcile_stale_runs(&self, threshold: Duration) -> DbResult<Vec<ReconciledRun>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap();
        Ok(self.with(|s| {
            let mut out = Vec::new();
            for run in s.runs.iter_mut() {
                if run.status.is_active() && run.finished_at.is_none() && run.started_at < cutoff {
                    run.status = if run.status == RunStatus::Stopping {
                        RunStatus::Stopped
                    } else {
                        RunStatus::Aborted
                    };
                    run.finished_at = Some(Utc::now());
                    run.stop_requested = false;
                    run.error_message = Some("reconciled".to_string());
                    out.push(ReconciledRun {
                        id: run.id,
                        status: run.status,
                    });
                }
            }
            out
        }))
    }

    async fn run_stats(&self, id: RunId) -> DbResult<RunStats> {
        Ok(self.with(|s| {
            let archive_ids: HashSet<ArchiveId> = s
                .archives
                .iter()
                .filter(|a| a.sync_run_id == Some(id))
                .map(|a| a.id)
                .collect();
            RunStats {
                archives: archive_ids.len() as i64,
                fragments: s
                    .fragments
                    .iter()
                    .filter(|f| archive_ids.contains(&f.zip_archive_id))
                    .count() as i64,
                records: s
                    .records
                    .iter()
                    .filter(|r| archive_ids.contains(&r.archive_id))
                    .count() as i64,
                log_entries: s.logs.iter().filter(|l| l.run_id == Some(id)).count() as i64,
            }
        }))
    }

    async fn delete_run(&self, id: RunId) -> DbResult<DeletedRun> {
        self.with(|s| {
            let before = s.runs.len();
            s.runs.retain(|r| r.id != id);
            if s.runs.len() == before {
                return Err(DbError::not_found("Run", id));
            }
            let mut deleted = DeletedRun::default();
            for archive in s.archives.iter_mut().filter(|a| a.sync_run_id == Some(id)) {
                archive.sync_run_id = None;
                deleted.archives_detached += 1;
            }
            let logs = s.logs.len();
            s.logs.retain(|l| l.run_id != Some(id));
            deleted.logs_deleted = (logs - s.logs.len()) as u64;
            Ok(deleted)
        })
    }

    async fn upsert_dataset(&self, dataset: &NewDataset) -> DbResult<Dataset> {
        Ok(self.with(|s| {
            if let Some(existing) = s
                .datasets
                .iter_mut()
                .find(|d| d.identifier == dataset.identifier)
            {
                existing.title = dataset.title.clone();
                existing.link = dataset.link.clone();
                if let Some(kind) = dataset.kind {
                    existing.data_type = Some(kind.to_string());
                }
                return existing.clone();
            }
            let row = Dataset {
                id: Uuid::new_v4(),
                identifier: dataset.identifier.clone(),
                title: dataset.title.clone(),
                link: dataset.link.clone(),
                data_type: dataset.kind.map(|k| k.to_string()),
            };
            s.datasets.push(row.clone());
            row
        }))
    }

    async fn get_dataset(&self, id: DatasetId) -> DbResult<Option<Dataset>> {
        Ok(self.with(|s| s.datasets.iter().find(|d| d.id == id).cloned()))
    }

    async fn set_dataset_kind(&self, id: DatasetId, kind: RecordKind) -> DbResult<()> {
        self.with(|s| match s.datasets.iter_mut().find(|d| d.id == id) {
            Some(dataset) => {
                dataset.data_type = Some(kind.to_string());
                Ok(())
            },
            None => Err(DbError::not_found("Dataset", id)),
        })
    }

    async fn insert_version(&self, version: &NewDatasetVersion) -> DbResult<bool> {
        Ok(self.with(|s| {
            let exists = s.versions.iter().any(|v| {
                v.dataset_id == version.dataset_id && v.source_url == version.source_url
            });
            if !exists {
                s.versions.push(version.clone());
            }
            !exists
        }))
    }

    async fn find_archive_by_url(&self, url: &str) -> DbResult<Option<Archive>> {
        Ok(self.archive(url))
    }

    async fn get_archive(&self, id: ArchiveId) -> DbResult<Option<Archive>> {
        Ok(self.with(|s| s.archives.iter().find(|a| a.id == id).cloned()))
    }

    async fn processed_hash_exists(
        &self,
        hash: &str,
        except: Option<ArchiveId>,
    ) -> DbResult<bool> {
        Ok(self.with(|s| {
            s.archives.iter().any(|a| {
                a.sha256_hash.as_deref() == Some(hash)
                    && a.status == ArchiveStatus::Processed
                    && Some(a.id) != except
            })
        }))
    }

    async fn register_archive(&self, url: &str, run_id: Option<RunId>) -> DbResult<Archive> {
        Ok(self.with(|s| {
            if let Some(existing) = s.archives.iter().find(|a| a.url == url) {
                return existing.clone();
            }
            let archive = Archive {
                id: Uuid::new_v4(),
                url: url.to_string(),
                file_path: None,
                file_size: None,
                sha256_hash: None,
                status: ArchiveStatus::Pending,
                error_message: None,
                sync_run_id: run_id,
                created_at: Utc::now(),
                downloaded_at: None,
                processed_at: None,
            };
            s.archives.push(archive.clone());
            archive
        }))
    }

    async fn mark_archive_downloaded(
        &self,
        id: ArchiveId,
        file_path: &str,
        file_size: u64,
        hash: &str,
    ) -> DbResult<()> {
        self.with(|s| {
            if let Some(a) = s
                .archives
                .iter_mut()
                .find(|a| a.id == id && a.status != ArchiveStatus::Processed)
            {
                a.status = ArchiveStatus::Downloaded;
                a.file_path = Some(file_path.to_string());
                a.file_size = Some(file_size as i64);
                a.sha256_hash = Some(hash.to_string());
                a.error_message = None;
                a.downloaded_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn mark_archive_processed(&self, id: ArchiveId) -> DbResult<()> {
        self.with(|s| {
            if let Some(a) = s.archives.iter_mut().find(|a| a.id == id) {
                a.status = ArchiveStatus::Processed;
                a.error_message = None;
                a.processed_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn mark_archive_error(&self, id: ArchiveId, message: &str) -> DbResult<()> {
        self.with(|s| {
            if let Some(a) = s
                .archives
                .iter_mut()
                .find(|a| a.id == id && a.status != ArchiveStatus::Processed)
            {
                a.status = ArchiveStatus::Error;
                a.error_message = Some(message.to_string());
            }
        });
        Ok(())
    }

    async fn create_fragment(
        &self,
        archive_id: ArchiveId,
        file_name: &str,
    ) -> DbResult<Fragment> {
        let fragment = Fragment {
            id: Uuid::new_v4(),
            zip_archive_id: archive_id,
            file_name: file_name.to_string(),
            data_type: None,
            status: FragmentStatus::Parsing,
            records_count: 0,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.with(|s| s.fragments.push(fragment.clone()));
        Ok(fragment)
    }

    async fn get_fragment(&self, id: FragmentId) -> DbResult<Option<Fragment>> {
        Ok(self.with(|s| s.fragments.iter().find(|f| f.id == id).cloned()))
    }

    async fn set_fragment_kind(&self, id: FragmentId, kind: FragmentKind) -> DbResult<()> {
        self.with(|s| {
            if let Some(f) = s.fragments.iter_mut().find(|f| f.id == id) {
                f.data_type = Some(kind.to_string());
            }
        });
        Ok(())
    }

    async fn finish_fragment(&self, id: FragmentId, outcome: &FragmentOutcome) -> DbResult<()> {
        self.with(|s| {
            let Some(f) = s.fragments.iter_mut().find(|f| f.id == id) else {
                return;
            };
            let (status, kind, records, message) = match outcome {
                FragmentOutcome::Loaded { kind, records } => (
                    FragmentStatus::Loaded,
                    Some(FragmentKind::from(*kind)),
                    *records,
                    None,
                ),
                FragmentOutcome::Unclassified => (
                    FragmentStatus::Error,
                    Some(FragmentKind::Unknown),
                    0,
                    Some(UNCLASSIFIED_DOCUMENT.to_string()),
                ),
                FragmentOutcome::Failed { message } => {
                    (FragmentStatus::Error, None, 0, Some(message.clone()))
                },
                FragmentOutcome::Cancelled { records } => (
                    FragmentStatus::Error,
                    None,
                    *records,
                    Some(CANCELLED_BY_STOP.to_string()),
                ),
            };
            f.status = status;
            if let Some(kind) = kind {
                f.data_type = Some(kind.to_string());
            }
            f.records_count = records as i64;
            f.error_message = message;
            f.processed_at = Some(Utc::now());
        });
        Ok(())
    }

    async fn fragments_for_reclassification(
        &self,
        dataset_id: DatasetId,
        kind: RecordKind,
    ) -> DbResult<Vec<Fragment>> {
        Ok(self.with(|s| {
            let urls: HashSet<&str> = s
                .versions
                .iter()
                .filter(|v| v.dataset_id == dataset_id)
                .map(|v| v.source_url.as_str())
                .collect();
            let archive_ids: HashSet<ArchiveId> = s
                .archives
                .iter()
                .filter(|a| urls.contains(a.url.as_str()))
                .map(|a| a.id)
                .collect();
            s.fragments
                .iter()
                .filter(|f| archive_ids.contains(&f.zip_archive_id))
                .filter(|f| {
                    f.status == FragmentStatus::Error
                        || f.data_type.as_deref() != Some(kind.as_str())
                })
                .cloned()
                .collect()
        }))
    }

    async fn reset_fragment(&self, id: FragmentId) -> DbResult<u64> {
        self.with(|s| {
            let Some(f) = s.fragments.iter_mut().find(|f| f.id == id) else {
                return Err(DbError::not_found("Fragment", id));
            };
            f.status = FragmentStatus::Pending;
            f.records_count = 0;
            f.error_message = None;
            f.processed_at = None;
            let before = s.records.len();
            s.records.retain(|r| r.fragment_id != id);
            Ok((before - s.records.len()) as u64)
        })
    }

    async fn insert_records(&self, records: &[NewRecord]) -> DbResult<BatchOutcome> {
        Ok(self.with(|s| {
            let mut outcome = BatchOutcome::default();
            for record in records {
                let fails = record
                    .key
                    .as_ref()
                    .is_some_and(|k| s.failing_keys.contains(k));
                if fails {
                    outcome.skipped += 1;
                } else {
                    if !s.discard_records {
                        s.records.push(record.clone());
                    }
                    outcome.inserted += 1;
                }
            }
            s.insert_calls += 1;
            s.max_batch = s.max_batch.max(records.len());
            if s.stop_after_batches == Some(s.insert_calls) {
                for run in s.runs.iter_mut().filter(|r| r.status.is_active()) {
                    run.stop_requested = true;
                    run.status = RunStatus::Stopping;
                }
            }
            outcome
        }))
    }

    async fn append_log(&self, entry: &NewLogEntry) -> DbResult<()> {
        self.with(|s| {
            if s.fail_logs {
                return Err(DbError::Config("operation_log unavailable".to_string()));
            }
            s.logs.push(entry.clone());
            Ok(())
        })
    }

    async fn load_settings(&self) -> DbResult<HashMap<String, String>> {
        Ok(self.with(|s| s.settings.clone()))
    }
}

// ============================================================================
// Documents and archives
// ============================================================================

/// `<{root}>` holding `count` `<{marker}>` elements keyed `{prefix}-{n}`
fn write_records<W: Write>(
    out: &mut W,
    root: &str,
    marker: &str,
    prefix: &str,
    count: usize,
) -> std::io::Result<()> {
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(out, "<{}>", root)?;
    for n in 0..count {
        writeln!(
            out,
            "  <{m}><GUID>{p}-{n}</GUID><Date>2024-03-{d:02}</Date><INN>77{n:08}</INN></{m}>",
            m = marker,
            p = prefix,
            n = n,
            d = n % 28 + 1,
        )?;
    }
    writeln!(out, "</{}>", root)
}

pub fn records_xml(root: &str, marker: &str, prefix: &str, count: usize) -> String {
    let mut xml = Vec::new();
    write_records(&mut xml, root, marker, prefix, count).unwrap();
    String::from_utf8(xml).unwrap()
}

/// Same document as [`records_xml`], written straight to disk
pub fn write_records_file(path: &Path, root: &str, marker: &str, prefix: &str, count: usize) {
    let file = std::fs::File::create(path).unwrap();
    let mut out = std::io::BufWriter::new(file);
    write_records(&mut out, root, marker, prefix, count).unwrap();
    out.flush().unwrap();
}

pub fn inspections_xml(prefix: &str, count: usize) -> String {
    records_xml("Inspections", "inspection", prefix, count)
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn inspections_zip(prefix: &str, count: usize) -> Vec<u8> {
    let xml = inspections_xml(prefix, count);
    zip_bytes(&[("data.xml", xml.as_bytes())])
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

pub fn manifest_xml(identifier: &str, sources: &[String]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<meta>\n  <identifier>{}</identifier>\n  <title>{}</title>\n  <data>\n",
        identifier, identifier
    );
    for (n, source) in sources.iter().enumerate() {
        xml.push_str(&format!(
            "    <dataversion><source>{}</source><created>2024010{}</created><provenance>p</provenance><structure>20230101</structure></dataversion>\n",
            source,
            n % 9 + 1
        ));
    }
    xml.push_str("  </data>\n</meta>\n");
    xml
}

// ============================================================================
// Feed collaborators
// ============================================================================

pub struct StaticFeed {
    pub entries: Result<Vec<FeedEntry>, String>,
}

#[async_trait]
impl FeedLister for StaticFeed {
    async fn list(&self) -> anyhow::Result<Vec<FeedEntry>> {
        self.entries.clone().map_err(|e| anyhow::anyhow!(e))
    }
}

/// Manifests by URL; unknown URLs fail
#[derive(Default)]
pub struct StaticManifests {
    pub by_url: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl MetadataFetcher for StaticManifests {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.by_url
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no manifest at {}", url))
    }
}

/// One dataset of a synthetic feed: identifier plus its archive URLs
pub struct FeedDataset {
    pub identifier: String,
    pub archives: Vec<String>,
}

impl FeedDataset {
    pub fn new(identifier: &str, archives: Vec<String>) -> Self {
        Self {
            identifier: identifier.to_string(),
            archives,
        }
    }
}

pub fn test_config(dir: &Path) -> SyncConfig {
    SyncConfig {
        download_dir: dir.to_path_buf(),
        batch_size: 3,
        batch_pause_min_secs: 0,
        batch_pause_max_secs: 0,
        politeness: PolitenessConfig::none(),
        commit_batch_size: 100,
        ..SyncConfig::default()
    }
}

pub fn test_pipeline(store: Arc<MemoryStore>, dir: &Path, commit_batch_size: usize) -> ArchivePipeline {
    let store: Arc<dyn SyncStore> = store;
    let fetcher = ArchiveFetcher::with_client(
        reqwest::Client::new(),
        BackoffPolicy::immediate(3),
        PolitenessConfig::none(),
    );
    ArchivePipeline::new(
        store.clone(),
        fetcher,
        Extractor::new(store.clone(), commit_batch_size),
        Arc::new(StoreLogSink::new(store)),
        dir.join("zips"),
    )
}

/// Orchestrator over a synthetic feed whose manifests are served from memory
pub fn test_orchestrator(
    store: Arc<MemoryStore>,
    config: SyncConfig,
    datasets: &[FeedDataset],
) -> Orchestrator {
    let mut manifests = StaticManifests::default();
    let mut entries = Vec::new();
    for dataset in datasets {
        let link = format!("https://feed.test/{}/meta.xml", dataset.identifier);
        manifests.by_url.insert(
            link.clone(),
            manifest_xml(&dataset.identifier, &dataset.archives).into_bytes(),
        );
        entries.push(FeedEntry {
            identifier: dataset.identifier.clone(),
            title: dataset.identifier.clone(),
            link,
            format: "xml".to_string(),
        });
    }
    orchestrator_with_feed(store, config, Ok(entries), manifests)
}

pub fn orchestrator_with_feed(
    store: Arc<MemoryStore>,
    config: SyncConfig,
    entries: Result<Vec<FeedEntry>, String>,
    manifests: StaticManifests,
) -> Orchestrator {
    let pipeline = test_pipeline(store.clone(), &config.download_dir, config.commit_batch_size);
    let store: Arc<dyn SyncStore> = store;
    let cache = ManifestCache::new(config.meta_dir(), Arc::new(manifests));
    Orchestrator::new(
        config,
        store.clone(),
        Arc::new(StaticFeed { entries }),
        cache,
        pipeline,
        Arc::new(StoreLogSink::new(store)),
    )
}

