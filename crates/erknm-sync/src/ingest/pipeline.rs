//! Idempotent fetch-and-extract for one archive URL

use erknm_common::checksum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::cancel::StopSignal;
use super::extract::{select_document, DocumentSource, ExtractOutcome, Extractor};
use super::fetch::{check_archive, not_zip_diagnostic, ArchiveFetcher, FetchError, NOT_ZIP_MARKER};
use crate::error::{SyncError, SyncResult};
use crate::log_sink::LogSink;
use crate::store::{
    Archive, ArchiveStatus, LogStage, RecordKind, RunId, SyncStore, CANCELLED_BY_STOP,
};

/// Archive error recorded when no XML entry exists
pub const NO_DOCUMENT: &str = "no matching inner document";

const LOG_CATEGORY: &str = "archive";

/// Why an archive produced no work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// URL already processed
    AlreadyProcessed,
    /// URL or local file previously failed the container check
    NotAnArchive,
    /// Byte-identical content was already processed under another URL
    DuplicateContent,
    /// The archive has no XML entry
    NoDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Extraction ran; `records` may be zero for unclassified documents
    Processed { records: u64 },
    Skipped(SkipReason),
    /// Stop requested; `records` were committed before it was seen
    Cancelled { records: u64 },
}

impl ArchiveOutcome {
    pub fn records(&self) -> u64 {
        match self {
            ArchiveOutcome::Processed { records } | ArchiveOutcome::Cancelled { records } => {
                *records
            },
            ArchiveOutcome::Skipped(_) => 0,
        }
    }
}

/// Local file name for an archive URL: the last path segment, or the URL's
/// SHA-256 when the URL has no usable segment.
pub fn archive_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    // Drop scheme and authority so a bare host never reads as a file name
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or_default(),
        None => without_query,
    };
    let segment = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();

    let usable = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('\\');

    if usable {
        segment.to_string()
    } else {
        let digest = checksum::sha256_reader(&mut url.as_bytes())
            .unwrap_or_else(|_| url.len().to_string());
        format!("{}.zip", digest)
    }
}

async fn hash_file(path: &Path) -> SyncResult<(String, u64)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<(String, u64)> {
        let size = std::fs::metadata(&path)?.len();
        let hash = checksum::sha256_file(&path).map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok((hash, size))
    })
    .await
    .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?
    .map_err(SyncError::from)
}

pub struct ArchivePipeline {
    store: Arc<dyn SyncStore>,
    fetcher: ArchiveFetcher,
    extractor: Extractor,
    log: Arc<dyn LogSink>,
    zips_dir: PathBuf,
}

impl ArchivePipeline {
    pub fn new(
        store: Arc<dyn SyncStore>,
        fetcher: ArchiveFetcher,
        extractor: Extractor,
        log: Arc<dyn LogSink>,
        zips_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            log,
            zips_dir: zips_dir.into(),
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn archive_path(&self, url: &str) -> PathBuf {
        self.zips_dir.join(archive_file_name(url))
    }

    /// Make sure the archive at `url` has been processed exactly once.
    pub async fn ensure_processed(
        &self,
        url: &str,
        run_id: Option<RunId>,
        stop: &StopSignal,
    ) -> SyncResult<ArchiveOutcome> {
        if let Some(existing) = self.store.find_archive_by_url(url).await? {
            if existing.status == ArchiveStatus::Processed {
                debug!(url, "Archive already processed");
                return Ok(ArchiveOutcome::Skipped(SkipReason::AlreadyProcessed));
            }
            if existing.status == ArchiveStatus::Error
                && existing
                    .error_message
                    .as_deref()
                    .is_some_and(|m| m.contains(NOT_ZIP_MARKER))
            {
                debug!(url, "Archive previously failed the container check");
                return Ok(ArchiveOutcome::Skipped(SkipReason::NotAnArchive));
            }
        }

        let dest = self.archive_path(url);
        if tokio::fs::try_exists(&dest).await? {
            let (hash, _) = hash_file(&dest).await?;
            if self.store.processed_hash_exists(&hash, None).await? {
                info!(url, hash = %hash, "Local copy matches an already processed archive");
                return Ok(ArchiveOutcome::Skipped(SkipReason::DuplicateContent));
            }
        }

        let archive = self.store.register_archive(url, run_id).await?;

        if tokio::fs::try_exists(&dest).await? {
            let check_path = dest.clone();
            let verdict = tokio::task::spawn_blocking(move || check_archive(&check_path))
                .await
                .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))??;
            if let Err(bad) = verdict {
                let diagnostic = not_zip_diagnostic(url, "local file", &bad);
                self.store.mark_archive_error(archive.id, &diagnostic).await?;
                self.log
                    .error(run_id, LOG_CATEGORY, &diagnostic, LogStage::Data)
                    .await;
                return Ok(ArchiveOutcome::Skipped(SkipReason::NotAnArchive));
            }
        } else {
            if stop.should_stop().await {
                return Ok(ArchiveOutcome::Cancelled { records: 0 });
            }
            self.log
                .info(run_id, LOG_CATEGORY, &format!("Downloading {}", url), LogStage::Data)
                .await;

            match self.fetcher.download(url, &dest, stop).await {
                Ok(size) => debug!(url, size, "Download complete"),
                Err(FetchError::Cancelled { .. }) => {
                    return Ok(ArchiveOutcome::Cancelled { records: 0 });
                },
                Err(FetchError::NotAnArchive { diagnostic, .. }) => {
                    self.store.mark_archive_error(archive.id, &diagnostic).await?;
                    self.log
                        .error(run_id, LOG_CATEGORY, &diagnostic, LogStage::Data)
                        .await;
                    return Ok(ArchiveOutcome::Skipped(SkipReason::NotAnArchive));
                },
                Err(e) => {
                    self.store.mark_archive_error(archive.id, &e.to_string()).await?;
                    return Err(e.into());
                },
            }
        }

        self.process_local(&archive, &dest, run_id, stop).await
    }

    /// Hash, dedup and extract an archive whose bytes are at `path`.
    pub async fn process_local(
        &self,
        archive: &Archive,
        path: &Path,
        run_id: Option<RunId>,
        stop: &StopSignal,
    ) -> SyncResult<ArchiveOutcome> {
        let (hash, size) = hash_file(path).await?;
        self.store
            .mark_archive_downloaded(archive.id, &path.to_string_lossy(), size, &hash)
            .await?;

        if self.store.processed_hash_exists(&hash, Some(archive.id)).await? {
            self.store.mark_archive_processed(archive.id).await?;
            self.log
                .info(
                    run_id,
                    LOG_CATEGORY,
                    &format!("{} duplicates already processed content ({})", archive.url, hash),
                    LogStage::Data,
                )
                .await;
            return Ok(ArchiveOutcome::Skipped(SkipReason::DuplicateContent));
        }

        // Another worker may have finished this archive meanwhile
        if let Some(current) = self.store.get_archive(archive.id).await? {
            if current.status == ArchiveStatus::Processed {
                return Ok(ArchiveOutcome::Skipped(SkipReason::AlreadyProcessed));
            }
        }

        if stop.should_stop().await {
            return Ok(ArchiveOutcome::Cancelled { records: 0 });
        }

        let zip_path = path.to_path_buf();
        let selected = tokio::task::spawn_blocking(move || select_document(&zip_path))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;
        let selected = match selected {
            Ok(selected) => selected,
            Err(e) => {
                self.store.mark_archive_error(archive.id, &e.to_string()).await?;
                return Err(e.into());
            },
        };

        let Some(document) = selected else {
            self.store.mark_archive_error(archive.id, NO_DOCUMENT).await?;
            self.log
                .warning(
                    run_id,
                    LOG_CATEGORY,
                    &format!("{}: {}", archive.url, NO_DOCUMENT),
                    LogStage::Data,
                )
                .await;
            return Ok(ArchiveOutcome::Skipped(SkipReason::NoDocument));
        };

        self.log
            .info(
                run_id,
                LOG_CATEGORY,
                &format!(
                    "Selected {} ({} bytes, {} XML entries)",
                    document.name, document.size, document.candidates
                ),
                LogStage::Data,
            )
            .await;

        let source = DocumentSource::ZipEntry {
            archive: path.to_path_buf(),
            entry: document.name,
        };
        self.extract_and_finish(archive, source, None, run_id, stop)
            .await
    }

    /// Bare XML documents skip container checks and document selection.
    pub async fn process_document(
        &self,
        archive: &Archive,
        path: &Path,
        run_id: Option<RunId>,
        stop: &StopSignal,
    ) -> SyncResult<ArchiveOutcome> {
        let (hash, size) = hash_file(path).await?;
        self.store
            .mark_archive_downloaded(archive.id, &path.to_string_lossy(), size, &hash)
            .await?;
        if self.store.processed_hash_exists(&hash, Some(archive.id)).await? {
            self.store.mark_archive_processed(archive.id).await?;
            return Ok(ArchiveOutcome::Skipped(SkipReason::DuplicateContent));
        }

        let source = DocumentSource::File(path.to_path_buf());
        self.extract_and_finish(archive, source, None, run_id, stop)
            .await
    }

    async fn extract_and_finish(
        &self,
        archive: &Archive,
        source: DocumentSource,
        forced: Option<RecordKind>,
        run_id: Option<RunId>,
        stop: &StopSignal,
    ) -> SyncResult<ArchiveOutcome> {
        match self.extractor.extract(archive.id, source, forced, stop).await {
            Ok(ExtractOutcome::Loaded { kind, records }) => {
                self.store.mark_archive_processed(archive.id).await?;
                self.log
                    .info(
                        run_id,
                        LOG_CATEGORY,
                        &format!("{}: loaded {} {} records", archive.url, records, kind),
                        LogStage::Data,
                    )
                    .await;
                Ok(ArchiveOutcome::Processed { records })
            },
            Ok(ExtractOutcome::Unclassified) => {
                self.store.mark_archive_processed(archive.id).await?;
                self.log
                    .warning(
                        run_id,
                        LOG_CATEGORY,
                        &format!("{}: document type not recognised, no records", archive.url),
                        LogStage::Data,
                    )
                    .await;
                Ok(ArchiveOutcome::Processed { records: 0 })
            },
            Ok(ExtractOutcome::Cancelled { records }) => {
                self.store
                    .mark_archive_error(archive.id, CANCELLED_BY_STOP)
                    .await?;
                Ok(ArchiveOutcome::Cancelled { records })
            },
            Err(e) => {
                self.store.mark_archive_error(archive.id, &e.to_string()).await?;
                Err(e.into())
            },
        }
    }
}
