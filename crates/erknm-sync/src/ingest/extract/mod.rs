//! Streaming extraction of records from one document
//!
//! Parsing is blocking work and runs on the blocking pool. It hands record
//! batches to the async side over a bounded channel, so memory stays flat
//! regardless of document size. Each batch is committed before the stop
//! flag is checked; a stop keeps every committed batch.

pub mod fields;
pub mod selection;
pub mod stream;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::fields::extract_fields;
use self::stream::{scan_document, ParsedElement, ScanEvent, ScanSummary};
use super::cancel::StopSignal;
use crate::db::DbError;
use crate::store::{
    ArchiveId, Fragment, FragmentOutcome, NewRecord, RecordKind, SyncStore,
};

pub use selection::{select_document, SelectedDocument};

/// Batches in flight between the parser and the writer
const CHANNEL_DEPTH: usize = 4;
const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Failed to read archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("XML error at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Extraction worker failed: {0}")]
    Worker(String),
}

impl ExtractError {
    pub(crate) fn zip(path: &Path, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn xml<P: TryInto<u64>>(position: P, source: quick_xml::Error) -> Self {
        Self::Xml {
            position: position.try_into().unwrap_or(u64::MAX),
            source,
        }
    }
}

/// Where the document bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    /// An entry inside a zip archive, read without unpacking to disk
    ZipEntry { archive: PathBuf, entry: String },
    /// A bare XML file
    File(PathBuf),
}

impl DocumentSource {
    /// Name recorded on the fragment
    pub fn file_name(&self) -> String {
        match self {
            DocumentSource::ZipEntry { entry, .. } => entry.clone(),
            DocumentSource::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// How an extraction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Loaded { kind: RecordKind, records: u64 },
    /// No type marker matched, or nothing could be stored
    Unclassified,
    /// Stop requested; `records` were committed before it was seen
    Cancelled { records: u64 },
}

impl ExtractOutcome {
    pub fn records(&self) -> u64 {
        match self {
            ExtractOutcome::Loaded { records, .. } | ExtractOutcome::Cancelled { records } => {
                *records
            },
            ExtractOutcome::Unclassified => 0,
        }
    }
}

enum Message {
    Kind(RecordKind),
    Batch(Vec<ParsedElement>),
}

/// Parser side: runs on the blocking pool
fn produce(
    source: &DocumentSource,
    forced: Option<RecordKind>,
    batch_size: usize,
    tx: mpsc::Sender<Message>,
) -> Result<ScanSummary, ExtractError> {
    let mut batch = Vec::with_capacity(batch_size);
    let mut open = true;

    let mut emit = |event: ScanEvent| -> bool {
        match event {
            ScanEvent::Kind(kind) => open = tx.blocking_send(Message::Kind(kind)).is_ok(),
            ScanEvent::Element(element) => {
                batch.push(element);
                if batch.len() >= batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    open = tx.blocking_send(Message::Batch(full)).is_ok();
                }
            },
        }
        open
    };

    let summary = match source {
        DocumentSource::ZipEntry { archive, entry } => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file).map_err(|e| ExtractError::zip(archive, e))?;
            let reader = zip.by_name(entry).map_err(|e| ExtractError::zip(archive, e))?;
            scan_document(
                BufReader::with_capacity(READ_BUFFER_BYTES, reader),
                forced,
                &mut emit,
            )?
        },
        DocumentSource::File(path) => {
            let file = File::open(path)?;
            scan_document(
                BufReader::with_capacity(READ_BUFFER_BYTES, file),
                forced,
                &mut emit,
            )?
        },
    };
    drop(emit);

    if open && !batch.is_empty() {
        // Receiver gone means the writer stopped; the tail is dropped on purpose
        let _ = tx.blocking_send(Message::Batch(batch));
    }
    Ok(summary)
}

fn to_record(fragment: &Fragment, kind: RecordKind, element: ParsedElement) -> NewRecord {
    let fields = extract_fields(&element.fields);
    NewRecord {
        archive_id: fragment.zip_archive_id,
        fragment_id: fragment.id,
        kind,
        key: fields.key,
        date: fields.date,
        payload: fields.payload,
        raw_xml: element.raw_xml,
    }
}

/// Streams records from documents into the store
#[derive(Clone)]
pub struct Extractor {
    store: Arc<dyn SyncStore>,
    commit_batch_size: usize,
}

struct Consumed {
    kind: Option<RecordKind>,
    committed: u64,
    skipped: u64,
    cancelled: bool,
}

impl Extractor {
    pub fn new(store: Arc<dyn SyncStore>, commit_batch_size: usize) -> Self {
        Self {
            store,
            commit_batch_size: commit_batch_size.max(1),
        }
    }

    /// Create a fragment for `source` under `archive_id` and fill it.
    pub async fn extract(
        &self,
        archive_id: ArchiveId,
        source: DocumentSource,
        forced: Option<RecordKind>,
        stop: &StopSignal,
    ) -> Result<ExtractOutcome, ExtractError> {
        let fragment = self
            .store
            .create_fragment(archive_id, &source.file_name())
            .await?;
        self.extract_into(&fragment, source, forced, stop).await
    }

    /// Fill an existing fragment. The fragment is always left in a final
    /// state, including when this returns an error.
    pub async fn extract_into(
        &self,
        fragment: &Fragment,
        source: DocumentSource,
        forced: Option<RecordKind>,
        stop: &StopSignal,
    ) -> Result<ExtractOutcome, ExtractError> {
        info!(fragment_id = %fragment.id, document = %source.file_name(), "Extracting records");

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let batch_size = self.commit_batch_size;
        let worker =
            tokio::task::spawn_blocking(move || produce(&source, forced, batch_size, tx));

        let consumed = self.consume(fragment, rx, stop).await;
        let scanned = worker
            .await
            .map_err(|e| ExtractError::Worker(e.to_string()));

        let result = match (consumed, scanned) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(consumed), Ok(scan)) => {
                if consumed.cancelled {
                    Ok((consumed, None))
                } else {
                    scan.map(|summary| (consumed, Some(summary)))
                }
            },
        };

        let (outcome, fragment_outcome) = match result {
            Err(e) => {
                warn!(fragment_id = %fragment.id, error = %e, "Extraction failed");
                let failed = FragmentOutcome::Failed {
                    message: e.to_string(),
                };
                if let Err(db) = self.store.finish_fragment(fragment.id, &failed).await {
                    warn!(fragment_id = %fragment.id, error = %db, "Could not record fragment failure");
                }
                return Err(e);
            },
            Ok((consumed, _)) if consumed.cancelled => (
                ExtractOutcome::Cancelled {
                    records: consumed.committed,
                },
                FragmentOutcome::Cancelled {
                    records: consumed.committed,
                },
            ),
            Ok((consumed, summary)) => {
                if consumed.skipped > 0 {
                    warn!(fragment_id = %fragment.id, skipped = consumed.skipped, "Some records could not be stored");
                }
                debug!(fragment_id = %fragment.id, elements = summary.map(|s| s.elements).unwrap_or_default(), "Document scanned");
                match consumed.kind {
                    Some(kind) if consumed.committed > 0 => (
                        ExtractOutcome::Loaded {
                            kind,
                            records: consumed.committed,
                        },
                        FragmentOutcome::Loaded {
                            kind,
                            records: consumed.committed,
                        },
                    ),
                    _ => (ExtractOutcome::Unclassified, FragmentOutcome::Unclassified),
                }
            },
        };

        self.store
            .finish_fragment(fragment.id, &fragment_outcome)
            .await?;
        info!(fragment_id = %fragment.id, outcome = ?outcome, "Extraction finished");
        Ok(outcome)
    }

    /// Writer side: commit each batch, then look at the stop flag.
    async fn consume(
        &self,
        fragment: &Fragment,
        mut rx: mpsc::Receiver<Message>,
        stop: &StopSignal,
    ) -> Result<Consumed, ExtractError> {
        let mut consumed = Consumed {
            kind: None,
            committed: 0,
            skipped: 0,
            cancelled: false,
        };

        while let Some(message) = rx.recv().await {
            match message {
                Message::Kind(kind) => {
                    consumed.kind = Some(kind);
                    self.store.set_fragment_kind(fragment.id, kind.into()).await?;
                },
                Message::Batch(elements) => {
                    let Some(kind) = consumed.kind else {
                        continue;
                    };
                    let records: Vec<NewRecord> = elements
                        .into_iter()
                        .map(|element| to_record(fragment, kind, element))
                        .collect();
                    let outcome = self.store.insert_records(&records).await?;
                    consumed.committed += outcome.inserted;
                    consumed.skipped += outcome.skipped;

                    if stop.should_stop().await {
                        info!(fragment_id = %fragment.id, committed = consumed.committed, "Stop requested during extraction");
                        consumed.cancelled = true;
                        break;
                    }
                },
            }
        }

        // Dropping the receiver makes the parser's next send fail and return
        drop(rx);
        Ok(consumed)
    }
}
