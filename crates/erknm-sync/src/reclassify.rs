//! Re-extraction under an operator-chosen record kind
//!
//! Useful when a document's markers were misread or a dataset was filed
//! under the wrong kind. The fragment's records are deleted and the same
//! inner document is scanned again with the kind forced, so only elements
//! carrying that kind's marker become records.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::ingest::{DocumentSource, ExtractOutcome, Extractor, StopSignal};
use crate::store::{
    ArchiveStatus, DatasetId, Fragment, FragmentId, RecordKind, SyncStore,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclassifySummary {
    pub fragments: usize,
    pub records: u64,
    /// Fragments that could not be re-extracted, with the reason
    pub failed: Vec<(FragmentId, String)>,
}

pub struct Reclassifier {
    store: Arc<dyn SyncStore>,
    extractor: Extractor,
}

impl Reclassifier {
    pub fn new(store: Arc<dyn SyncStore>, extractor: Extractor) -> Self {
        Self { store, extractor }
    }

    /// Delete a fragment's records and extract its document again as `kind`.
    pub async fn reclassify_fragment(
        &self,
        fragment_id: FragmentId,
        kind: RecordKind,
    ) -> SyncResult<ExtractOutcome> {
        let fragment = self
            .store
            .get_fragment(fragment_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Fragment", fragment_id))?;
        let source = self.document_source(&fragment).await?;

        let removed = self.store.reset_fragment(fragment.id).await?;
        info!(fragment_id = %fragment.id, removed, kind = %kind, "Re-extracting fragment");

        let outcome = self
            .extractor
            .extract_into(&fragment, source, Some(kind), &StopSignal::never())
            .await?;
        if matches!(outcome, ExtractOutcome::Loaded { .. }) {
            self.store
                .mark_archive_processed(fragment.zip_archive_id)
                .await?;
        }
        Ok(outcome)
    }

    /// Set a dataset's kind and re-extract every fragment of its archives
    /// that failed or was typed differently.
    pub async fn reclassify_dataset(
        &self,
        dataset_id: DatasetId,
        kind: RecordKind,
    ) -> SyncResult<ReclassifySummary> {
        let dataset = self
            .store
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Dataset", dataset_id))?;
        self.store.set_dataset_kind(dataset.id, kind).await?;

        let fragments = self
            .store
            .fragments_for_reclassification(dataset.id, kind)
            .await?;
        info!(
            dataset = %dataset.identifier,
            kind = %kind,
            fragments = fragments.len(),
            "Reclassifying dataset"
        );

        let mut summary = ReclassifySummary::default();
        for fragment in fragments {
            match self.reclassify_fragment(fragment.id, kind).await {
                Ok(outcome) => {
                    summary.fragments += 1;
                    summary.records += outcome.records();
                },
                Err(e) => {
                    warn!(fragment_id = %fragment.id, error = %e, "Reclassification failed");
                    summary.failed.push((fragment.id, e.to_string()));
                },
            }
        }
        Ok(summary)
    }

    async fn document_source(&self, fragment: &Fragment) -> SyncResult<DocumentSource> {
        let archive = self
            .store
            .get_archive(fragment.zip_archive_id)
            .await?
            .ok_or_else(|| SyncError::not_found("Archive", fragment.zip_archive_id))?;

        let path = match (&archive.file_path, archive.status) {
            (Some(path), _) => PathBuf::from(path),
            (None, ArchiveStatus::Pending) => {
                return Err(SyncError::invalid(format!(
                    "Archive {} has not been downloaded",
                    archive.url
                )))
            },
            (None, _) => {
                return Err(SyncError::invalid(format!(
                    "Archive {} has no local file",
                    archive.url
                )))
            },
        };
        if !tokio::fs::try_exists(&path).await? {
            return Err(SyncError::not_found("Archive file", path.display()));
        }

        let is_document = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        Ok(if is_document {
            DocumentSource::File(path)
        } else {
            DocumentSource::ZipEntry {
                archive: path,
                entry: fragment.file_name.clone(),
            }
        })
    }
}
