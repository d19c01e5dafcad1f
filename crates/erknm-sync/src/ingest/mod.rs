//! Archive ingestion
//!
//! [`ArchivePipeline::ensure_processed`] is the single entry point: given an
//! archive URL it decides whether any work is needed, downloads the archive
//! if so, picks the document inside and streams its records into the store.
//! Calling it again for the same URL is a no-op once the archive has been
//! processed.

pub mod backoff;
pub mod cancel;
pub mod extract;
pub mod fetch;
pub mod pipeline;

pub use backoff::BackoffPolicy;
pub use cancel::StopSignal;
pub use extract::{DocumentSource, ExtractError, ExtractOutcome, Extractor};
pub use fetch::{ArchiveFetcher, FetchError};
pub use pipeline::{archive_file_name, ArchiveOutcome, ArchivePipeline, SkipReason};
