//! Persistence layer
//!
//! [`SyncStore`] is the only way the engine touches durable state. The store
//! is the single source of truth for run status, the stop flag and counters;
//! nothing in the engine caches them beyond a single decision.
//!
//! [`PgSyncStore`] is the production implementation over PostgreSQL.

pub mod models;
pub mod postgres;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::db::DbResult;

pub use models::*;
pub use postgres::PgSyncStore;

#[async_trait]
pub trait SyncStore: Send + Sync {
    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Insert a new `running` run.
    async fn create_run(&self, manual: bool) -> DbResult<SyncRun>;

    async fn get_run(&self, id: RunId) -> DbResult<Option<SyncRun>>;

    /// Most recently started run in `running` or `stopping`.
    async fn active_run(&self) -> DbResult<Option<SyncRun>>;

    /// Most recently started run in `paused`.
    async fn latest_paused_run(&self) -> DbResult<Option<SyncRun>>;

    /// Unknown runs report `false`.
    async fn is_stop_requested(&self, id: RunId) -> DbResult<bool>;

    /// Raise the stop flag (and move `running` to `stopping`) while the run
    /// is active. Idempotent; returns whether the run exists at all.
    async fn request_stop(&self, id: RunId) -> DbResult<bool>;

    /// Close a run with its counters and clear the stop flag. A run that is
    /// `stopping` or carries the stop flag always ends `stopped`, whatever
    /// `status` asks for; a run that is already terminal is left untouched.
    /// Returns the run's status afterwards.
    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        message: Option<&str>,
        counters: RunCounters,
    ) -> DbResult<RunStatus>;

    /// Close a run as `stopped` immediately, keeping whatever counters it has.
    /// The stop flag stays raised so a live worker still winds down.
    /// Returns `false` if the run is unknown or already terminal.
    async fn force_finish(&self, id: RunId, message: &str) -> DbResult<bool>;

    /// Force-close active runs started more than `threshold` ago that never
    /// finished: `stopping` becomes `stopped`, anything else `aborted`.
    async fn reconcile_stale_runs(&self, threshold: Duration) -> DbResult<Vec<ReconciledRun>>;

    async fn run_stats(&self, id: RunId) -> DbResult<RunStats>;

    /// Delete a run and its log entries; archives it created are detached.
    async fn delete_run(&self, id: RunId) -> DbResult<DeletedRun>;

    // ------------------------------------------------------------------
    // Datasets and versions
    // ------------------------------------------------------------------

    /// Insert or refresh a dataset by identifier. An existing
    /// classification survives when `kind` is `None`.
    async fn upsert_dataset(&self, dataset: &NewDataset) -> DbResult<Dataset>;

    async fn get_dataset(&self, id: DatasetId) -> DbResult<Option<Dataset>>;

    async fn set_dataset_kind(&self, id: DatasetId, kind: RecordKind) -> DbResult<()>;

    /// Insert-if-absent on (dataset, source url). Returns `true` if inserted.
    async fn insert_version(&self, version: &NewDatasetVersion) -> DbResult<bool>;

    // ------------------------------------------------------------------
    // Archives
    // ------------------------------------------------------------------

    async fn find_archive_by_url(&self, url: &str) -> DbResult<Option<Archive>>;

    async fn get_archive(&self, id: ArchiveId) -> DbResult<Option<Archive>>;

    /// Whether some archive other than `except` with this content hash is
    /// already `processed`.
    async fn processed_hash_exists(&self, hash: &str, except: Option<ArchiveId>)
        -> DbResult<bool>;

    /// Insert a `pending` archive for `url` unless one exists; return the row.
    async fn register_archive(&self, url: &str, run_id: Option<RunId>) -> DbResult<Archive>;

    async fn mark_archive_downloaded(
        &self,
        id: ArchiveId,
        file_path: &str,
        file_size: u64,
        hash: &str,
    ) -> DbResult<()>;

    async fn mark_archive_processed(&self, id: ArchiveId) -> DbResult<()>;

    async fn mark_archive_error(&self, id: ArchiveId, message: &str) -> DbResult<()>;

    // ------------------------------------------------------------------
    // Fragments and records
    // ------------------------------------------------------------------

    /// New fragment in `parsing` with no type yet.
    async fn create_fragment(&self, archive_id: ArchiveId, file_name: &str)
        -> DbResult<Fragment>;

    async fn get_fragment(&self, id: FragmentId) -> DbResult<Option<Fragment>>;

    async fn set_fragment_kind(&self, id: FragmentId, kind: FragmentKind) -> DbResult<()>;

    async fn finish_fragment(&self, id: FragmentId, outcome: &FragmentOutcome) -> DbResult<()>;

    /// Fragments of a dataset's archives that are in `error` or typed
    /// differently from `kind`.
    async fn fragments_for_reclassification(
        &self,
        dataset_id: DatasetId,
        kind: RecordKind,
    ) -> DbResult<Vec<Fragment>>;

    /// Remove every record of a fragment and reset it to `pending`.
    async fn reset_fragment(&self, id: FragmentId) -> DbResult<u64>;

    /// Commit one batch atomically. A row that fails to insert is skipped
    /// without discarding the rest of the batch.
    async fn insert_records(&self, records: &[NewRecord]) -> DbResult<BatchOutcome>;

    // ------------------------------------------------------------------
    // Log and settings
    // ------------------------------------------------------------------

    async fn append_log(&self, entry: &NewLogEntry) -> DbResult<()>;

    /// Operator-editable key/value settings.
    async fn load_settings(&self) -> DbResult<HashMap<String, String>>;
}
