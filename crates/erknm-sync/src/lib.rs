//! ERKNM open-data synchronisation engine
//!
//! Walks the public open-data feed of the unified register of control and
//! supervisory activities, downloads every published archive at most once,
//! and streams the plan and inspection records inside them into PostgreSQL.
//!
//! # Layout
//!
//! - [`orchestrator`]: one run over the feed, batching, pacing, early stop
//! - [`ingest`]: fetch pipeline (dedup, retry, quarantine) and streaming extraction
//! - [`feed`]: list and manifest collaborators
//! - [`store`]: the [`store::SyncStore`] persistence seam and its Postgres implementation
//! - [`control`], [`manual`], [`reclassify`]: operator actions
//!
//! # Example
//!
//! ```no_run
//! use erknm_sync::control::SyncController;
//!
//! # async fn run(controller: SyncController) -> anyhow::Result<()> {
//! let summary = controller.run_sync(false).await?;
//! println!("{} records loaded", summary.counters.records_loaded);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod classifier;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod log_sink;
pub mod manual;
pub mod orchestrator;
pub mod reclassify;
pub mod store;

pub use error::{SyncError, SyncResult};
