//! ERKNM Common Library
//!
//! Shared plumbing for the ERKNM open-data synchronisation workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: streaming SHA-256 used for archive content deduplication
//! - **Logging**: tracing subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use erknm_common::checksum::sha256_file;
//!
//! fn fingerprint(path: &str) -> erknm_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "archive fingerprint");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
