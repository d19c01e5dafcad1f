//! Top-level error type of the engine

use thiserror::Error;

use crate::db::DbError;
use crate::ingest::{ExtractError, FetchError};
use crate::store::RunId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Retrieving the top-level feed listing failed; fatal for the run
    #[error("Feed listing failed: {0:#}")]
    Feed(anyhow::Error),

    /// Another run is still `running` or `stopping`
    #[error("Sync run {0} is already in progress")]
    AlreadyRunning(RunId),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn not_found(resource_type: &str, identifier: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}' not found", resource_type, identifier))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
