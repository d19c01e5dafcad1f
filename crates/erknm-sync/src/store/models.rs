//! Persistent entities and their status enums
//!
//! Status values are stored as lowercase TEXT columns; every enum here
//! round-trips through `as_str` / `FromStr` and decodes from rows via
//! `TryFrom<String>`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RunId = Uuid;
pub type DatasetId = Uuid;
pub type ArchiveId = Uuid;
pub type FragmentId = Uuid;

/// Message written when a run ends because an operator asked it to
pub const STOPPED_BY_OPERATOR: &str = "Stopped by operator";
/// Fragment error when no type marker matched or nothing was extracted
pub const UNCLASSIFIED_DOCUMENT: &str = "unknown document type";
/// Fragment error when extraction was interrupted by a stop request
pub const CANCELLED_BY_STOP: &str = "cancelled";

/// A status string that does not name any known variant
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, UnknownVariant> {
                value.parse()
            }
        }
    };
}

/// Lifecycle of one synchronisation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Stop requested, the worker has not acknowledged it yet
    Stopping,
    Stopped,
    /// Resumable; resuming starts a fresh run
    Paused,
    Completed,
    Error,
    /// Orphaned by a crash and closed by reconciliation
    Aborted,
}

text_enum!(RunStatus, "run status", {
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Paused => "paused",
    Completed => "completed",
    Error => "error",
    Aborted => "aborted",
});

impl RunStatus {
    /// Still owned by a live worker
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Stopped | RunStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Pending,
    Downloaded,
    Processed,
    Error,
}

text_enum!(ArchiveStatus, "archive status", {
    Pending => "pending",
    Downloaded => "downloaded",
    Processed => "processed",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    Pending,
    Parsing,
    Loaded,
    Error,
}

text_enum!(FragmentStatus, "fragment status", {
    Pending => "pending",
    Parsing => "parsing",
    Loaded => "loaded",
    Error => "error",
});

/// The two mutually exclusive record families published by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Plan,
    Inspection,
}

text_enum!(RecordKind, "record kind", {
    Plan => "plan",
    Inspection => "inspection",
});

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Plan, RecordKind::Inspection];

    /// Element tag (lowercase, namespace stripped) that marks one record
    pub fn marker(self) -> &'static str {
        self.as_str()
    }

    /// Exact match of a namespace-stripped tag against the type markers.
    pub fn from_marker(local_name: &str) -> Option<Self> {
        let lowered = local_name.to_lowercase();
        Self::ALL.into_iter().find(|kind| lowered == kind.marker())
    }

    /// Containment match used for document roots (`PlanList`, `Inspections`).
    /// Plan is checked first.
    pub fn from_root_tag(local_name: &str) -> Option<Self> {
        let lowered = local_name.to_lowercase();
        Self::ALL.into_iter().find(|kind| lowered.contains(kind.marker()))
    }
}

/// Classification stored on a fragment; `Unknown` when no marker matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Plan,
    Inspection,
    Unknown,
}

text_enum!(FragmentKind, "fragment kind", {
    Plan => "plan",
    Inspection => "inspection",
    Unknown => "unknown",
});

impl From<RecordKind> for FragmentKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Plan => FragmentKind::Plan,
            RecordKind::Inspection => FragmentKind::Inspection,
        }
    }
}

/// Severity column of the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

text_enum!(LogSeverity, "log level", {
    Info => "INFO",
    Warning => "WARNING",
    Error => "ERROR",
});

/// Coarse phase of a run a log entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStage {
    General,
    List,
    Dataset,
    Data,
}

text_enum!(LogStage, "log stage", {
    General => "general",
    List => "list",
    Dataset => "dataset",
    Data => "data",
});

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: RunStatus,
    pub is_manual: bool,
    pub stop_requested: bool,
    pub files_processed: i64,
    pub records_loaded: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dataset {
    pub id: DatasetId,
    pub identifier: String,
    pub title: String,
    pub link: String,
    pub data_type: Option<String>,
}

impl Dataset {
    pub fn kind(&self) -> Option<RecordKind> {
        self.data_type.as_deref().and_then(|t| t.parse().ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Archive {
    pub id: ArchiveId,
    pub url: String,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub sha256_hash: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ArchiveStatus,
    pub error_message: Option<String>,
    pub sync_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fragment {
    pub id: FragmentId,
    pub zip_archive_id: ArchiveId,
    pub file_name: String,
    pub data_type: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: FragmentStatus,
    pub records_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Fragment {
    pub fn kind(&self) -> Option<FragmentKind> {
        self.data_type.as_deref().and_then(|t| t.parse().ok())
    }
}

// ============================================================================
// Inputs and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataset {
    pub identifier: String,
    pub title: String,
    pub link: String,
    pub kind: Option<RecordKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDatasetVersion {
    pub dataset_id: DatasetId,
    pub source_url: String,
    pub created: String,
    pub provenance: String,
    pub structure: String,
}

/// One normalised record ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub archive_id: ArchiveId,
    pub fragment_id: FragmentId,
    pub kind: RecordKind,
    pub key: Option<String>,
    pub date: Option<NaiveDate>,
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub raw_xml: String,
}

/// Counters carried by a run and written on finish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub files_processed: u64,
    pub records_loaded: u64,
}

impl RunCounters {
    pub fn add_archive(&mut self, records: u64) {
        if records > 0 {
            self.files_processed += 1;
            self.records_loaded += records;
        }
    }
}

/// Result of committing one record batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// How a fragment ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Loaded { kind: RecordKind, records: u64 },
    /// No type marker matched or no records were produced
    Unclassified,
    Failed { message: String },
    Cancelled { records: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub run_id: Option<RunId>,
    pub category: String,
    pub message: String,
    pub level: LogSeverity,
    pub stage: LogStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledRun {
    pub id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunStats {
    pub archives: i64,
    pub fragments: i64,
    pub records: i64,
    pub log_entries: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRun {
    pub archives_detached: u64,
    pub logs_deleted: u64,
}
