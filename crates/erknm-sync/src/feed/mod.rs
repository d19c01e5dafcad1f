//! Open-data feed collaborators
//!
//! The feed is a two-level catalogue: `list.xml` names every dataset, and
//! each dataset's manifest (the `link` of its list entry) names the archive
//! versions published for it.

pub mod cache;
pub mod http;
pub mod parser;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use cache::ManifestCache;
pub use http::HttpFeedClient;
pub use parser::{parse_feed_list, parse_manifest};

/// One dataset as announced by the feed listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub identifier: String,
    pub title: String,
    /// Manifest URL
    pub link: String,
    pub format: String,
}

/// A published archive version of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Archive URL
    pub source: String,
    pub created: String,
    pub provenance: String,
    pub structure: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub creator: String,
    pub subject: String,
    pub versions: Vec<VersionEntry>,
}

/// Retrieves the top-level dataset listing
#[async_trait]
pub trait FeedLister: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<FeedEntry>>;
}

/// Retrieves raw manifest documents
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}
