//! HTTP access to the open-data portal

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::parser::parse_feed_list;
use super::{FeedEntry, FeedLister, MetadataFetcher};
use crate::config::FetchConfig;
use crate::ingest::backoff::BackoffPolicy;
use crate::ingest::fetch::{build_client, fetch_bytes};

/// Feed listing and manifest retrieval over HTTP
#[derive(Clone)]
pub struct HttpFeedClient {
    client: Client,
    list_url: String,
    policy: BackoffPolicy,
}

impl HttpFeedClient {
    pub fn new(list_url: impl Into<String>, config: &FetchConfig) -> anyhow::Result<Self> {
        let client = build_client(config).context("Failed to build HTTP client")?;
        Ok(Self::with_client(
            client,
            list_url,
            BackoffPolicy::from_config(config),
        ))
    }

    pub fn with_client(client: Client, list_url: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            client,
            list_url: list_url.into(),
            policy,
        }
    }

    pub fn list_url(&self) -> &str {
        &self.list_url
    }
}

#[async_trait]
impl FeedLister for HttpFeedClient {
    async fn list(&self) -> anyhow::Result<Vec<FeedEntry>> {
        info!(url = %self.list_url, "Fetching feed listing");
        let body = fetch_bytes(&self.client, &self.list_url, &self.policy)
            .await
            .with_context(|| format!("Failed to fetch {}", self.list_url))?;
        let entries = parse_feed_list(&body)
            .with_context(|| format!("Failed to parse {}", self.list_url))?;
        info!(datasets = entries.len(), "Feed listing parsed");
        Ok(entries)
    }
}

#[async_trait]
impl MetadataFetcher for HttpFeedClient {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        debug!(url, "Fetching manifest");
        let body = fetch_bytes(&self.client, url, &self.policy)
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        Ok(body)
    }
}
