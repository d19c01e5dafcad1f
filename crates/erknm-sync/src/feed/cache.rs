//! Local copies of dataset manifests
//!
//! Manifests live at `{meta_dir}/{identifier}.xml`. A cached copy is used
//! as-is; the network is only consulted when no copy exists, and a copy
//! left over from an earlier run still serves when the fetch fails.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::parser::parse_manifest;
use super::{DatasetManifest, MetadataFetcher};

pub struct ManifestCache {
    dir: PathBuf,
    fetcher: Arc<dyn MetadataFetcher>,
}

/// Identifiers come from the feed; keep them from escaping the cache dir.
fn cache_file_name(identifier: &str) -> String {
    let cleaned: String = identifier
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "dataset.xml".to_string()
    } else {
        format!("{}.xml", cleaned)
    }
}

impl ManifestCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn MetadataFetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
        }
    }

    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(cache_file_name(identifier))
    }

    pub async fn load(&self, identifier: &str, url: &str) -> anyhow::Result<DatasetManifest> {
        let path = self.path_for(identifier);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(identifier, path = %path.display(), "Using cached manifest");
            return read_cached(&path).await;
        }

        match self.fetcher.fetch(url).await {
            Ok(bytes) => {
                let manifest = parse_manifest(&bytes)
                    .with_context(|| format!("Failed to parse manifest {}", url))?;
                if let Err(e) = write_cached(&path, &bytes).await {
                    warn!(identifier, error = %e, "Could not cache manifest");
                }
                Ok(manifest)
            },
            // Another process may have written it meanwhile
            Err(e) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                warn!(identifier, error = %e, "Manifest fetch failed, using cached copy");
                read_cached(&path).await
            },
            Err(e) => Err(e),
        }
    }
}

async fn read_cached(path: &Path) -> anyhow::Result<DatasetManifest> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_manifest(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn write_cached(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("xml.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
