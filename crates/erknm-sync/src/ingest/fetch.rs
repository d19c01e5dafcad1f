//! Archive download with retry, validation and quarantine
//!
//! Bodies are streamed to `{dest}.part` and renamed into place only after
//! the whole body arrived and passed the container check, so a file at the
//! final path is always complete.

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::cancel::StopSignal;
use crate::config::{FetchConfig, PolitenessConfig};

/// Marker carried by every fatal-format error message
pub const NOT_ZIP_MARKER: &str = "NOT_ZIP";

/// Stop flag is polled once per this many body chunks
const STOP_CHECK_INTERVAL_CHUNKS: u64 = 1000;

#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection reset, timeout, truncated body
    #[error("Transient failure fetching {url}: {message}")]
    Transient { url: String, message: String },

    /// Non-success status; retryable only for 5xx and 429
    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },

    /// The body is not a zip container. Never retried.
    #[error("{diagnostic}")]
    NotAnArchive {
        diagnostic: String,
        quarantined: Option<PathBuf>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transient { .. } => true,
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            },
            None => FetchError::Transient {
                url: url.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Shared HTTP client with the per-attempt timeout and browser-like agent
pub fn build_client(config: &FetchConfig) -> Result<Client, FetchError> {
    Client::builder()
        .timeout(config.timeout())
        .user_agent(config.user_agent.as_str())
        .build()
        .map_err(|e| FetchError::Transient {
            url: String::new(),
            message: format!("failed to build HTTP client: {}", e),
        })
}

async fn get_once(client: &Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| FetchError::from_reqwest(url, e))?;
    Ok(body.to_vec())
}

/// GET a small document into memory, retrying transient failures.
pub async fn fetch_bytes(
    client: &Client,
    url: &str,
    policy: &BackoffPolicy,
) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 0;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            debug!(url, attempt, delay_ms = delay.as_millis() as u64, "Waiting before retry");
            tokio::time::sleep(delay).await;
        }

        match get_once(client, url).await {
            Ok(body) => return Ok(body),
            Err(e) if e.is_retryable() && !policy.is_last(attempt) => {
                warn!(url, attempt = attempt + 1, max = policy.max_attempts, error = %e, "Fetch failed, retrying");
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Why a file failed the container check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotAZip {
    pub size: u64,
    pub head: Vec<u8>,
}

/// Check the `PK` signature and that the central directory can be read.
pub fn check_archive(path: &Path) -> std::io::Result<Result<(), NotAZip>> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let mut head = Vec::with_capacity(4);
    (&mut file).take(4).read_to_end(&mut head)?;

    if !head.starts_with(b"PK") {
        return Ok(Err(NotAZip { size, head }));
    }

    let file = std::fs::File::open(path)?;
    match zip::ZipArchive::new(file) {
        Ok(_) => Ok(Ok(())),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Zip structure check failed");
            Ok(Err(NotAZip { size, head }))
        },
    }
}

/// Diagnostic stored on the archive row for a body that is not a zip
pub fn not_zip_diagnostic(url: &str, content_type: &str, bad: &NotAZip) -> String {
    format!(
        "{}: File is not a zip file. URL: {}, Content-Type: {}, Size: {} bytes, First bytes: {}",
        NOT_ZIP_MARKER,
        url,
        if content_type.is_empty() { "unknown" } else { content_type },
        bad.size,
        hex::encode(&bad.head)
    )
}

/// `zips/foo.zip` -> `zips/quarantine/foo_not_zip.zip`
pub fn quarantine_path(dest: &Path) -> PathBuf {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let suffix = dest
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    parent
        .join("quarantine")
        .join(format!("{}_not_zip{}", stem, suffix))
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial download");
        }
    }
}

/// Downloads archives one at a time, pausing after each success
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: Client,
    policy: BackoffPolicy,
    politeness: PolitenessConfig,
}

impl ArchiveFetcher {
    pub fn new(config: &FetchConfig, politeness: PolitenessConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: build_client(config)?,
            policy: BackoffPolicy::from_config(config),
            politeness,
        })
    }

    pub fn with_client(client: Client, policy: BackoffPolicy, politeness: PolitenessConfig) -> Self {
        Self {
            client,
            policy,
            politeness,
        }
    }

    /// Download `url` to `dest`, returning the byte count.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        stop: &StopSignal,
    ) -> Result<u64, FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempt = 0;
        loop {
            let delay = self.policy.delay_for(attempt);
            if !delay.is_zero() {
                info!(url, attempt = attempt + 1, delay_secs = delay.as_secs(), "Retrying download");
                tokio::time::sleep(delay).await;
                if stop.should_stop().await {
                    return Err(FetchError::Cancelled {
                        url: url.to_string(),
                    });
                }
            }

            match self.download_once(url, dest, stop).await {
                Ok(size) => {
                    info!(url, size, "Archive downloaded");
                    self.pause().await;
                    return Ok(size);
                },
                Err(e) if e.is_retryable() && !self.policy.is_last(attempt) => {
                    warn!(
                        url,
                        attempt = attempt + 1,
                        max = self.policy.max_attempts,
                        error = %e,
                        "Download attempt failed"
                    );
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn pause(&self) {
        let delay = self.politeness.next_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Politeness pause");
            tokio::time::sleep(delay).await;
        }
    }

    async fn download_once(
        &self,
        url: &str,
        dest: &Path,
        stop: &StopSignal,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut size = 0u64;
        let mut chunks = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    remove_quietly(&part).await;
                    return Err(FetchError::from_reqwest(url, e));
                },
            };
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
            chunks += 1;

            if chunks % STOP_CHECK_INTERVAL_CHUNKS == 0 && stop.should_stop().await {
                drop(file);
                remove_quietly(&part).await;
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }
        }
        file.flush().await?;
        drop(file);

        if size == 0 {
            remove_quietly(&part).await;
            return Err(FetchError::Transient {
                url: url.to_string(),
                message: "empty response body".to_string(),
            });
        }

        let check_path = part.clone();
        let verdict = tokio::task::spawn_blocking(move || check_archive(&check_path))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        if let Err(bad) = verdict {
            let diagnostic = not_zip_diagnostic(url, &content_type, &bad);
            let target = quarantine_path(dest);
            let quarantined = match self.quarantine(&part, &target).await {
                Ok(()) => Some(target),
                Err(e) => {
                    warn!(url, error = %e, "Failed to quarantine body");
                    remove_quietly(&part).await;
                    None
                },
            };
            warn!(url, content_type = %content_type, size, "Response is not a zip archive");
            return Err(FetchError::NotAnArchive {
                diagnostic,
                quarantined,
            });
        }

        tokio::fs::rename(&part, dest).await?;
        Ok(size)
    }

    async fn quarantine(&self, part: &Path, target: &Path) -> std::io::Result<()> {
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::rename(part, target).await
    }
}
