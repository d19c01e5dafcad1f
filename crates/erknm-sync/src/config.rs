//! Sync configuration
//!
//! Loaded once from the environment (with `.env` support). A small subset of
//! settings can be overridden per run from the persisted `robot_settings`
//! table, see [`SyncConfig::apply_overrides`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_SOURCE_URL: &str = "https://proverki.gov.ru/portal/public-open-data";
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";
pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_PAUSE_MIN_SECS: u64 = 30;
pub const DEFAULT_BATCH_PAUSE_MAX_SECS: u64 = 60;
pub const DEFAULT_STOP_ON_REPEATS_COUNT: u32 = 3;
pub const DEFAULT_FETCH_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_FETCH_BASE_DELAY_SECS: u64 = 10;
pub const DEFAULT_FETCH_JITTER_SECS: u64 = 2;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLITENESS_MIN_SECS: u64 = 10;
pub const DEFAULT_POLITENESS_JITTER_MIN_SECS: u64 = 3;
pub const DEFAULT_POLITENESS_JITTER_MAX_SECS: u64 = 7;
pub const DEFAULT_COMMIT_BATCH_SIZE: usize = 100;
pub const DEFAULT_STALE_RUN_SECS: u64 = 3600;
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                                      AppleWebKit/537.36 (KHTML, like Gecko) \
                                      Chrome/124.0 Safari/537.36";

/// Keys of `robot_settings` the engine reads at the start of every run
pub const SETTING_SYNC_ORDER: &str = "sync_order";
pub const SETTING_STOP_ON_REPEATS: &str = "stop_on_repeats_enabled";
pub const SETTING_STOP_ON_REPEATS_COUNT: &str = "stop_on_repeats_count";

/// Direction in which the feed is walked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOrder {
    /// Feed order as published
    #[default]
    OldToNew,
    /// Datasets and each dataset's versions reversed
    NewToOld,
}

impl std::str::FromStr for SyncOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "old_to_new" => Ok(SyncOrder::OldToNew),
            "new_to_old" => Ok(SyncOrder::NewToOld),
            other => anyhow::bail!(
                "Invalid sync order: {}. Must be 'old_to_new' or 'new_to_old'",
                other
            ),
        }
    }
}

impl std::fmt::Display for SyncOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOrder::OldToNew => write!(f, "old_to_new"),
            SyncOrder::NewToOld => write!(f, "new_to_old"),
        }
    }
}

/// Retry budget for a single remote resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub jitter_secs: u64,
    /// Per-attempt request timeout
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_FETCH_BASE_DELAY_SECS,
            jitter_secs: DEFAULT_FETCH_JITTER_SECS,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Sleep after every successful archive download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolitenessConfig {
    pub min_secs: u64,
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_secs: DEFAULT_POLITENESS_MIN_SECS,
            jitter_min_secs: DEFAULT_POLITENESS_JITTER_MIN_SECS,
            jitter_max_secs: DEFAULT_POLITENESS_JITTER_MAX_SECS,
        }
    }
}

impl PolitenessConfig {
    /// No pause at all; used by tests and manual ingestion
    pub fn none() -> Self {
        Self {
            min_secs: 0,
            jitter_min_secs: 0,
            jitter_max_secs: 0,
        }
    }

    /// `min + U(jitter_min, jitter_max)` with millisecond resolution
    pub fn next_delay(&self) -> Duration {
        let lo = self.jitter_min_secs.saturating_mul(1000);
        let hi = self.jitter_max_secs.saturating_mul(1000).max(lo);
        let jitter_ms = fastrand::u64(lo..=hi);
        Duration::from_secs(self.min_secs) + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base of the open-data portal; the feed list lives at `{source_url}/list.xml`
    pub source_url: String,
    /// Root for `zips/`, `meta/` and `quarantine/`
    pub download_dir: PathBuf,
    pub sync_order: SyncOrder,
    /// Datasets per batch
    pub batch_size: usize,
    pub batch_pause_min_secs: u64,
    pub batch_pause_max_secs: u64,
    pub stop_on_repeats_enabled: bool,
    pub stop_on_repeats_count: u32,
    pub fetch: FetchConfig,
    pub politeness: PolitenessConfig,
    /// Records per committed transaction during extraction
    pub commit_batch_size: usize,
    pub stale_run_threshold_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            sync_order: SyncOrder::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_pause_min_secs: DEFAULT_BATCH_PAUSE_MIN_SECS,
            batch_pause_max_secs: DEFAULT_BATCH_PAUSE_MAX_SECS,
            stop_on_repeats_enabled: false,
            stop_on_repeats_count: DEFAULT_STOP_ON_REPEATS_COUNT,
            fetch: FetchConfig::default(),
            politeness: PolitenessConfig::default(),
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            stale_run_threshold_secs: DEFAULT_STALE_RUN_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl SyncConfig {
    /// Load configuration from the environment (and `.env` if present)
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let sync_order = match std::env::var("ERKNM_SYNC_ORDER") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.sync_order,
        };

        let config = Self {
            source_url: std::env::var("ERKNM_SOURCE_URL")
                .unwrap_or_else(|_| DEFAULT_SOURCE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            download_dir: std::env::var("ERKNM_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            sync_order,
            batch_size: env_or("ERKNM_BATCH_SIZE", defaults.batch_size),
            batch_pause_min_secs: env_or(
                "ERKNM_BATCH_PAUSE_MIN_SECS",
                defaults.batch_pause_min_secs,
            ),
            batch_pause_max_secs: env_or(
                "ERKNM_BATCH_PAUSE_MAX_SECS",
                defaults.batch_pause_max_secs,
            ),
            stop_on_repeats_enabled: std::env::var("ERKNM_STOP_ON_REPEATS")
                .ok()
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.stop_on_repeats_enabled),
            stop_on_repeats_count: env_or(
                "ERKNM_STOP_ON_REPEATS_COUNT",
                defaults.stop_on_repeats_count,
            ),
            fetch: FetchConfig {
                max_attempts: env_or("ERKNM_FETCH_MAX_ATTEMPTS", defaults.fetch.max_attempts),
                base_delay_secs: env_or(
                    "ERKNM_FETCH_BASE_DELAY_SECS",
                    defaults.fetch.base_delay_secs,
                ),
                jitter_secs: env_or("ERKNM_FETCH_JITTER_SECS", defaults.fetch.jitter_secs),
                timeout_secs: env_or("ERKNM_FETCH_TIMEOUT_SECS", defaults.fetch.timeout_secs),
                user_agent: std::env::var("ERKNM_USER_AGENT")
                    .unwrap_or(defaults.fetch.user_agent),
            },
            politeness: PolitenessConfig {
                min_secs: env_or("ERKNM_POLITENESS_MIN_SECS", defaults.politeness.min_secs),
                jitter_min_secs: env_or(
                    "ERKNM_POLITENESS_JITTER_MIN_SECS",
                    defaults.politeness.jitter_min_secs,
                ),
                jitter_max_secs: env_or(
                    "ERKNM_POLITENESS_JITTER_MAX_SECS",
                    defaults.politeness.jitter_max_secs,
                ),
            },
            commit_batch_size: env_or("ERKNM_COMMIT_BATCH_SIZE", defaults.commit_batch_size),
            stale_run_threshold_secs: env_or(
                "ERKNM_STALE_RUN_SECS",
                defaults.stale_run_threshold_secs,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_url.trim().is_empty() {
            anyhow::bail!("ERKNM_SOURCE_URL cannot be empty");
        }
        if self.batch_size == 0 {
            anyhow::bail!("ERKNM_BATCH_SIZE must be greater than 0");
        }
        if self.batch_pause_min_secs > self.batch_pause_max_secs {
            anyhow::bail!(
                "ERKNM_BATCH_PAUSE_MIN_SECS ({}) cannot exceed ERKNM_BATCH_PAUSE_MAX_SECS ({})",
                self.batch_pause_min_secs,
                self.batch_pause_max_secs
            );
        }
        if self.politeness.jitter_min_secs > self.politeness.jitter_max_secs {
            anyhow::bail!("ERKNM_POLITENESS_JITTER_MIN_SECS cannot exceed ERKNM_POLITENESS_JITTER_MAX_SECS");
        }
        if self.fetch.max_attempts == 0 {
            anyhow::bail!("ERKNM_FETCH_MAX_ATTEMPTS must be greater than 0");
        }
        if self.commit_batch_size == 0 {
            anyhow::bail!("ERKNM_COMMIT_BATCH_SIZE must be greater than 0");
        }
        if self.stale_run_threshold_secs == 0 {
            anyhow::bail!("ERKNM_STALE_RUN_SECS must be greater than 0");
        }
        Ok(())
    }

    /// Apply operator overrides from the settings table. Unknown keys and
    /// values that do not parse are ignored.
    pub fn apply_overrides(&mut self, settings: &HashMap<String, String>) {
        for (key, value) in settings {
            match key.as_str() {
                SETTING_SYNC_ORDER => match value.parse() {
                    Ok(order) => self.sync_order = order,
                    Err(e) => warn!(key = %key, value = %value, error = %e, "Ignoring setting"),
                },
                SETTING_STOP_ON_REPEATS => match parse_flag(value) {
                    Some(flag) => self.stop_on_repeats_enabled = flag,
                    None => warn!(key = %key, value = %value, "Ignoring non-boolean setting"),
                },
                SETTING_STOP_ON_REPEATS_COUNT => match value.trim().parse::<u32>() {
                    Ok(count) if count > 0 => self.stop_on_repeats_count = count,
                    _ => warn!(key = %key, value = %value, "Ignoring invalid repeat threshold"),
                },
                _ => {},
            }
        }
    }

    pub fn list_url(&self) -> String {
        format!("{}/list.xml", self.source_url.trim_end_matches('/'))
    }

    pub fn zips_dir(&self) -> PathBuf {
        self.download_dir.join("zips")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.download_dir.join("meta")
    }

    pub fn stale_run_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_run_threshold_secs)
    }

    /// Uniform pause between feed batches
    pub fn next_batch_pause(&self) -> Duration {
        let lo = self.batch_pause_min_secs.saturating_mul(1000);
        let hi = self.batch_pause_max_secs.saturating_mul(1000).max(lo);
        Duration::from_millis(fastrand::u64(lo..=hi))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.commit_batch_size, 100);
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(
            config.list_url(),
            "https://proverki.gov.ru/portal/public-open-data/list.xml"
        );
    }

    #[test]
    fn test_validate_rejects_inverted_pause() {
        let config = SyncConfig {
            batch_pause_min_secs: 90,
            batch_pause_max_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_order_parse() {
        assert_eq!("new_to_old".parse::<SyncOrder>().unwrap(), SyncOrder::NewToOld);
        assert_eq!(" OLD_TO_NEW ".parse::<SyncOrder>().unwrap(), SyncOrder::OldToNew);
        assert!("sideways".parse::<SyncOrder>().is_err());
    }

    #[test]
    fn test_overrides_ignore_garbage() {
        let mut config = SyncConfig::default();
        let settings: HashMap<String, String> = [
            ("sync_order", "new_to_old"),
            ("stop_on_repeats_enabled", "true"),
            ("stop_on_repeats_count", "zero"),
            ("unrelated", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        config.apply_overrides(&settings);
        assert_eq!(config.sync_order, SyncOrder::NewToOld);
        assert!(config.stop_on_repeats_enabled);
        assert_eq!(config.stop_on_repeats_count, DEFAULT_STOP_ON_REPEATS_COUNT);
    }

    #[test]
    fn test_pauses_stay_in_range() {
        let config = SyncConfig {
            batch_pause_min_secs: 1,
            batch_pause_max_secs: 2,
            ..Default::default()
        };
        for _ in 0..50 {
            let pause = config.next_batch_pause();
            assert!(pause >= Duration::from_secs(1) && pause <= Duration::from_secs(2));
        }

        let politeness = PolitenessConfig::default();
        let delay = politeness.next_delay();
        assert!(delay >= Duration::from_secs(13) && delay <= Duration::from_secs(17));
        assert_eq!(PolitenessConfig::none().next_delay(), Duration::ZERO);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("ERKNM_SOURCE_URL", "http://localhost:9000/feed/");
        std::env::set_var("ERKNM_BATCH_SIZE", "7");
        std::env::set_var("ERKNM_STOP_ON_REPEATS", "yes");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.source_url, "http://localhost:9000/feed");
        assert_eq!(config.batch_size, 7);
        assert!(config.stop_on_repeats_enabled);

        std::env::remove_var("ERKNM_SOURCE_URL");
        std::env::remove_var("ERKNM_BATCH_SIZE");
        std::env::remove_var("ERKNM_STOP_ON_REPEATS");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_order() {
        std::env::set_var("ERKNM_SYNC_ORDER", "random");
        assert!(SyncConfig::from_env().is_err());
        std::env::remove_var("ERKNM_SYNC_ORDER");
    }
}
