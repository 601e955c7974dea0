//! Configuration types for media-dl

use crate::error::{Error, Result};
use crate::types::Quality;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download behavior configuration (directories, concurrency, chunking, ceilings)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Base download directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent downloads across the whole process (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Size of each streamed chunk in bytes (default: 1 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Soft budget for bytes buffered in flight across all transfers (default: 64 MiB)
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: usize,

    /// Largest accepted content length (default: 2 GB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Minimum time between progress reports for one transfer (default: 10 seconds)
    #[serde(
        default = "default_progress_interval",
        rename = "progress_update_interval_seconds",
        with = "duration_serde"
    )]
    pub progress_update_interval: Duration,

    /// Quality requested when an item does not say otherwise (default: hi_res)
    #[serde(default)]
    pub default_quality: Quality,

    /// Naming template for tracks (default: "{title} - {artist}")
    #[serde(default = "default_track_name_template")]
    pub track_name_template: String,

    /// File collision handling for output files
    #[serde(default)]
    pub file_collision: FileCollisionAction,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            chunk_size_bytes: default_chunk_size(),
            memory_budget_bytes: default_memory_budget(),
            max_file_size_bytes: default_max_file_size(),
            progress_update_interval: default_progress_interval(),
            default_quality: Quality::default(),
            track_name_template: default_track_name_template(),
            file_collision: FileCollisionAction::default(),
        }
    }
}

/// Outbound request throttling (token budget + sliding window)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window without touching burst tokens (default: 50)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Length of the sliding window (default: 60 seconds)
    #[serde(
        default = "default_window",
        rename = "window_seconds",
        with = "duration_serde"
    )]
    pub window: Duration,

    /// Extra requests admissible on top of `max_requests` (default: 10)
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: u32,

    /// Longest a caller waits for admission before `RateLimitTimeout` (default: 300 seconds)
    #[serde(
        default = "default_rate_limit_max_wait",
        rename = "rate_limit_max_wait",
        with = "duration_serde"
    )]
    pub max_wait: Duration,

    /// Sleep between admission attempts while waiting (default: 100 ms)
    #[serde(
        default = "default_rate_limit_poll_interval",
        rename = "rate_limit_poll_interval_ms",
        with = "millis_serde"
    )]
    pub poll_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            burst_allowance: default_burst_allowance(),
            max_wait: default_rate_limit_max_wait(),
            poll_interval: default_rate_limit_poll_interval(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts", rename = "retry_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further retry (default: 5 seconds)
    #[serde(
        default = "default_initial_delay",
        rename = "retry_base_delay",
        with = "duration_serde"
    )]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(
        default = "default_max_delay",
        rename = "retry_max_delay",
        with = "duration_serde"
    )]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier", rename = "retry_backoff")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true", rename = "retry_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Metadata cache sizing and expiry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached entries (default: 1000)
    #[serde(default = "default_cache_max_entries", rename = "cache_max_entries")]
    pub max_entries: usize,

    /// Default time-to-live of an entry (default: 1800 seconds)
    #[serde(
        default = "default_cache_ttl",
        rename = "cache_ttl_seconds",
        with = "duration_serde"
    )]
    pub ttl: Duration,

    /// Interval of the background sweep of expired entries (default: 3600 seconds)
    #[serde(
        default = "default_cache_sweep_interval",
        rename = "cache_sweep_interval",
        with = "duration_serde"
    )]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl: default_cache_ttl(),
            sweep_interval: default_cache_sweep_interval(),
        }
    }
}

/// Archive packaging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Pack completed batches into zip segments (default: true)
    #[serde(default = "default_true", rename = "archive_enabled")]
    pub enabled: bool,

    /// Upper bound of input bytes per segment (default: 1.9 GB)
    #[serde(default = "default_split_size", rename = "archive_split_size_bytes")]
    pub split_size_bytes: u64,

    /// Deflate level 0-9, 0 stores without compression (default: 6)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Concurrent packing jobs across batches (default: 5)
    #[serde(default = "default_archive_concurrency", rename = "archive_concurrency")]
    pub concurrency: usize,

    /// Read buffer used while streaming inputs into the archive (default: 64 KiB)
    #[serde(default = "default_archive_read_chunk", rename = "archive_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            split_size_bytes: default_split_size(),
            compression_level: default_compression_level(),
            concurrency: default_archive_concurrency(),
            read_chunk_bytes: default_archive_read_chunk(),
        }
    }
}

/// Main configuration for the media pipeline
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig): directories, concurrency, chunking, ceilings
/// - [`rate_limit`](RateLimitConfig): outbound request throttling
/// - [`retry`](RetryConfig): backoff for transient failures
/// - [`cache`](CacheConfig): metadata cache sizing and expiry
/// - [`archive`](ArchiveConfig): split zip packaging
///
/// All sub-config fields are flattened, so the serialized form is a single
/// flat object (`max_concurrent_downloads`, `window_seconds`, `cache_ttl_seconds`, ...).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Rate limiting settings
    #[serde(flatten)]
    pub rate_limit: RateLimitConfig,

    /// Retry settings
    #[serde(flatten)]
    pub retry: RetryConfig,

    /// Metadata cache settings
    #[serde(flatten)]
    pub cache: CacheConfig,

    /// Archive packaging settings
    #[serde(flatten)]
    pub archive: ArchiveConfig,
}

impl Config {
    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file '{}': {}", path.display(), e),
            ))
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(Error::config(
                "max_concurrent_downloads",
                "must be at least 1",
            ));
        }
        if self.download.chunk_size_bytes == 0 {
            return Err(Error::config("chunk_size_bytes", "must be greater than zero"));
        }
        if self.download.memory_budget_bytes == 0 {
            return Err(Error::config(
                "memory_budget_bytes",
                "must be greater than zero",
            ));
        }
        if self.download.chunk_size_bytes > self.download.memory_budget_bytes {
            return Err(Error::config(
                "chunk_size_bytes",
                format!(
                    "chunk size {} exceeds memory budget {}",
                    self.download.chunk_size_bytes, self.download.memory_budget_bytes
                ),
            ));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(Error::config("max_requests", "must be at least 1"));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::config("window_seconds", "must be greater than zero"));
        }
        if self.archive.split_size_bytes == 0 {
            return Err(Error::config(
                "archive_split_size_bytes",
                "must be greater than zero",
            ));
        }
        if self.archive.compression_level > 9 {
            return Err(Error::config(
                "compression_level",
                format!("{} is outside 0-9", self.archive.compression_level),
            ));
        }
        if self.archive.concurrency == 0 {
            return Err(Error::config("archive_concurrency", "must be at least 1"));
        }
        Ok(())
    }
}

/// How to handle an output path that already exists
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCollisionAction {
    /// Append (1), (2), etc. to the file name
    #[default]
    Rename,
    /// Overwrite the existing file
    Overwrite,
    /// Fail the item
    Skip,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    5
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_memory_budget() -> usize {
    64 * 1024 * 1024
}

fn default_max_file_size() -> u64 {
    2_000_000_000
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_track_name_template() -> String {
    "{title} - {artist}".to_string()
}

fn default_max_requests() -> u32 {
    50
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_burst_allowance() -> u32 {
    10
}

fn default_rate_limit_max_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_rate_limit_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(1800)
}

fn default_cache_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_split_size() -> u64 {
    1_900_000_000
}

fn default_compression_level() -> u32 {
    6
}

fn default_archive_concurrency() -> usize {
    5
}

fn default_archive_read_chunk() -> usize {
    64 * 1024
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
