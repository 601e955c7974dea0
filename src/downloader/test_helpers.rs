//! Shared test helpers: in-memory provider, fetcher and progress sink.

use crate::config::Config;
use crate::downloader::DownloadEngine;
use crate::error::{Error, Result};
use crate::provider::{ContentFetcher, ContentStream, ProgressSink, ProviderClient};
use crate::types::{DownloadItem, ProgressUpdate, Quality, StreamLocation, TrackMetadata};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

/// Config with small chunks, fast retries and a generous rate limit
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.download.chunk_size_bytes = 1024;
    config.download.memory_budget_bytes = 64 * 1024;
    config.download.max_concurrent_downloads = 3;
    config.rate_limit.max_requests = 1000;
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    config
}

/// Helper to create an engine writing into a fresh temp dir.
/// Returns the engine and the tempdir (which must be kept alive).
pub(crate) fn create_test_engine(
    mut config: Config,
    provider: Arc<MockProvider>,
    fetcher: Arc<MockFetcher>,
) -> (DownloadEngine, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    config.download.download_dir = temp_dir.path().join("downloads");

    let engine = DownloadEngine::new(config, provider)
        .unwrap()
        .with_fetcher(fetcher);
    (engine, temp_dir)
}

/// Item with an explicit naming template
pub(crate) fn item(id: &str) -> DownloadItem {
    DownloadItem::new(id, "mock", Quality::HiRes, "{title} - {artist}")
}

/// Deterministic body of `len` bytes
pub(crate) fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Provider answering from fixed tables
#[derive(Default)]
pub(crate) struct MockProvider {
    pub metadata_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    /// Qualities offered per item; items not listed offer every quality
    qualities: HashMap<String, Vec<Quality>>,
    missing_metadata: HashSet<String>,
    /// Validity of issued stream locations (default: 10 minutes)
    stream_ttl: Option<chrono::Duration>,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn offering(mut self, item_id: &str, qualities: Vec<Quality>) -> Self {
        self.qualities.insert(item_id.to_string(), qualities);
        self
    }

    pub(crate) fn without_metadata(mut self, item_id: &str) -> Self {
        self.missing_metadata.insert(item_id.to_string());
        self
    }

    pub(crate) fn with_stream_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.stream_ttl = Some(ttl);
        self
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_metadata(&self, item_id: &str) -> Result<TrackMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_metadata.contains(item_id) {
            return Err(Error::MetadataUnavailable {
                item_id: item_id.to_string(),
                reason: "region locked".into(),
            });
        }
        Ok(TrackMetadata {
            item_id: item_id.to_string(),
            provider: "mock".into(),
            title: format!("Track {item_id}"),
            artist: "Mock Artist".into(),
            ..Default::default()
        })
    }

    async fn get_stream_location(
        &self,
        item_id: &str,
        quality: Quality,
    ) -> Result<StreamLocation> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let offered = self
            .qualities
            .get(item_id)
            .is_none_or(|qualities| qualities.contains(&quality));
        if !offered {
            return Err(Error::QualityUnavailable {
                item_id: item_id.to_string(),
                quality,
            });
        }
        let ttl = self.stream_ttl.unwrap_or_else(|| chrono::Duration::minutes(10));
        Ok(StreamLocation {
            url: format!("mock://{item_id}/{quality}"),
            quality,
            expires_at: chrono::Utc::now() + ttl,
        })
    }
}

/// Fetcher serving deterministic bodies keyed by item id
pub(crate) struct MockFetcher {
    default_size: usize,
    sizes: HashMap<String, usize>,
    /// Content length to declare instead of the true size
    declared: HashMap<String, Option<u64>>,
    /// Remaining failures of `open` per item
    open_failures: Mutex<HashMap<String, u32>>,
    /// Remaining streams per item that break halfway through
    broken_streams: Mutex<HashMap<String, u32>>,
    chunk_delay: Duration,
    pub opens: AtomicUsize,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub(crate) fn new(default_size: usize) -> Self {
        Self {
            default_size,
            sizes: HashMap::new(),
            declared: HashMap::new(),
            open_failures: Mutex::new(HashMap::new()),
            broken_streams: Mutex::new(HashMap::new()),
            chunk_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_size(mut self, item_id: &str, size: usize) -> Self {
        self.sizes.insert(item_id.to_string(), size);
        self
    }

    pub(crate) fn declaring(mut self, item_id: &str, length: Option<u64>) -> Self {
        self.declared.insert(item_id.to_string(), length);
        self
    }

    pub(crate) fn failing_open(self, item_id: &str, times: u32) -> Self {
        self.open_failures
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
        self
    }

    pub(crate) fn breaking_streams(self, item_id: &str, times: u32) -> Self {
        self.broken_streams
            .lock()
            .unwrap()
            .insert(item_id.to_string(), times);
        self
    }

    pub(crate) fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub(crate) fn size_of(&self, item_id: &str) -> usize {
        self.sizes.get(item_id).copied().unwrap_or(self.default_size)
    }

    fn take_one(map: &Mutex<HashMap<String, u32>>, item_id: &str) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(item_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

fn item_id_of(location: &StreamLocation) -> String {
    location
        .url
        .trim_start_matches("mock://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn open(&self, location: &StreamLocation) -> Result<Box<dyn ContentStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let item_id = item_id_of(location);

        if Self::take_one(&self.open_failures, &item_id) {
            return Err(Error::network("connection reset by peer"));
        }

        let data = body(self.size_of(&item_id));
        let declared = self
            .declared
            .get(&item_id)
            .copied()
            .unwrap_or(Some(data.len() as u64));
        let break_at = Self::take_one(&self.broken_streams, &item_id).then_some(data.len() / 2);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        Ok(Box::new(MockStream {
            data,
            pos: 0,
            declared,
            break_at,
            delay: self.chunk_delay,
            active: Arc::clone(&self.active),
        }))
    }
}

struct MockStream {
    data: Vec<u8>,
    pos: usize,
    declared: Option<u64>,
    break_at: Option<usize>,
    delay: Duration,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentStream for MockStream {
    fn content_length(&self) -> Option<u64> {
        self.declared
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.break_at.is_some_and(|at| self.pos >= at) {
            return Err(Error::network("stream interrupted"));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let end = (self.pos + max_len).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(chunk))
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Progress sink recording every update, optionally slow
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub updates: Mutex<Vec<ProgressUpdate>>,
    delay: Duration,
}

impl RecordingSink {
    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            delay,
        }
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn on_progress(&self, update: ProgressUpdate) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.updates.lock().unwrap().push(update);
    }
}
