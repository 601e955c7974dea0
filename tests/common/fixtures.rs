//! In-memory provider and fetcher fixtures

use async_trait::async_trait;
use media_dl::{
    BatchJob, Config, ContentFetcher, ContentStream, DownloadEngine, DownloadItem, Error,
    ProviderClient, Quality, Result, StreamLocation, TrackMetadata,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Config tuned for fast tests: small chunks, millisecond retries
pub fn fast_config(max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.download.max_concurrent_downloads = max_concurrent;
    config.download.chunk_size_bytes = 4096;
    config.download.memory_budget_bytes = 256 * 1024;
    config.rate_limit.max_requests = 10_000;
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

/// Engine backed by [`CatalogProvider`] and [`CatalogFetcher`], writing into a temp dir
pub fn engine_with(
    mut config: Config,
    provider: Arc<CatalogProvider>,
    fetcher: Arc<CatalogFetcher>,
) -> (DownloadEngine, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    config.download.download_dir = dir.path().join("downloads");
    let engine = DownloadEngine::new(config, provider)
        .unwrap()
        .with_fetcher(fetcher);
    (engine, dir)
}

/// Batch of tracks `1..=count` working inside `root/<name>`
pub fn album_job(root: &Path, name: &str, count: usize) -> BatchJob {
    (1..=count).fold(BatchJob::new(name, root.join(name)), |job, n| {
        job.with_item(DownloadItem::new(
            n.to_string(),
            "catalog",
            Quality::Lossless,
            "{tracknumber} {title}",
        ))
    })
}

/// Deterministic content for a track
pub fn track_bytes(item_id: &str, len: usize) -> Vec<u8> {
    let seed = item_id.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Provider with one numbered track per item id
#[derive(Default)]
pub struct CatalogProvider {
    pub metadata_calls: AtomicUsize,
}

#[async_trait]
impl ProviderClient for CatalogProvider {
    fn name(&self) -> &str {
        "catalog"
    }

    async fn get_metadata(&self, item_id: &str) -> Result<TrackMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TrackMetadata {
            item_id: item_id.to_string(),
            provider: "catalog".into(),
            title: format!("Song {item_id}"),
            artist: "Catalog Band".into(),
            album: Some("Catalog Album".into()),
            track_number: item_id.parse().ok(),
            ..Default::default()
        })
    }

    async fn get_stream_location(
        &self,
        item_id: &str,
        quality: Quality,
    ) -> Result<StreamLocation> {
        Ok(StreamLocation {
            url: format!("catalog://{item_id}"),
            quality,
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
        })
    }
}

/// Fetcher serving [`track_bytes`]; listed items always fail with network errors
pub struct CatalogFetcher {
    track_len: usize,
    broken: HashSet<String>,
    chunk_delay: Duration,
    pub opens: AtomicUsize,
    active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
}

impl CatalogFetcher {
    pub fn new(track_len: usize) -> Self {
        Self {
            track_len,
            broken: HashSet::new(),
            chunk_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always_failing(mut self, item_ids: &[&str]) -> Self {
        self.broken = item_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl ContentFetcher for CatalogFetcher {
    async fn open(&self, location: &StreamLocation) -> Result<Box<dyn ContentStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let item_id = location.url.trim_start_matches("catalog://").to_string();
        if self.broken.contains(&item_id) {
            return Err(Error::network(format!("connection to cdn refused for {item_id}")));
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        Ok(Box::new(CatalogStream {
            data: track_bytes(&item_id, self.track_len),
            pos: 0,
            delay: self.chunk_delay,
            active: Arc::clone(&self.active),
        }))
    }
}

struct CatalogStream {
    data: Vec<u8>,
    pos: usize,
    delay: Duration,
    active: Arc<AtomicUsize>,
}

#[async_trait]
impl ContentStream for CatalogStream {
    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        if self.pos >= self.data.len() {
            return Ok(None);
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

impl Drop for CatalogStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
