//! Download engine split into focused submodules.
//!
//! The `DownloadEngine` struct and its methods are organized by stage:
//! - [`task`] - Per-item lifecycle: admission, slot, retries, cleanup
//! - [`resolve`] - Metadata and stream location lookup with quality fallback
//! - [`transfer`] - Chunked streaming to disk under the memory budget

mod resolve;
mod task;
mod transfer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use resolve::{CachedPayload, EngineCache};

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use crate::cache::MetadataCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory_guard::MemoryGuard;
use crate::naming::FileNamer;
use crate::provider::{
    ContentFetcher, HttpContentFetcher, NoopProgressSink, ProgressSink, ProviderClient,
};
use crate::rate_limiter::RateLimiter;
use crate::types::{DownloadItem, Event};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Fetches single items from a provider to disk (cloneable - all fields are Arc-wrapped)
///
/// One engine is meant to be shared by every batch of the process: its
/// semaphore, rate limiter, cache and memory guard are the process-wide
/// resource bounds.
#[derive(Clone)]
pub struct DownloadEngine {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Metadata and stream location source
    pub(crate) provider: Arc<dyn ProviderClient>,
    /// Content byte source
    pub(crate) fetcher: Arc<dyn ContentFetcher>,
    /// Receives throttled progress reports
    pub(crate) progress_sink: Arc<dyn ProgressSink>,
    /// Global request limiter shared across all downloads
    pub(crate) rate_limiter: RateLimiter,
    /// Metadata and stream location cache
    pub(crate) cache: EngineCache,
    /// In-flight byte budget
    pub(crate) memory_guard: MemoryGuard,
    /// Semaphore to limit concurrent downloads (respects max_concurrent_downloads config)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Output path renderer
    pub(crate) namer: FileNamer,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
}

impl DownloadEngine {
    /// Create an engine with its own limiter, cache, memory guard and HTTP fetcher
    ///
    /// The configuration is validated first.
    pub fn new(config: Config, provider: Arc<dyn ProviderClient>) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let fetcher: Arc<dyn ContentFetcher> = Arc::new(HttpContentFetcher::new()?);

        tracing::info!(
            provider = provider.name(),
            max_concurrent = config.download.max_concurrent_downloads,
            max_requests = config.rate_limit.max_requests,
            memory_budget = config.download.memory_budget_bytes,
            "download engine initialized"
        );

        Ok(Self {
            rate_limiter: RateLimiter::new(&config.rate_limit),
            cache: MetadataCache::from_config(&config.cache),
            memory_guard: MemoryGuard::new(config.download.memory_budget_bytes),
            concurrent_limit: Arc::new(Semaphore::new(config.download.max_concurrent_downloads)),
            namer: FileNamer::new()?,
            config: Arc::new(config),
            provider,
            fetcher,
            progress_sink: Arc::new(NoopProgressSink),
            event_tx,
        })
    }

    /// Share an existing rate limiter (e.g., across engines for different providers)
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Share an existing cache
    pub fn with_cache(mut self, cache: EngineCache) -> Self {
        self.cache = cache;
        self
    }

    /// Share an existing memory guard
    pub fn with_memory_guard(mut self, guard: MemoryGuard) -> Self {
        self.memory_guard = guard;
        self
    }

    /// Replace the HTTP fetcher
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Receive progress reports
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = sink;
        self
    }

    /// A pending item for this engine's provider at the configured default quality
    ///
    /// An empty `path_template` uses the configured track template at fetch time.
    pub fn item(
        &self,
        item_id: impl Into<String>,
        path_template: impl Into<String>,
    ) -> DownloadItem {
        DownloadItem::new(
            item_id,
            self.provider.name(),
            self.config.download.default_quality,
            path_template,
        )
    }

    /// Subscribe to pipeline events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls more than 1000 events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Start the periodic purge of expired cache entries
    pub fn start_cache_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.cache
            .spawn_sweeper(self.config.cache.sweep_interval, cancel)
    }

    /// Current configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The shared rate limiter
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The shared metadata cache
    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    /// The shared memory guard
    pub fn memory_guard(&self) -> &MemoryGuard {
        &self.memory_guard
    }

    /// Number of items currently holding a download slot
    pub fn active_downloads(&self) -> usize {
        self.config
            .download
            .max_concurrent_downloads
            .saturating_sub(self.concurrent_limit.available_permits())
    }
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}
