//! Provider-facing abstractions
//!
//! The engine never talks to a streaming service directly. It resolves
//! metadata and signed stream locations through a [`ProviderClient`], reads the
//! bytes through a [`ContentFetcher`] and reports progress to a
//! [`ProgressSink`]. Tests substitute in-memory implementations of all three.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{ProgressUpdate, Quality, StreamLocation, TrackMetadata};

/// A streaming service the pipeline can download from
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider tag used in cache keys (e.g., "tidal")
    fn name(&self) -> &str;

    /// Fetch descriptive metadata, or [`Error::MetadataUnavailable`]
    async fn get_metadata(&self, item_id: &str) -> Result<TrackMetadata>;

    /// Resolve a signed stream location at exactly `quality`
    ///
    /// Returns [`Error::QualityUnavailable`] when the item is not offered at
    /// that quality; the engine then tries the next lower one.
    async fn get_stream_location(&self, item_id: &str, quality: Quality)
        -> Result<StreamLocation>;
}

/// An open content body, read in bounded chunks
#[async_trait]
pub trait ContentStream: Send {
    /// Length declared by the server, if any
    fn content_length(&self) -> Option<u64>;

    /// Next piece of the body, at most `max_len` bytes; `None` at end of stream
    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>>;
}

/// Opens content streams for resolved locations
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Start reading the body behind `location`
    async fn open(&self, location: &StreamLocation) -> Result<Box<dyn ContentStream>>;
}

/// Receives throttled progress reports
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called at most once per progress interval per transfer
    async fn on_progress(&self, update: ProgressUpdate);
}

/// Progress sink that discards every update
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn on_progress(&self, _update: ProgressUpdate) {}
}

/// [`ContentFetcher`] backed by a reqwest client
///
/// Non-success statuses become [`Error::Http`] so that retry classification
/// sees the status code: 5xx, 408 and 429 are retried, other 4xx are fatal.
#[derive(Clone, Debug)]
pub struct HttpContentFetcher {
    client: reqwest::Client,
}

impl HttpContentFetcher {
    /// Create a fetcher with a fresh client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("media-dl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn open(&self, location: &StreamLocation) -> Result<Box<dyn ContentStream>> {
        let url = url::Url::parse(&location.url)
            .map_err(|e| Error::Other(format!("invalid stream url '{}': {}", location.url, e)))?;

        let response = self.client.get(url).send().await?.error_for_status()?;
        tracing::debug!(
            status = %response.status(),
            content_length = ?response.content_length(),
            "content stream opened"
        );

        Ok(Box::new(HttpContentStream {
            response,
            pending: Vec::new(),
        }))
    }
}

/// Body of an HTTP response, re-chunked to the caller's chunk size
struct HttpContentStream {
    response: reqwest::Response,
    /// Bytes received from the network but not yet handed out
    pending: Vec<u8>,
}

#[async_trait]
impl ContentStream for HttpContentStream {
    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        let max_len = max_len.max(1);
        if self.pending.is_empty() {
            match self.response.chunk().await? {
                Some(bytes) => self.pending.extend_from_slice(&bytes),
                None => return Ok(None),
            }
        }

        if self.pending.len() <= max_len {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        let rest = self.pending.split_off(max_len);
        Ok(Some(std::mem::replace(&mut self.pending, rest)))
    }
}
