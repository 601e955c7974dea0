//! Metadata and stream location resolution through the cache.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{DownloadEngine, until_cancelled};
use crate::cache::{MetadataCache, metadata_key, stream_key};
use crate::error::{Error, Result};
use crate::types::{Event, Quality, StreamLocation, TrackMetadata};

/// Value stored in the engine cache
///
/// Both kinds share one cache so that `cache_max_entries` bounds them together.
#[derive(Clone, Debug, PartialEq)]
pub enum CachedPayload {
    /// Result of `ProviderClient::get_metadata`
    Metadata(TrackMetadata),
    /// Result of `ProviderClient::get_stream_location`
    Stream(StreamLocation),
}

/// Cache type used by the engine
pub type EngineCache = MetadataCache<CachedPayload>;

impl DownloadEngine {
    /// Provider metadata for `item_id`, from the cache when possible
    pub(crate) async fn resolve_metadata(
        &self,
        item_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TrackMetadata> {
        let key = metadata_key(self.provider.name(), item_id);
        let ttl = self.cache.default_ttl();

        let payload = self
            .cache
            .get_or_try_insert_with(&key, ttl, || async {
                tracing::debug!(item_id, "fetching metadata from provider");
                let metadata =
                    until_cancelled(cancel, self.provider.get_metadata(item_id)).await?;
                Ok::<_, Error>(CachedPayload::Metadata(metadata))
            })
            .await?;

        match payload {
            CachedPayload::Metadata(metadata) => Ok(metadata),
            CachedPayload::Stream(_) => Err(Error::Other(format!(
                "cache entry '{key}' holds a stream location, expected metadata"
            ))),
        }
    }

    /// Stream location for the best available quality at or below `requested`
    ///
    /// `QualityUnavailable` moves on to the next lower quality; any other error
    /// ends the search. A resolved location is cached until it expires, or for
    /// the cache TTL if that is shorter.
    pub(crate) async fn resolve_stream(
        &self,
        item_id: &str,
        requested: Quality,
        cancel: &CancellationToken,
    ) -> Result<StreamLocation> {
        let provider = self.provider.name();

        for quality in requested.fallback_chain() {
            let key = stream_key(provider, item_id, quality);

            let location = match self.cache.get(&key) {
                Some(CachedPayload::Stream(location))
                    if !location.remaining_validity().is_zero() =>
                {
                    tracing::trace!(item_id, %quality, "stream location cache hit");
                    location
                }
                _ => {
                    let lookup = self.provider.get_stream_location(item_id, quality);
                    match until_cancelled(cancel, lookup).await {
                        Ok(location) => {
                            let ttl = self.stream_ttl(&location);
                            self.cache
                                .set_with_ttl(key, CachedPayload::Stream(location.clone()), ttl);
                            location
                        }
                        Err(Error::QualityUnavailable { .. }) => {
                            tracing::debug!(item_id, %quality, "quality unavailable, trying lower");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            if quality != requested {
                tracing::info!(item_id, %requested, resolved = %quality, "quality fallback");
                self.emit_event(Event::QualityFallback {
                    item_id: item_id.to_string(),
                    requested,
                    resolved: quality,
                });
            }
            return Ok(location);
        }

        Err(Error::NoStreamAvailable {
            item_id: item_id.to_string(),
            requested,
        })
    }

    fn stream_ttl(&self, location: &StreamLocation) -> Duration {
        self.cache.default_ttl().min(location.remaining_validity())
    }
}
