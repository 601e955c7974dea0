//! Per-item download lifecycle.
//!
//! An item first waits for a rate-limit admission and a download slot, then
//! runs attempts under the retry policy while holding the slot. Partial output
//! never survives a failed attempt.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use super::transfer::{create_output, remove_partial};
use super::{DownloadEngine, until_cancelled};
use crate::error::{Error, Result};
use crate::retry::download_with_retry;
use crate::types::{DownloadItem, Event, ItemState};

/// Item state shared between retry attempts
///
/// The lock is only taken for state bookkeeping, never across an await.
struct ItemTracker {
    item: Mutex<DownloadItem>,
}

impl ItemTracker {
    fn new(item: DownloadItem) -> Self {
        Self {
            item: Mutex::new(item),
        }
    }

    fn with_item<R>(&self, f: impl FnOnce(&mut DownloadItem) -> R) -> R {
        let mut item = self.item.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut item)
    }

    fn snapshot(&self) -> DownloadItem {
        self.with_item(|item| item.clone())
    }

    fn transition(&self, next: ItemState) -> Result<()> {
        self.with_item(|item| item.transition(next))
    }

    fn set_expected_size(&self, size: Option<u64>) {
        self.with_item(|item| item.expected_size = size);
    }

    /// Mark the item failed unless it already reached a terminal state
    fn fail(&self) {
        self.with_item(|item| {
            if !item.state.is_terminal() {
                item.state = ItemState::Failed;
            }
        });
    }
}

impl DownloadEngine {
    /// Download `item` into the configured download directory
    ///
    /// See [`fetch_into`](Self::fetch_into).
    pub async fn fetch(&self, item: DownloadItem, cancel: &CancellationToken) -> Result<PathBuf> {
        let dest_dir = self.config.download.download_dir.clone();
        self.fetch_into(item, &dest_dir, cancel).await
    }

    /// Download `item` below `dest_dir` and return the written path
    ///
    /// The item's `path_template` (or the configured track template when it is
    /// empty) decides the relative path. Transient failures are retried with
    /// backoff; the final error is returned after `ItemFailed` is emitted.
    pub async fn fetch_into(
        &self,
        item: DownloadItem,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let item_id = item.item_id.clone();
        self.emit_event(Event::ItemQueued {
            item_id: item_id.clone(),
        });

        let tracker = ItemTracker::new(item);
        match self.run_item(&tracker, dest_dir, cancel).await {
            Ok(path) => {
                tracker.transition(ItemState::Completed)?;
                tracing::info!(item_id = %item_id, path = %path.display(), "item downloaded");
                self.emit_event(Event::ItemComplete {
                    item_id,
                    path: path.clone(),
                });
                Ok(path)
            }
            Err(e) => {
                tracker.fail();
                if matches!(e, Error::Cancelled) {
                    tracing::info!(item_id = %item_id, "item cancelled");
                } else {
                    tracing::error!(item_id = %item_id, error = %e, code = e.code(), "item failed");
                }
                self.emit_event(Event::ItemFailed {
                    item_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_item(
        &self,
        tracker: &ItemTracker,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let (item_id, requested) =
            tracker.with_item(|item| (item.item_id.clone(), item.provider.clone()));
        let served = self.provider.name();
        if requested != served {
            return Err(Error::ProviderMismatch {
                item_id,
                requested,
                served: served.to_string(),
            });
        }

        self.rate_limiter.wait(1, cancel).await?;

        // Held for every attempt of this item, released on any exit
        let _permit = until_cancelled(cancel, async {
            self.concurrent_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Other("download slots closed".into()))
        })
        .await?;
        tracker.transition(ItemState::Fetching)?;

        download_with_retry(&self.config.retry, cancel, move |attempt| {
            self.attempt(tracker, dest_dir, attempt, cancel)
        })
        .await
    }

    /// One try: resolve, open, name, stream
    async fn attempt(
        &self,
        tracker: &ItemTracker,
        dest_dir: &Path,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let item = tracker.snapshot();
        if attempt > 0 {
            if item.state == ItemState::Writing {
                tracker.transition(ItemState::Fetching)?;
            }
            self.rate_limiter.wait(1, cancel).await?;
            tracing::debug!(item_id = %item.item_id, attempt, "retrying item");
        }

        let metadata = self.resolve_metadata(&item.item_id, cancel).await?;
        let location = self
            .resolve_stream(&item.item_id, item.quality, cancel)
            .await?;

        let stream = until_cancelled(cancel, self.fetcher.open(&location)).await?;
        let declared = stream.content_length();
        tracker.set_expected_size(declared);

        let limit = self.config.download.max_file_size_bytes;
        match declared {
            Some(size) if size > limit => {
                tracing::warn!(item_id = %item.item_id, size, limit, "declared size exceeds ceiling");
                return Err(Error::SizeLimitExceeded { size, limit });
            }
            _ => {}
        }

        let template = if item.path_template.trim().is_empty() {
            self.config.download.track_name_template.as_str()
        } else {
            item.path_template.as_str()
        };
        let relative = self.namer.render(template, &metadata, location.quality);
        let (path, mut file) = create_output(
            &dest_dir.join(relative),
            self.config.download.file_collision,
        )
        .await?;
        tracker.transition(ItemState::Writing)?;

        match self
            .stream_to_file(&item.item_id, stream, &mut file, cancel)
            .await
        {
            Ok(bytes) => {
                tracing::debug!(item_id = %item.item_id, bytes, quality = %location.quality, "content written");
                Ok(path)
            }
            Err(e) => {
                drop(file);
                remove_partial(&path).await;
                Err(e)
            }
        }
    }
}
