//! Chunked streaming of content to disk under the memory budget.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DownloadEngine, until_cancelled};
use crate::config::FileCollisionAction;
use crate::error::{Error, Result};
use crate::naming::get_unique_path;
use crate::provider::ContentStream;
use crate::types::{Event, ProgressUpdate};

/// Longest a progress sink may take before its report is abandoned
const PROGRESS_SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts at claiming a free output name when concurrent items collide
const CREATE_ATTEMPTS: u32 = 16;

/// Decides when a transfer is due for a progress report
pub(crate) struct ProgressThrottle {
    item_id: String,
    bytes_total: Option<u64>,
    interval: Duration,
    started: Instant,
    last_report: Instant,
}

impl ProgressThrottle {
    pub(crate) fn new(item_id: &str, bytes_total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            item_id: item_id.to_string(),
            bytes_total,
            interval,
            started: now,
            last_report: now,
        }
    }

    /// A snapshot if at least one interval passed since the last report
    pub(crate) fn tick(&mut self, bytes_done: u64) -> Option<ProgressUpdate> {
        let now = Instant::now();
        if now.duration_since(self.last_report) < self.interval {
            return None;
        }
        self.last_report = now;

        let elapsed = now.duration_since(self.started);
        let secs = elapsed.as_secs_f64();
        let speed_bps = if secs > 0.0 {
            (bytes_done as f64 / secs) as u64
        } else {
            0
        };

        Some(ProgressUpdate {
            item_id: self.item_id.clone(),
            bytes_done,
            bytes_total: self.bytes_total,
            speed_bps,
            elapsed,
        })
    }
}

/// Create the output file, claiming a fresh name if another item took it first
pub(crate) async fn create_output(
    path: &Path,
    action: FileCollisionAction,
) -> Result<(PathBuf, File)> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create directory '{}': {}", parent.display(), e),
            ))
        })?;
    }

    for _ in 0..CREATE_ATTEMPTS {
        let candidate = get_unique_path(path, action)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        match action {
            FileCollisionAction::Overwrite => options.create(true).truncate(true),
            FileCollisionAction::Rename | FileCollisionAction::Skip => options.create_new(true),
        };

        match options.open(&candidate).await {
            Ok(file) => return Ok((candidate, file)),
            Err(e)
                if e.kind() == std::io::ErrorKind::AlreadyExists
                    && action == FileCollisionAction::Rename =>
            {
                continue;
            }
            Err(e) => {
                return Err(Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create '{}': {}", candidate.display(), e),
                )));
            }
        }
    }

    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("could not claim an output name for '{}'", path.display()),
    )))
}

/// Remove a partial output file, ignoring a file that was never created
pub(crate) async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output")
        }
    }
}

impl DownloadEngine {
    /// Stream `stream` into `file`, returning the number of bytes written
    ///
    /// Each chunk is reserved against the memory guard before it is read and
    /// released once it has been written and flushed.
    pub(crate) async fn stream_to_file(
        &self,
        item_id: &str,
        mut stream: Box<dyn ContentStream>,
        file: &mut File,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let chunk_size = self.config.download.chunk_size_bytes;
        let limit = self.config.download.max_file_size_bytes;
        let mut progress = ProgressThrottle::new(
            item_id,
            stream.content_length(),
            self.config.download.progress_update_interval,
        );
        let mut written: u64 = 0;

        loop {
            let reservation = until_cancelled(cancel, self.memory_guard.reserve(chunk_size)).await?;
            let Some(chunk) = until_cancelled(cancel, stream.next_chunk(chunk_size)).await? else {
                break;
            };

            written += chunk.len() as u64;
            if written > limit {
                tracing::warn!(item_id, written, limit, "size ceiling exceeded mid-stream");
                return Err(Error::SizeLimitExceeded {
                    size: written,
                    limit,
                });
            }

            until_cancelled(cancel, async {
                file.write_all(&chunk).await?;
                file.flush().await?;
                Ok::<(), Error>(())
            })
            .await?;
            drop(chunk);
            reservation.release();

            if let Some(update) = progress.tick(written) {
                self.report_progress(update).await;
            }
        }

        file.sync_all().await?;
        Ok(written)
    }

    /// Publish a progress update to subscribers and the progress sink
    async fn report_progress(&self, update: ProgressUpdate) {
        tracing::debug!(
            item_id = %update.item_id,
            bytes_done = update.bytes_done,
            speed_bps = update.speed_bps,
            "download progress"
        );
        self.emit_event(Event::Downloading(update.clone()));

        let item_id = update.item_id.clone();
        if tokio::time::timeout(PROGRESS_SINK_TIMEOUT, self.progress_sink.on_progress(update))
            .await
            .is_err()
        {
            tracing::warn!(
                item_id = %item_id,
                timeout_ms = PROGRESS_SINK_TIMEOUT.as_millis(),
                "progress sink timed out, update dropped"
            );
        }
    }
}
