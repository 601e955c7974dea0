//! Batch orchestration: fan out item downloads, then package the results.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::archive::Archiver;
use crate::downloader::DownloadEngine;
use crate::error::{Error, FailureRecord, Result};
use crate::types::{BatchJob, BatchReport, Event, ItemSuccess};

/// Runs batch jobs (album, playlist, artist) through a shared [`DownloadEngine`]
///
/// The engine's semaphore is the only concurrency limit for item downloads;
/// packaging is bounded by the archiver's own semaphore.
#[derive(Clone)]
pub struct BatchOrchestrator {
    engine: DownloadEngine,
    archiver: Archiver,
}

impl BatchOrchestrator {
    /// Create an orchestrator with an archiver built from the engine's configuration
    ///
    /// Archive names collide the way item files do (`file_collision`).
    pub fn new(engine: DownloadEngine) -> Self {
        let config = engine.config();
        let archiver =
            Archiver::new(&config.archive).with_collision(config.download.file_collision);
        Self { engine, archiver }
    }

    /// Share an existing archiver (and its compression semaphore)
    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = archiver;
        self
    }

    /// The engine items are dispatched to
    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Download every item of `job`, then archive the successes
    ///
    /// Phases:
    /// 1. Create the working directory
    /// 2. Fetch all items concurrently; a failed item never affects its siblings
    /// 3. If archiving is enabled and something succeeded, pack the raw files
    ///    into `<working_dir parent>/<job name>.zip[.partN]` and delete them
    /// 4. Emit `BatchComplete` and return the report
    ///
    /// Only a working-directory or archive failure fails the call itself; raw
    /// files are kept when archiving fails. After cancellation, unfinished
    /// items are reported with code `cancelled` and nothing is archived.
    pub async fn run(&self, job: BatchJob, cancel: &CancellationToken) -> Result<BatchReport> {
        let started = Instant::now();
        let BatchJob {
            name,
            working_dir,
            items,
        } = job;

        // Phase 1: Working directory
        tokio::fs::create_dir_all(&working_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create working directory '{}': {}",
                    working_dir.display(),
                    e
                ),
            ))
        })?;
        tracing::info!(batch = %name, items = items.len(), "batch started");

        // Phase 2: Fetch everything; join_all keeps submission order
        let fetches = items.into_iter().map(|item| {
            let item_id = item.item_id.clone();
            let working_dir = &working_dir;
            async move {
                let outcome = self.engine.fetch_into(item, working_dir, cancel).await;
                (item_id, outcome)
            }
        });
        let outcomes = join_all(fetches).await;

        let mut report = BatchReport {
            name: name.clone(),
            ..BatchReport::default()
        };
        for (item_id, outcome) in outcomes {
            match outcome {
                Ok(path) => report.successes.push(ItemSuccess { item_id, path }),
                Err(e) => report.failures.push(FailureRecord::new(item_id, &e)),
            }
        }

        // Phase 3: Package
        let config = self.engine.config();
        let archive = &config.archive;
        if cancel.is_cancelled() {
            tracing::info!(batch = %name, "batch cancelled, skipping archive");
        } else if archive.enabled && !report.successes.is_empty() {
            let raw: Vec<PathBuf> = report.successes.iter().map(|s| s.path.clone()).collect();
            let base = self.archive_base(&working_dir, &name);

            self.engine.emit_event(Event::Archiving {
                batch: name.clone(),
                files: raw.len(),
            });
            let segments = match self.archiver.pack(&raw, &base, archive.split_size_bytes).await {
                Ok(segments) => segments,
                Err(e) => {
                    tracing::error!(batch = %name, error = %e, "archiving failed, raw files kept");
                    return Err(e);
                }
            };

            remove_raw_files(&raw, &working_dir).await;
            report.archive_segments = segments.into_iter().map(|s| s.path).collect();
            self.engine.emit_event(Event::ArchiveComplete {
                batch: name.clone(),
                segments: report.archive_segments.clone(),
            });
        }

        // Phase 4: Report
        report.elapsed = started.elapsed();
        tracing::info!(
            batch = %name,
            succeeded = report.successes.len(),
            failed = report.failures.len(),
            segments = report.archive_segments.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "batch complete"
        );
        self.engine.emit_event(Event::BatchComplete {
            batch: name,
            succeeded: report.successes.len(),
            failed: report.failures.len(),
        });
        Ok(report)
    }

    fn archive_base(&self, working_dir: &Path, name: &str) -> PathBuf {
        let parent = working_dir.parent().unwrap_or(working_dir);
        parent.join(self.engine.namer.sanitize(name))
    }
}

/// Delete archived raw files and any directories they leave empty
async fn remove_raw_files(paths: &[PathBuf], working_dir: &Path) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete archived file");
            continue;
        }

        // Walk up to (and including) the working directory while empty
        let mut dir = path.parent();
        while let Some(current) = dir {
            if !current.starts_with(working_dir) || tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            if current == working_dir {
                break;
            }
            dir = current.parent();
        }
    }
}
