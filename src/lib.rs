//! # media-dl
//!
//! Concurrent media download pipeline for streaming-service providers.
//!
//! ## Design Philosophy
//!
//! media-dl is designed to be:
//! - **Provider-agnostic** - Services plug in through the [`ProviderClient`] trait
//! - **Resource-bounded** - Concurrency, request rate and buffered bytes all have global ceilings
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! A [`BatchOrchestrator`] takes a [`BatchJob`] (album, playlist, artist),
//! fetches every item through the shared [`DownloadEngine`] and packs the
//! results into split zip segments with the [`Archiver`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use media_dl::{
//!     BatchJob, BatchOrchestrator, Config, DownloadEngine, DownloadItem, ProviderClient, Quality,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(provider: Arc<dyn ProviderClient>) -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(Config::default(), provider)?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let cancel = CancellationToken::new();
//!     media_dl::cancel_on_shutdown_signal(cancel.clone());
//!
//!     let job = BatchJob::new("Kind of Blue", "./downloads/kind-of-blue")
//!         .with_item(DownloadItem::new("1001", "tidal", Quality::HiRes, "{tracknumber} {title}"));
//!     let report = BatchOrchestrator::new(engine).run(job, &cancel).await?;
//!     println!("{} ok, {} failed", report.successes.len(), report.failures.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Split zip packaging
pub mod archive;
/// Metadata cache
pub mod cache;
/// Configuration types
pub mod config;
/// Download engine
pub mod downloader;
/// Error types
pub mod error;
/// In-flight memory budget
pub mod memory_guard;
/// Output file naming
pub mod naming;
/// Batch orchestration
pub mod orchestrator;
/// Provider, content and progress traits
pub mod provider;
/// Request rate limiting
pub mod rate_limiter;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types
pub mod types;

// Re-export commonly used types
pub use archive::{ArchiveSegment, Archiver};
pub use cache::MetadataCache;
pub use config::{Config, FileCollisionAction};
pub use downloader::{CachedPayload, DownloadEngine, EngineCache};
pub use error::{Error, FailureRecord, Result};
pub use memory_guard::{MemoryGuard, MemoryReservation};
pub use naming::FileNamer;
pub use orchestrator::BatchOrchestrator;
pub use provider::{
    ContentFetcher, ContentStream, HttpContentFetcher, NoopProgressSink, ProgressSink,
    ProviderClient,
};
pub use rate_limiter::RateLimiter;
pub use types::{
    BatchJob, BatchReport, DownloadItem, Event, ItemState, ItemSuccess, ProgressUpdate, Quality,
    StreamLocation, TrackMetadata,
};

/// Cancel `token` when the process receives a termination signal.
///
/// - **Unix:** listens for SIGTERM and SIGINT, falling back to Ctrl+C if registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// The listener stops on its own once `token` is cancelled for another reason.
pub fn cancel_on_shutdown_signal(
    token: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::info!("shutdown signal received, cancelling in-flight work");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        std::future::pending::<()>().await;
    }
}
