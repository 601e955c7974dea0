//! Tests for the download engine.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    MockFetcher, MockProvider, RecordingSink, body, create_test_engine, item, test_config,
};
use crate::error::Error;
use crate::retry::IsRetryable;
use crate::types::{Event, ItemState, Quality};

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn files_under(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

// -----------------------------------------------------------------------
// Happy path and naming
// -----------------------------------------------------------------------

#[tokio::test]
async fn fetch_writes_content_under_rendered_name() {
    let provider = Arc::new(MockProvider::new());
    let fetcher = Arc::new(MockFetcher::new(10_000));
    let (engine, dir) = create_test_engine(test_config(), provider, fetcher);
    let mut events = engine.subscribe();

    let path = engine
        .fetch(item("1"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        path,
        dir.path().join("downloads").join("Track 1 - Mock Artist.flac")
    );
    assert_eq!(std::fs::read(&path).unwrap(), body(10_000));

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(Event::ItemQueued { item_id }) if item_id == "1"));
    assert!(matches!(events.last(), Some(Event::ItemComplete { path: p, .. }) if *p == path));
}

#[tokio::test]
async fn engine_items_use_provider_and_default_quality() {
    let mut config = test_config();
    config.download.default_quality = Quality::High;
    let provider = Arc::new(MockProvider::new());
    let (engine, _dir) = create_test_engine(
        config,
        Arc::clone(&provider),
        Arc::new(MockFetcher::new(100)),
    );

    let built = engine.item("9", "");
    assert_eq!(built.provider, "mock");
    assert_eq!(built.quality, Quality::High);
    assert_eq!(built.state, ItemState::Pending);

    let path = engine
        .fetch(built, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("m4a"));
    assert_eq!(provider.stream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn item_for_another_provider_fails_without_provider_calls() {
    let provider = Arc::new(MockProvider::new());
    let fetcher = Arc::new(MockFetcher::new(100));
    let (engine, dir) = create_test_engine(
        test_config(),
        Arc::clone(&provider),
        Arc::clone(&fetcher),
    );
    let mut events = engine.subscribe();

    let mut foreign = item("1");
    foreign.provider = "qobuz".into();
    let err = engine
        .fetch(foreign, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        &err,
        Error::ProviderMismatch { requested, served, .. } if requested == "qobuz" && served == "mock"
    ));
    assert_eq!(err.code(), "provider_mismatch");
    assert!(!err.is_retryable());
    assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 0);
    assert!(engine.cache().is_empty(), "nothing cached under the wrong provider");
    assert!(files_under(&dir.path().join("downloads")).is_empty());
    let failed = drain(&mut events)
        .into_iter()
        .any(|e| matches!(e, Event::ItemFailed { item_id, .. } if item_id == "1"));
    assert!(failed);
}

#[tokio::test]
async fn empty_template_falls_back_to_configured_track_template() {
    let mut config = test_config();
    config.download.track_name_template = "{artist}/{title}".into();
    let (engine, dir) = create_test_engine(
        config,
        Arc::new(MockProvider::new()),
        Arc::new(MockFetcher::new(100)),
    );

    let mut untemplated = item("2");
    untemplated.path_template = String::new();
    let path = engine
        .fetch(untemplated, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        path,
        dir.path()
            .join("downloads")
            .join("Mock Artist")
            .join("Track 2.flac")
    );
}

#[tokio::test]
async fn second_fetch_of_same_item_is_renamed_and_served_from_cache() {
    let provider = Arc::new(MockProvider::new());
    let (engine, dir) = create_test_engine(
        test_config(),
        provider.clone(),
        Arc::new(MockFetcher::new(100)),
    );
    let cancel = CancellationToken::new();

    let first = engine.fetch(item("5"), &cancel).await.unwrap();
    let second = engine.fetch(item("5"), &cancel).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(
        second,
        dir.path().join("downloads").join("Track 5 - Mock Artist (1).flac")
    );
    assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.stream_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.cache().len(), 2, "metadata and stream entries cached");
}

#[tokio::test]
async fn expired_stream_locations_are_not_cached() {
    let provider = Arc::new(MockProvider::new().with_stream_ttl(chrono::Duration::seconds(-1)));
    let (engine, _dir) = create_test_engine(
        test_config(),
        provider.clone(),
        Arc::new(MockFetcher::new(100)),
    );
    let cancel = CancellationToken::new();

    engine.fetch(item("6"), &cancel).await.unwrap();
    engine.fetch(item("6"), &cancel).await.unwrap();

    assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.stream_calls.load(Ordering::SeqCst), 2);
}

// -----------------------------------------------------------------------
// Quality fallback
// -----------------------------------------------------------------------

#[tokio::test]
async fn falls_back_to_highest_offered_quality() {
    let provider = Arc::new(MockProvider::new().offering("7", vec![Quality::High, Quality::Low]));
    let (engine, _dir) = create_test_engine(
        test_config(),
        provider.clone(),
        Arc::new(MockFetcher::new(100)),
    );
    let mut events = engine.subscribe();

    let path = engine
        .fetch(item("7"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("m4a"));
    assert_eq!(
        provider.stream_calls.load(Ordering::SeqCst),
        3,
        "hi_res, lossless, then high"
    );
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        Event::QualityFallback {
            requested: Quality::HiRes,
            resolved: Quality::High,
            ..
        }
    )));
}

#[tokio::test]
async fn exhausted_chain_is_no_stream_available() {
    let provider = Arc::new(MockProvider::new().offering("8", vec![]));
    let (engine, dir) = create_test_engine(
        test_config(),
        provider.clone(),
        Arc::new(MockFetcher::new(100)),
    );

    let err = engine
        .fetch(item("8"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::NoStreamAvailable { requested: Quality::HiRes, .. }
    ));
    assert_eq!(
        provider.stream_calls.load(Ordering::SeqCst),
        4,
        "each quality tried once, no retries"
    );
    assert!(files_under(dir.path()).is_empty());
}

// -----------------------------------------------------------------------
// Fatal errors
// -----------------------------------------------------------------------

#[tokio::test]
async fn missing_metadata_fails_without_retry() {
    let provider = Arc::new(MockProvider::new().without_metadata("9"));
    let fetcher = Arc::new(MockFetcher::new(100));
    let (engine, _dir) = create_test_engine(test_config(), provider.clone(), fetcher.clone());
    let mut events = engine.subscribe();

    let err = engine
        .fetch(item("9"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "metadata_unavailable");
    assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 0);
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::ItemFailed { item_id, .. } if item_id == "9"))
    );
}

#[tokio::test]
async fn declared_size_over_ceiling_is_rejected_before_writing() {
    let mut config = test_config();
    config.download.max_file_size_bytes = 4096;
    let fetcher = Arc::new(MockFetcher::new(10_000));
    let (engine, dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher.clone());

    let err = engine
        .fetch(item("10"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::SizeLimitExceeded { size, limit } => {
            assert_eq!(size, 10_000);
            assert_eq!(limit, 4096);
        }
        other => panic!("expected SizeLimitExceeded, got {other:?}"),
    }
    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 1, "size errors are not retried");
    assert!(files_under(dir.path()).is_empty());
}

#[tokio::test]
async fn undeclared_oversize_is_aborted_mid_stream_and_cleaned_up() {
    let mut config = test_config();
    config.download.max_file_size_bytes = 4096;
    let fetcher = Arc::new(MockFetcher::new(10_000).declaring("11", None));
    let (engine, dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher);

    let err = engine
        .fetch(item("11"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SizeLimitExceeded { limit: 4096, .. }));
    assert!(
        files_under(dir.path()).is_empty(),
        "partial file must be deleted"
    );
    assert_eq!(engine.memory_guard().in_use(), 0);
}

// -----------------------------------------------------------------------
// Retries
// -----------------------------------------------------------------------

#[tokio::test]
async fn transient_open_failures_are_retried() {
    let fetcher = Arc::new(MockFetcher::new(2048).failing_open("12", 2));
    let (engine, _dir) = create_test_engine(test_config(), Arc::new(MockProvider::new()), fetcher.clone());

    let path = engine
        .fetch(item("12"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read(path).unwrap(), body(2048));
}

#[tokio::test]
async fn persistent_network_failure_exhausts_retries() {
    let fetcher = Arc::new(MockFetcher::new(2048).failing_open("13", u32::MAX));
    let config = test_config();
    let retries = config.retry.max_attempts as usize;
    let (engine, dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher.clone());

    let err = engine
        .fetch(item("13"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "network_error");
    assert!(err.is_retryable());
    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 1 + retries);
    assert!(files_under(dir.path()).is_empty());
    assert_eq!(engine.active_downloads(), 0, "slot released after failure");
}

#[tokio::test]
async fn interrupted_stream_restarts_from_scratch() {
    let fetcher = Arc::new(MockFetcher::new(8192).breaking_streams("14", 1));
    let (engine, dir) = create_test_engine(test_config(), Arc::new(MockProvider::new()), fetcher.clone());

    let path = engine
        .fetch(item("14"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetcher.opens.load(Ordering::SeqCst), 2);
    assert_eq!(
        std::fs::read(&path).unwrap(),
        body(8192),
        "retry must not append to the partial output"
    );
    assert_eq!(
        files_under(dir.path()),
        vec![path],
        "the partial file from the first attempt was removed"
    );
}

// -----------------------------------------------------------------------
// Resource bounds
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn never_more_than_max_concurrent_transfers() {
    let mut config = test_config();
    config.download.max_concurrent_downloads = 2;
    let fetcher = Arc::new(MockFetcher::new(4096).with_chunk_delay(Duration::from_millis(20)));
    let (engine, _dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher.clone());
    let cancel = CancellationToken::new();

    let fetches = (0..6).map(|i| {
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.fetch(item(&i.to_string()), &cancel).await }
    });
    let results = futures::future::join_all(fetches).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(fetcher.max_active.load(Ordering::SeqCst), 2);
    assert_eq!(engine.active_downloads(), 0);
}

#[tokio::test]
async fn memory_reservations_are_released_after_transfer() {
    let (engine, _dir) = create_test_engine(
        test_config(),
        Arc::new(MockProvider::new()),
        Arc::new(MockFetcher::new(20_000)),
    );

    engine
        .fetch(item("15"), &CancellationToken::new())
        .await
        .unwrap();

    let guard = engine.memory_guard();
    assert_eq!(guard.in_use(), 0);
    assert_eq!(guard.available(), guard.budget());
}

#[tokio::test(start_paused = true)]
async fn rate_limit_timeout_surfaces_as_item_failure() {
    let mut config = test_config();
    config.rate_limit.max_requests = 1;
    config.rate_limit.burst_allowance = 0;
    config.rate_limit.max_wait = Duration::from_secs(2);
    let (engine, _dir) = create_test_engine(
        config,
        Arc::new(MockProvider::new()),
        Arc::new(MockFetcher::new(100)),
    );
    let cancel = CancellationToken::new();

    engine.fetch(item("16"), &cancel).await.unwrap();
    let err = engine.fetch(item("17"), &cancel).await.unwrap_err();

    assert!(matches!(err, Error::RateLimitTimeout { .. }));
}

// -----------------------------------------------------------------------
// Cancellation
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_removes_partial_output_and_releases_resources() {
    let fetcher = Arc::new(MockFetcher::new(64 * 1024).with_chunk_delay(Duration::from_secs(1)));
    let (engine, dir) = create_test_engine(test_config(), Arc::new(MockProvider::new()), fetcher);
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5500)).await;
        canceller.cancel();
    });

    let err = engine.fetch(item("18"), &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(files_under(dir.path()).is_empty());
    assert_eq!(engine.active_downloads(), 0);
    assert_eq!(engine.memory_guard().in_use(), 0);
}

#[tokio::test]
async fn already_cancelled_token_fails_before_any_request() {
    let provider = Arc::new(MockProvider::new());
    let (engine, _dir) = create_test_engine(
        test_config(),
        provider.clone(),
        Arc::new(MockFetcher::new(100)),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine.fetch(item("19"), &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 0);
}

// -----------------------------------------------------------------------
// Progress reporting
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn progress_is_throttled_to_the_update_interval() {
    let mut config = test_config();
    config.download.progress_update_interval = Duration::from_secs(2);
    let sink = Arc::new(RecordingSink::default());
    let fetcher = Arc::new(MockFetcher::new(10 * 1024).with_chunk_delay(Duration::from_secs(1)));
    let (engine, _dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher);
    let engine = engine.with_progress_sink(sink.clone());
    let mut events = engine.subscribe();

    engine
        .fetch(item("20"), &CancellationToken::new())
        .await
        .unwrap();

    let updates = sink.updates.lock().unwrap().clone();
    assert!(
        (4..=5).contains(&updates.len()),
        "10 one-second chunks at a 2s interval, got {}",
        updates.len()
    );
    assert!(updates.windows(2).all(|w| w[0].bytes_done < w[1].bytes_done));
    assert!(updates.iter().all(|u| u.bytes_total == Some(10 * 1024)));

    let progress_events = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, Event::Downloading(_)))
        .count();
    assert_eq!(progress_events, updates.len());
}

#[tokio::test(start_paused = true)]
async fn slow_progress_sink_never_stalls_the_transfer() {
    let mut config = test_config();
    config.download.progress_update_interval = Duration::from_secs(1);
    let sink = Arc::new(RecordingSink::slow(Duration::from_secs(3600)));
    let fetcher = Arc::new(MockFetcher::new(3 * 1024).with_chunk_delay(Duration::from_secs(2)));
    let (engine, _dir) = create_test_engine(config, Arc::new(MockProvider::new()), fetcher);
    let engine = engine.with_progress_sink(sink.clone());

    let start = tokio::time::Instant::now();
    engine
        .fetch(item("21"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(60));
    assert!(
        sink.updates.lock().unwrap().is_empty(),
        "every sink call was abandoned"
    );
}

// -----------------------------------------------------------------------
// Item state bookkeeping
// -----------------------------------------------------------------------

#[test]
fn fetch_starts_from_pending_items_only() {
    let fresh = item("22");
    assert_eq!(fresh.state, ItemState::Pending);
    assert!(fresh.state.can_transition_to(ItemState::Fetching));
}
