//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! Delays grow as `initial_delay * backoff_multiplier^attempt`, are capped at
//! `max_delay`, and optionally carry jitter to prevent thundering herd.
//! Waiting between attempts is cancellable.
//!
//! # Example
//!
//! ```no_run
//! use media_dl::retry::{IsRetryable, download_with_retry};
//! use media_dl::config::RetryConfig;
//! use media_dl::error::Error;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let result = download_with_retry(&config, &cancel, |_attempt| async {
//!     // Your operation here
//!     Ok::<_, Error>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset, server busy) should return `true`.
/// Permanent failures (missing metadata, size ceiling, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Implementation of IsRetryable for our Error type
impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Provider and stream network failures are transient by definition
            Error::Network(_) => true,
            // HTTP client errors: connection-level failures and server-side statuses
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    return status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || status == reqwest::StatusCode::REQUEST_TIMEOUT;
                }
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
            }
            // I/O errors can be retryable in some cases
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            // Handled by quality fallback, never by retry
            Error::QualityUnavailable { .. } => false,
            Error::NoStreamAvailable { .. } => false,
            // Fatal for the item
            Error::MetadataUnavailable { .. } => false,
            Error::ProviderMismatch { .. } => false,
            Error::SizeLimitExceeded { .. } => false,
            // Surfaced to the caller instead of waiting again
            Error::RateLimitTimeout { .. } => false,
            // Archive failures abort the batch
            Error::ArchiveWrite { .. } => false,
            Error::Cancelled => false,
            Error::InvalidTransition { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            // Unknown errors - be conservative and don't retry
            Error::Other(_) => false,
        }
    }
}

/// Delay before retry number `attempt` (0-based), capped at `max_delay`, without jitter
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let secs = config.initial_delay.as_secs_f64() * factor;
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation receives the 0-based attempt number. It is called once, then
/// again after each retryable failure until `config.max_attempts` retries have
/// been spent. Cancellation during a backoff sleep ends the loop with
/// [`Error::Cancelled`].
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn download_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display + From<Error>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                // Calculate jittered delay
                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                // Wait before retrying
                tokio::select! {
                    _ = tokio::time::sleep(jittered_delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::debug!(attempt, "Retry wait cancelled");
                        return Err(Error::Cancelled.into());
                    }
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result is uniformly distributed between `delay / 2` and `delay`, so a
/// jittered sleep never exceeds the capped backoff.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.5..=1.0);
    delay.mul_f64(jitter_factor).min(delay)
}
