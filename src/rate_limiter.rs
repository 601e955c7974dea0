//! Request rate limiting using a sliding window plus a burst token bucket
//!
//! The RateLimiter admits outbound provider requests across all concurrent
//! downloads. A request is admitted immediately while the number of requests in
//! the trailing window stays within `max_requests`; beyond that it may still be
//! admitted by spending burst tokens, which refill continuously at
//! `burst_allowance / window` per second.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

/// Rolling admission state, mutated only under the limiter's lock
#[derive(Debug)]
struct RateWindow {
    /// One timestamp per admitted unit of weight, oldest first
    admitted: VecDeque<Instant>,
    /// Burst tokens currently available (fractional while refilling)
    burst_tokens: f64,
    /// Last time burst tokens were refilled
    last_refill: Instant,
}

impl RateWindow {
    fn refill(&mut self, now: Instant, per_sec: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.burst_tokens = (self.burst_tokens + elapsed * per_sec).min(capacity);
        self.last_refill = now;
    }

    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Global request limiter shared across all downloads
///
/// Cloning is cheap and clones share the same window, so one limiter can be
/// handed to every component that talks to a provider.
///
/// # Locking
///
/// All state lives behind a single `std::sync::Mutex`. The lock is only held
/// for the bookkeeping inside [`try_acquire`](Self::try_acquire) and is never
/// held across an `.await`.
#[derive(Clone)]
pub struct RateLimiter {
    window: Arc<Mutex<RateWindow>>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter with a full burst bucket and an empty window
    ///
    /// # Examples
    ///
    /// ```
    /// use media_dl::config::RateLimitConfig;
    /// use media_dl::rate_limiter::RateLimiter;
    ///
    /// let limiter = RateLimiter::new(&RateLimitConfig::default());
    /// assert!(limiter.try_acquire(1));
    /// ```
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Arc::new(Mutex::new(RateWindow {
                admitted: VecDeque::new(),
                burst_tokens: f64::from(config.burst_allowance),
                last_refill: Instant::now(),
            })),
            config: Arc::new(config.clone()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateWindow> {
        // A panic while holding the lock cannot leave the window inconsistent
        // beyond a missed refill, so keep using it.
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill_rate(&self) -> f64 {
        let window_secs = self.config.window.as_secs_f64();
        if window_secs > 0.0 {
            f64::from(self.config.burst_allowance) / window_secs
        } else {
            0.0
        }
    }

    /// Try to admit a request of `weight` units without waiting
    ///
    /// Returns `true` and records the admission if it fits either the window
    /// or the burst bucket; returns `false` and changes nothing else otherwise.
    pub fn try_acquire(&self, weight: u32) -> bool {
        if weight == 0 {
            return true;
        }

        let now = Instant::now();
        let rate = self.refill_rate();
        let capacity = f64::from(self.config.burst_allowance);

        let mut window = self.lock();
        window.refill(now, rate, capacity);
        window.evict_expired(now, self.config.window);

        let in_window = window.admitted.len() as u64;
        if in_window + u64::from(weight) > u64::from(self.config.max_requests) {
            if window.burst_tokens >= f64::from(weight) {
                window.burst_tokens -= f64::from(weight);
                tracing::debug!(
                    weight,
                    in_window,
                    burst_tokens = window.burst_tokens,
                    "Request admitted on burst tokens"
                );
            } else {
                return false;
            }
        }

        window
            .admitted
            .extend(std::iter::repeat_n(now, weight as usize));
        true
    }

    /// Wait until a request of `weight` units is admitted
    ///
    /// Polls [`try_acquire`](Self::try_acquire) every `poll_interval`. Gives up
    /// with [`Error::RateLimitTimeout`] once `max_wait` has elapsed, and with
    /// [`Error::Cancelled`] when `cancel` fires. A weight that could never fit
    /// the window plus the whole burst bucket fails immediately.
    pub async fn wait(&self, weight: u32, cancel: &CancellationToken) -> Result<()> {
        let ceiling =
            u64::from(self.config.max_requests) + u64::from(self.config.burst_allowance);
        if u64::from(weight) > ceiling {
            tracing::warn!(weight, ceiling, "Request weight can never be admitted");
            return Err(Error::RateLimitTimeout {
                waited: Duration::ZERO,
            });
        }

        let start = Instant::now();
        loop {
            if self.try_acquire(weight) {
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= self.config.max_wait {
                tracing::warn!(
                    weight,
                    waited_ms = waited.as_millis(),
                    "Gave up waiting for rate limit admission"
                );
                return Err(Error::RateLimitTimeout { waited });
            }

            let nap = self.config.poll_interval.min(self.config.max_wait - waited);
            tokio::select! {
                _ = tokio::time::sleep(nap.max(Duration::from_millis(1))) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Number of admitted request units inside the current window
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut window = self.lock();
        window.evict_expired(now, self.config.window);
        window.admitted.len()
    }

    /// Burst tokens currently available, after refilling for elapsed time
    pub fn burst_tokens(&self) -> f64 {
        let now = Instant::now();
        let rate = self.refill_rate();
        let capacity = f64::from(self.config.burst_allowance);
        let mut window = self.lock();
        window.refill(now, rate, capacity);
        window.burst_tokens
    }
}
