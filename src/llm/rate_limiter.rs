//! Per-provider minimum spacing between outbound calls.
//!
//! One limiter is shared by every pipeline run in the process. Each provider
//! gets its own async mutex, so the check-and-update of the last-call time is
//! a single critical section per provider and a burst against one vendor never
//! delays calls to another. `tokio::sync::Mutex` queues waiters in FIFO order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::clock::{Clock, SystemClock};
use crate::metrics::MetricsCollector;

/// Default cooldown between two calls to the same provider.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(3);

/// Errors from bounded acquisition.
#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("Timed out after {limit:?} waiting for the '{provider}' rate limiter")]
    Timeout { provider: String, limit: Duration },
}

type Slot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Throttle enforcing `min_interval[provider]` between granted acquisitions.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    default_interval: Duration,
    intervals: HashMap<String, Duration>,
    slots: Mutex<HashMap<String, Slot>>,
    metrics: MetricsCollector,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(default_interval: Duration) -> Self {
        Self::with_clock(default_interval, Arc::new(SystemClock))
    }

    /// Create a limiter on an injected clock.
    pub fn with_clock(default_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            default_interval,
            intervals: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Override the interval for one provider.
    pub fn with_interval(mut self, provider: impl Into<String>, interval: Duration) -> Self {
        self.intervals.insert(provider.into(), interval);
        self
    }

    /// Interval enforced for `provider`.
    pub fn interval_for(&self, provider: &str) -> Duration {
        self.intervals
            .get(provider)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// The clock this limiter reads.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn slot(&self, provider: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(provider.to_string()).or_default())
    }

    fn wait_needed(&self, provider: &str, last: Option<Instant>) -> Duration {
        match last {
            Some(last) => {
                (last + self.interval_for(provider)).saturating_duration_since(self.clock.now())
            }
            None => Duration::ZERO,
        }
    }

    /// Block until `provider` may be called, then record the call.
    ///
    /// Returns the cooldown slept, not counting time queued behind other
    /// callers for the same provider.
    pub async fn acquire(&self, provider: &str) -> Duration {
        let slot = self.slot(provider);
        let mut last = slot.lock().await;

        let wait = self.wait_needed(provider, *last);
        if !wait.is_zero() {
            tracing::debug!(
                provider = provider,
                wait_ms = wait.as_millis() as u64,
                "Rate limiter delaying call"
            );
            self.clock.sleep(wait).await;
        }

        *last = Some(self.clock.now());
        self.metrics.record_rate_limit_wait(provider, wait);
        wait
    }

    /// Like [`acquire`](Self::acquire) but gives up after `limit`.
    ///
    /// A timed-out acquisition records nothing.
    pub async fn acquire_timeout(
        &self,
        provider: &str,
        limit: Duration,
    ) -> Result<Duration, RateLimitError> {
        let timeout_err = || RateLimitError::Timeout {
            provider: provider.to_string(),
            limit,
        };

        let started = self.clock.now();
        let slot = self.slot(provider);
        let mut last = tokio::time::timeout(limit, slot.lock())
            .await
            .map_err(|_| timeout_err())?;

        let remaining = limit.saturating_sub(self.clock.now().saturating_duration_since(started));
        let wait = self.wait_needed(provider, *last);
        if wait > remaining {
            return Err(timeout_err());
        }

        self.clock.sleep(wait).await;
        *last = Some(self.clock.now());
        self.metrics.record_rate_limit_wait(provider, wait);
        Ok(wait)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_interval", &self.default_interval)
            .field("intervals", &self.intervals)
            .finish()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::clock::ManualClock;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(3), clock.clone());

        assert_eq!(limiter.acquire("gemini").await, Duration::ZERO);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_acquisitions_respect_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(3), clock.clone());

        for _ in 0..4 {
            limiter.acquire("gemini").await;
        }

        assert!(clock.elapsed() >= Duration::from_secs(9));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3); 3]);
    }

    #[tokio::test]
    async fn test_elapsed_time_counts_toward_interval() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(3), clock.clone());

        limiter.acquire("gemini").await;
        clock.advance(Duration::from_secs(2));
        let waited = limiter.acquire("gemini").await;

        assert_eq!(waited, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_providers_do_not_share_state() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(3), clock.clone());

        limiter.acquire("gemini").await;
        limiter.acquire("groq").await;
        limiter.acquire("cerebras").await;

        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_per_provider_interval_override() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(3), clock.clone())
            .with_interval("groq", Duration::from_millis(500));

        assert_eq!(limiter.interval_for("groq"), Duration::from_millis(500));
        assert_eq!(limiter.interval_for("unknown"), Duration::from_secs(3));

        limiter.acquire("groq").await;
        assert_eq!(limiter.acquire("groq").await, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_on_real_clock() {
        let interval = Duration::from_millis(40);
        let limiter = Arc::new(RateLimiter::new(interval));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("gemini").await;
                Instant::now()
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();

        assert!(start.elapsed() >= interval * 3);
        for pair in grants.windows(2) {
            assert!(pair[1] - pair[0] >= interval / 2);
        }
    }

    #[tokio::test]
    async fn test_acquire_timeout_gives_up_without_recording() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(Duration::from_secs(10), clock.clone());

        limiter.acquire("gemini").await;
        let err = limiter
            .acquire_timeout("gemini", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RateLimitError::Timeout {
                provider: "gemini".to_string(),
                limit: Duration::from_secs(1),
            }
        );

        clock.advance(Duration::from_secs(10));
        let waited = limiter
            .acquire_timeout("gemini", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(waited, Duration::ZERO);
    }
}
