//! Recording helpers over the raw Prometheus metrics.
//!
//! All methods are cheap no-ops until `init_metrics()` has run, so library
//! users that never export metrics pay nothing for them.

use std::time::Duration;

use super::prometheus::{
    PROVIDER_ATTEMPTS_TOTAL, PROVIDER_LATENCY, RATE_LIMIT_WAIT, SANDBOX_RUNS_TOTAL,
    STAGE_DURATION, STAGE_RESULTS_TOTAL,
};

/// Metrics collector for recording pipeline operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one provider attempt.
    ///
    /// # Arguments
    ///
    /// * `provider` - Provider name (e.g. "gemini")
    /// * `model` - Model identifier
    /// * `outcome` - Attempt outcome label ("ok", "rate_limited", ...)
    /// * `latency` - Wall-clock latency of the call
    pub fn record_provider_attempt(
        &self,
        provider: &str,
        model: &str,
        outcome: &str,
        latency: Duration,
    ) {
        if let Some(attempts) = PROVIDER_ATTEMPTS_TOTAL.get() {
            attempts
                .with_label_values(&[provider, model, outcome])
                .inc();
        }

        if let Some(latency_hist) = PROVIDER_LATENCY.get() {
            latency_hist
                .with_label_values(&[provider])
                .observe(latency.as_secs_f64());
        }

        tracing::trace!(
            provider = provider,
            model = model,
            outcome = outcome,
            latency_ms = latency.as_millis() as u64,
            "Recorded provider attempt metric"
        );
    }

    /// Record time spent waiting in the rate limiter.
    pub fn record_rate_limit_wait(&self, provider: &str, waited: Duration) {
        if let Some(wait) = RATE_LIMIT_WAIT.get() {
            wait.with_label_values(&[provider])
                .observe(waited.as_secs_f64());
        }
    }

    /// Record a stage result.
    pub fn record_stage(&self, stage: &str, status: &str, duration: Duration) {
        if let Some(results) = STAGE_RESULTS_TOTAL.get() {
            results.with_label_values(&[stage, status]).inc();
        }

        if let Some(durations) = STAGE_DURATION.get() {
            durations
                .with_label_values(&[stage])
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a sandbox execution by exit status.
    pub fn record_sandbox_run(&self, exit_status: &str) {
        if let Some(runs) = SANDBOX_RUNS_TOTAL.get() {
            runs.with_label_values(&[exit_status]).inc();
        }
    }
}
