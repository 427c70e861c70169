//! Prometheus metrics registration and export.
//!
//! Metrics live in `OnceLock` statics so the invoker, rate limiter, sandbox
//! and orchestrator can record without threading a handle through every
//! call. Recording before [`init_metrics`] is a no-op.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all autoanalyst metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Provider attempts, labeled by provider, model and outcome.
pub static PROVIDER_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Provider call latency in seconds, labeled by provider.
pub static PROVIDER_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Time spent waiting in the rate limiter, labeled by provider.
pub static RATE_LIMIT_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Stage results, labeled by stage and status.
pub static STAGE_RESULTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Sandbox executions, labeled by exit status.
pub static SANDBOX_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it more than once is harmless; later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let provider_attempts = CounterVec::new(
        Opts::new(
            "autoanalyst_provider_attempts_total",
            "Total provider attempts by outcome",
        ),
        &["provider", "model", "outcome"],
    )?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            "autoanalyst_provider_latency_seconds",
            "Provider call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["provider"],
    )?;

    let rate_limit_wait = HistogramVec::new(
        HistogramOpts::new(
            "autoanalyst_rate_limit_wait_seconds",
            "Time spent waiting for the provider rate limiter",
        )
        .buckets(vec![0.0, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0]),
        &["provider"],
    )?;

    let stage_results = CounterVec::new(
        Opts::new("autoanalyst_stage_results_total", "Stage results by status"),
        &["stage", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "autoanalyst_stage_duration_seconds",
            "Stage duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["stage"],
    )?;

    let sandbox_runs = CounterVec::new(
        Opts::new("autoanalyst_sandbox_runs_total", "Sandbox executions by exit status"),
        &["exit_status"],
    )?;

    registry.register(Box::new(provider_attempts.clone()))?;
    registry.register(Box::new(provider_latency.clone()))?;
    registry.register(Box::new(rate_limit_wait.clone()))?;
    registry.register(Box::new(stage_results.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(sandbox_runs.clone()))?;

    // A concurrent initializer may win the race; its metrics are equivalent.
    let _ = REGISTRY.set(registry);
    let _ = PROVIDER_ATTEMPTS_TOTAL.set(provider_attempts);
    let _ = PROVIDER_LATENCY.set(provider_latency);
    let _ = RATE_LIMIT_WAIT.set(rate_limit_wait);
    let _ = STAGE_RESULTS_TOTAL.set(stage_results);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = SANDBOX_RUNS_TOTAL.set(sandbox_runs);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().expect("init");
        if let Some(counter) = SANDBOX_RUNS_TOTAL.get() {
            counter.with_label_values(&["completed"]).inc();
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("autoanalyst_sandbox_runs_total"));
    }
}
