//! Prometheus-based metrics for provider calls, stages and sandbox runs.
//!
//! ```ignore
//! use autoanalyst::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().record_sandbox_run("completed");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    PROVIDER_ATTEMPTS_TOTAL, PROVIDER_LATENCY, RATE_LIMIT_WAIT, REGISTRY, SANDBOX_RUNS_TOTAL,
    STAGE_DURATION, STAGE_RESULTS_TOTAL,
};
