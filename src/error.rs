//! Error types shared across autoanalyst subsystems.
//!
//! Subsystems with a narrow surface keep their error enum next to the code
//! (`RateLimitError`, `InvokeError`, `ChainError`, `SandboxError`,
//! `ConfigError`). The enums here cross module boundaries:
//! - LLM provider calls
//! - Dataset profiling
//! - Report compilation

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during a single LLM provider call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: {0} environment variable not set")]
    MissingApiKey(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Wait suggested by the provider through a `Retry-After` header.
        retry_after: Option<Duration>,
    },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Response failed validation: {0}")]
    InvalidResponse(String),

    /// The local rate limiter did not grant a slot in time. No request was sent.
    #[error(transparent)]
    Throttled(#[from] crate::llm::RateLimitError),
}

/// Errors that can occur while profiling a dataset.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Unsupported dataset format '{0}': expected .csv, .parquet, .json or .jsonl")]
    UnsupportedFormat(String),

    #[error("Invalid JSON dataset: {0}")]
    InvalidJson(String),

    #[error("Dataset is empty: {0}")]
    Empty(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while compiling the final report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Template rendering failed: {0}")]
    Tera(#[from] tera::Error),

    #[error("Failed to read chart '{path}': {reason}")]
    ChartUnreadable { path: String, reason: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
