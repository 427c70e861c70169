//! autoanalyst: automated dataset analysis with language-model fallback chains.
//!
//! This library profiles a tabular dataset, asks language models for an
//! analysis plan and a script, runs the script in a sandboxed subprocess,
//! and compiles the results into a narrated HTML report. Every stage is
//! persisted, provider calls are rate limited and retried across fallback
//! providers, and partial execution results still produce a report.

// Core modules
pub mod cancel;
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod profile;
pub mod prompts;
pub mod report;
pub mod runner;
pub mod utils;

// Re-export commonly used error types
pub use error::{LlmError, ProfileError, ReportError};
