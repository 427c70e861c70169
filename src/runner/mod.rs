//! Sandboxed execution of generated analysis scripts.
//!
//! - [`SandboxRunner`] runs one script under a timeout and cancellation
//! - [`ExecutionReport`] records exit status, streams and artifacts
//! - [`ExecutionReport::verdict`] applies the partial-success policy
//!
//! ```ignore
//! use autoanalyst::runner::{SandboxConfig, SandboxRunner};
//!
//! let runner = SandboxRunner::new(SandboxConfig::new("/tmp/run/sandbox"));
//! let report = runner.run(&code, &[dataset], Duration::from_secs(60), &signal).await?;
//! println!("{} charts", report.artifact_paths.len());
//! ```

pub mod report;
pub mod sandbox;

pub use report::{
    analysis_key, compute_coverage, AnalysisCoverage, CoverageStatus, ExecutionFailure,
    ExecutionReport, ExecutionVerdict, ExitStatus, StdoutDocument,
};
pub use sandbox::{scan_artifacts, SandboxConfig, SandboxError, SandboxRunner};
