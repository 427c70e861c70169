//! What a sandbox run leaves behind, and how to judge it.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited with status 0.
    Completed,
    /// Killed after exceeding the wall-clock limit.
    TimedOut,
    /// Exited non-zero, or was killed by a signal (`code` is `None`).
    Crashed { code: Option<i32> },
    /// Killed on external cancellation.
    Cancelled,
}

impl ExitStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ExitStatus::Completed => "completed",
            ExitStatus::TimedOut => "timed_out",
            ExitStatus::Crashed { .. } => "crashed",
            ExitStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Crashed { code: Some(code) } => write!(f, "crashed (exit code {})", code),
            ExitStatus::Crashed { code: None } => f.write_str("crashed (killed by signal)"),
            other => f.write_str(other.label()),
        }
    }
}

/// The script's stdout, read as one structured document when possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StdoutDocument {
    Parsed(serde_json::Value),
    Raw(String),
    Empty,
}

impl StdoutDocument {
    /// Parse the whole stream, then fall back to its last non-empty line.
    pub fn parse(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return StdoutDocument::Empty;
        }
        if let Ok(value) = serde_json::from_str(trimmed) {
            return StdoutDocument::Parsed(value);
        }
        let last_line = trimmed.lines().rev().map(str::trim).find(|l| !l.is_empty());
        if let Some(value) = last_line.and_then(|line| serde_json::from_str(line).ok()) {
            return StdoutDocument::Parsed(value);
        }
        StdoutDocument::Raw(trimmed.to_string())
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, StdoutDocument::Parsed(_))
    }

    pub fn parsed(&self) -> Option<&serde_json::Value> {
        match self {
            StdoutDocument::Parsed(value) => Some(value),
            _ => None,
        }
    }

    /// JSON view for downstream consumers: raw text is wrapped as `raw_output`.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            StdoutDocument::Parsed(value) => value.clone(),
            StdoutDocument::Raw(text) => serde_json::json!({ "raw_output": text }),
            StdoutDocument::Empty => serde_json::json!({}),
        }
    }
}

/// Whether a planned analysis made it into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    Succeeded,
    Dropped,
}

/// Coverage of one planned analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCoverage {
    /// Result key, `analysis_<n>`.
    pub key: String,
    pub status: CoverageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result key of the 1-based analysis `n`.
pub fn analysis_key(n: usize) -> String {
    format!("analysis_{}", n)
}

/// Compute coverage of `planned` analyses against the stdout document.
pub fn compute_coverage(planned: usize, stdout: &StdoutDocument) -> Vec<AnalysisCoverage> {
    let object = stdout.parsed().and_then(|v| v.as_object());

    (1..=planned)
        .map(|n| {
            let key = analysis_key(n);
            let (status, reason) = match object.and_then(|o| o.get(&key)) {
                None if object.is_none() => (CoverageStatus::Dropped, Some("no parsed output".to_string())),
                None => (CoverageStatus::Dropped, Some("missing from output".to_string())),
                Some(serde_json::Value::Null) => (CoverageStatus::Dropped, Some("null result".to_string())),
                Some(value) => match value.get("error") {
                    Some(error) => {
                        let message = error
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| error.to_string());
                        (CoverageStatus::Dropped, Some(message))
                    }
                    None => (CoverageStatus::Succeeded, None),
                },
            };
            AnalysisCoverage { key, status, reason }
        })
        .collect()
}

/// Everything observed about one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exit_status: ExitStatus,
    pub exit_code: Option<i32>,
    pub stdout_json: StdoutDocument,
    pub stdout_text: String,
    pub stderr_text: String,
    /// Files in the artifact directory when execution ended, sorted.
    pub artifact_paths: Vec<PathBuf>,
    pub script_path: PathBuf,
    pub script_sha256: String,
    pub duration_ms: u64,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub coverage: Vec<AnalysisCoverage>,
}

/// Why an execution produced nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    Timeout,
    Crash,
    NoUsableOutput,
    Cancelled,
}

/// Stage-level judgement of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionVerdict {
    Success,
    PartialSuccess,
    Failure(ExecutionFailure),
}

impl ExecutionReport {
    /// Fill in coverage for a plan with `planned` analyses.
    pub fn assess_coverage(&mut self, planned: usize) {
        self.coverage = compute_coverage(planned, &self.stdout_json);
        for entry in &self.coverage {
            if entry.status == CoverageStatus::Dropped {
                self.warnings.push(format!(
                    "{} dropped: {}",
                    entry.key,
                    entry.reason.as_deref().unwrap_or("no result")
                ));
            }
        }
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.coverage_with(CoverageStatus::Succeeded)
    }

    pub fn dropped(&self) -> Vec<&str> {
        self.coverage_with(CoverageStatus::Dropped)
    }

    fn coverage_with(&self, status: CoverageStatus) -> Vec<&str> {
        self.coverage
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.key.as_str())
            .collect()
    }

    /// Judge the run.
    ///
    /// Artifacts and parsed stdout survive any exit status; the run fails
    /// only when neither exists, or when it was cancelled.
    pub fn verdict(&self) -> ExecutionVerdict {
        if self.exit_status == ExitStatus::Cancelled {
            return ExecutionVerdict::Failure(ExecutionFailure::Cancelled);
        }

        let parsed = self.stdout_json.is_parsed();
        if self.exit_status == ExitStatus::Completed && parsed && self.warnings.is_empty() {
            return ExecutionVerdict::Success;
        }
        if parsed || !self.artifact_paths.is_empty() {
            return ExecutionVerdict::PartialSuccess;
        }

        ExecutionVerdict::Failure(match self.exit_status {
            ExitStatus::TimedOut => ExecutionFailure::Timeout,
            ExitStatus::Crashed { .. } => ExecutionFailure::Crash,
            _ => ExecutionFailure::NoUsableOutput,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(exit_status: ExitStatus, stdout: &str, artifacts: usize) -> ExecutionReport {
        ExecutionReport {
            exit_status,
            exit_code: None,
            stdout_json: StdoutDocument::parse(stdout),
            stdout_text: stdout.to_string(),
            stderr_text: String::new(),
            artifact_paths: (1..=artifacts)
                .map(|n| PathBuf::from(format!("chart_{n}.png")))
                .collect(),
            script_path: PathBuf::from("analysis.py"),
            script_sha256: String::new(),
            duration_ms: 1,
            warnings: Vec::new(),
            coverage: Vec::new(),
        }
    }

    #[test]
    fn test_stdout_parse_forms() {
        assert_eq!(StdoutDocument::parse("  \n"), StdoutDocument::Empty);
        assert_eq!(
            StdoutDocument::parse("{\"a\": 1}\n"),
            StdoutDocument::Parsed(json!({"a": 1}))
        );
        assert_eq!(
            StdoutDocument::parse("loading...\nrows: 10\n{\"a\": 2}\n\n"),
            StdoutDocument::Parsed(json!({"a": 2}))
        );
        assert_eq!(
            StdoutDocument::parse("Traceback (most recent call last):"),
            StdoutDocument::Raw("Traceback (most recent call last):".to_string())
        );
    }

    #[test]
    fn test_raw_stdout_value_wraps_text() {
        let doc = StdoutDocument::Raw("oops".to_string());
        assert_eq!(doc.to_value(), json!({"raw_output": "oops"}));
    }

    #[test]
    fn test_coverage() {
        let doc = StdoutDocument::Parsed(json!({
            "analysis_1": {"mean": 3},
            "analysis_2": {"error": "KeyError: 'tenure'"},
            "analysis_3": null
        }));
        let coverage = compute_coverage(4, &doc);

        assert_eq!(coverage[0].status, CoverageStatus::Succeeded);
        assert_eq!(coverage[1].status, CoverageStatus::Dropped);
        assert_eq!(coverage[1].reason.as_deref(), Some("KeyError: 'tenure'"));
        assert_eq!(coverage[2].reason.as_deref(), Some("null result"));
        assert_eq!(coverage[3].reason.as_deref(), Some("missing from output"));
    }

    #[test]
    fn test_coverage_without_parsed_output() {
        let coverage = compute_coverage(2, &StdoutDocument::Raw("x".to_string()));
        assert!(coverage.iter().all(|c| c.status == CoverageStatus::Dropped));
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(
            report(ExitStatus::Completed, "{}", 0).verdict(),
            ExecutionVerdict::Success
        );
        assert_eq!(
            report(ExitStatus::Crashed { code: Some(1) }, "", 2).verdict(),
            ExecutionVerdict::PartialSuccess
        );
        assert_eq!(
            report(ExitStatus::TimedOut, "{\"analysis_1\": 1}", 0).verdict(),
            ExecutionVerdict::PartialSuccess
        );
        assert_eq!(
            report(ExitStatus::TimedOut, "", 0).verdict(),
            ExecutionVerdict::Failure(ExecutionFailure::Timeout)
        );
        assert_eq!(
            report(ExitStatus::Crashed { code: Some(1) }, "boom", 0).verdict(),
            ExecutionVerdict::Failure(ExecutionFailure::Crash)
        );
        assert_eq!(
            report(ExitStatus::Completed, "not json", 0).verdict(),
            ExecutionVerdict::Failure(ExecutionFailure::NoUsableOutput)
        );
        assert_eq!(
            report(ExitStatus::Cancelled, "{}", 3).verdict(),
            ExecutionVerdict::Failure(ExecutionFailure::Cancelled)
        );
    }

    #[test]
    fn test_dropped_analyses_make_run_partial() {
        let mut report = report(ExitStatus::Completed, "{\"analysis_1\": 1}", 1);
        report.assess_coverage(2);
        assert_eq!(report.succeeded(), vec!["analysis_1"]);
        assert_eq!(report.dropped(), vec!["analysis_2"]);
        assert_eq!(report.verdict(), ExecutionVerdict::PartialSuccess);
    }
}
