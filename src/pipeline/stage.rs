//! Stage identities, results and their persisted records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{AttemptOutcome, ChainError, ProviderAttempt};
use crate::runner::ExecutionFailure;

/// The six stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Profile,
    Plan,
    Generate,
    Execute,
    Narrate,
    Compile,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::Profile,
        StageKind::Plan,
        StageKind::Generate,
        StageKind::Execute,
        StageKind::Narrate,
        StageKind::Compile,
    ];

    pub fn index(&self) -> u8 {
        match self {
            StageKind::Profile => 0,
            StageKind::Plan => 1,
            StageKind::Generate => 2,
            StageKind::Execute => 3,
            StageKind::Narrate => 4,
            StageKind::Compile => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Profile => "profile",
            StageKind::Plan => "plan",
            StageKind::Generate => "generate",
            StageKind::Execute => "execute",
            StageKind::Narrate => "narrate",
            StageKind::Compile => "compile",
        }
    }

    /// File stem of the persisted record, e.g. `stage2_generate`.
    pub fn file_stem(&self) -> String {
        format!("stage{}_{}", self.index(), self.as_str())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    RateLimited,
    TransientProviderError,
    FatalProviderError,
    SchemaValidationError,
    ExecutionTimeout,
    ExecutionCrash,
    NoUsableOutput,
    Cancelled,
    ProfileError,
    ReportError,
    Io,
}

impl StageErrorKind {
    /// Kind of an exhausted chain, judged from its last attempt.
    pub fn from_chain(error: &ChainError) -> Self {
        let attempts = match error {
            ChainError::Empty { .. } => return StageErrorKind::FatalProviderError,
            ChainError::Exhausted { attempts, .. } => attempts,
        };
        match attempts.last().map(|a| &a.outcome) {
            Some(AttemptOutcome::RateLimited { .. }) => StageErrorKind::RateLimited,
            Some(AttemptOutcome::FatalError { .. }) => StageErrorKind::FatalProviderError,
            Some(AttemptOutcome::TransientError { message })
                if message.starts_with("Response failed validation") =>
            {
                StageErrorKind::SchemaValidationError
            }
            _ => StageErrorKind::TransientProviderError,
        }
    }
}

impl From<ExecutionFailure> for StageErrorKind {
    fn from(failure: ExecutionFailure) -> Self {
        match failure {
            ExecutionFailure::Timeout => StageErrorKind::ExecutionTimeout,
            ExecutionFailure::Crash => StageErrorKind::ExecutionCrash,
            ExecutionFailure::NoUsableOutput => StageErrorKind::NoUsableOutput,
            ExecutionFailure::Cancelled => StageErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(StageErrorKind::Cancelled, "run cancelled")
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult<T> {
    Success(T),
    PartialSuccess(T, Vec<String>),
    Failure(StageError),
}

impl<T> StageResult<T> {
    /// Success, or partial success when there are warnings.
    pub fn from_warnings(payload: T, warnings: Vec<String>) -> Self {
        if warnings.is_empty() {
            StageResult::Success(payload)
        } else {
            StageResult::PartialSuccess(payload, warnings)
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageResult::Success(_) => StageStatus::Success,
            StageResult::PartialSuccess(..) => StageStatus::PartialSuccess,
            StageResult::Failure(_) => StageStatus::Failure,
        }
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            StageResult::Success(p) | StageResult::PartialSuccess(p, _) => Some(p),
            StageResult::Failure(_) => None,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            StageResult::PartialSuccess(_, warnings) => warnings,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&StageError> {
        match self {
            StageResult::Failure(e) => Some(e),
            _ => None,
        }
    }
}

/// Persisted form of a stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub index: u8,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<ProviderAttempt>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl StageRecord {
    /// Build a record from a result whose payload serializes to JSON.
    pub fn from_result<T: Serialize>(
        stage: StageKind,
        result: &StageResult<T>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let payload = result.payload().map(|p| {
            serde_json::to_value(p)
                .unwrap_or_else(|e| serde_json::json!({ "unserializable": e.to_string() }))
        });

        Self {
            stage,
            index: stage.index(),
            status: result.status(),
            started_at,
            finished_at,
            duration_ms,
            provider: None,
            model: None,
            attempts: Vec::new(),
            warnings: result.warnings().to_vec(),
            error: result.error().cloned(),
            payload,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<ProviderAttempt>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Attach diagnostic payload to a failed stage.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn summary(&self) -> StageSummary {
        StageSummary {
            stage: self.stage,
            status: self.status,
            duration_ms: self.duration_ms,
            provider: self.provider.clone(),
            model: self.model.clone(),
            attempts: self.attempts.len(),
            warnings: self.warnings.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Stage metadata without the payload, for the report timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempts: usize,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}
