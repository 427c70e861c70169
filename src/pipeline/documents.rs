//! Documents exchanged with the language models.
//!
//! Each document has a strict parser used as the fallback chain's response
//! shape check: a reply that fails it counts as a transient failure of that
//! attempt and the chain moves on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::GenerationResponse;
use crate::utils::json_extraction::{extract_code, extract_json_object, JsonExtractionError};

/// Errors raised while reading a model reply into a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Response has no content")]
    EmptyResponse,

    #[error(transparent)]
    Extraction(#[from] JsonExtractionError),

    #[error("Response is not a valid document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document failed validation: {0}")]
    Invalid(String),
}

fn content(response: &GenerationResponse) -> Result<&str, DocumentError> {
    response.first_content().ok_or(DocumentError::EmptyResponse)
}

/// One question the plan wants answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAnalysis {
    pub question: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<String>,
    pub chart_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_hint: Option<String>,
}

/// Analysis plan produced from the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPlan {
    pub dataset_description: String,
    #[serde(default)]
    pub cleaning_steps: Vec<String>,
    pub analyses: Vec<PlannedAnalysis>,
}

impl AnalysisPlan {
    /// Parse and validate a plan from raw model text.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let json = extract_json_object(text)?;
        let plan: Self = serde_json::from_str(&json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_response(response: &GenerationResponse) -> Result<Self, DocumentError> {
        Self::parse(content(response)?)
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.analyses.is_empty() {
            return Err(DocumentError::Invalid("plan has no analyses".to_string()));
        }
        for (i, analysis) in self.analyses.iter().enumerate() {
            let n = i + 1;
            if analysis.question.trim().is_empty() {
                return Err(DocumentError::Invalid(format!("analysis {n} has no question")));
            }
            if analysis.columns.is_empty() {
                return Err(DocumentError::Invalid(format!("analysis {n} names no columns")));
            }
            if analysis.chart_type.trim().is_empty() {
                return Err(DocumentError::Invalid(format!("analysis {n} has no chart type")));
            }
        }
        Ok(())
    }

    /// Warnings for columns the plan references that the dataset lacks.
    pub fn unknown_columns(&self, known: &[&str]) -> Vec<String> {
        let mut warnings = Vec::new();
        for (i, analysis) in self.analyses.iter().enumerate() {
            for column in &analysis.columns {
                if !known.contains(&column.as_str()) {
                    warnings.push(format!(
                        "analysis {} references unknown column '{}'",
                        i + 1,
                        column
                    ));
                }
            }
        }
        warnings
    }
}

/// Analysis script produced from the profile and the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedScript {
    pub code: String,
}

impl GeneratedScript {
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        Ok(Self {
            code: extract_code(text)?,
        })
    }

    /// A script cut off at the token cap is rejected even when a fence was
    /// closed early, since the tail of the analysis is missing.
    pub fn from_response(response: &GenerationResponse) -> Result<Self, DocumentError> {
        if response.truncated() {
            return Err(DocumentError::Invalid(
                "script was cut off at the token limit".to_string(),
            ));
        }
        Self::parse(content(response)?)
    }

    pub fn line_count(&self) -> usize {
        self.code.lines().count()
    }
}

/// Narrative written from the execution results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub executive_summary: String,
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Narrative {
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let json = extract_json_object(text)?;
        let narrative: Self = serde_json::from_str(&json)?;
        if narrative.executive_summary.trim().is_empty() {
            return Err(DocumentError::Invalid("executive summary is empty".to_string()));
        }
        if narrative.key_findings.is_empty() {
            return Err(DocumentError::Invalid("no key findings".to_string()));
        }
        Ok(narrative)
    }

    pub fn from_response(response: &GenerationResponse) -> Result<Self, DocumentError> {
        Self::parse(content(response)?)
    }
}
