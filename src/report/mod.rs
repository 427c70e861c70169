//! Final report compilation.
//!
//! [`HtmlReportCompiler`] renders a single self-contained HTML page: charts
//! are embedded as base64 data URIs so the file can be moved or mailed on
//! its own. The page always lists which planned analyses produced a result
//! and which were dropped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tera::{Context, Tera};

use crate::error::ReportError;
use crate::pipeline::documents::{AnalysisPlan, Narrative};
use crate::pipeline::stage::StageSummary;
use crate::profile::DatasetProfile;
use crate::runner::{analysis_key, CoverageStatus, ExecutionReport};

/// Everything the compiler sees.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    pub run_id: &'a str,
    pub profile: &'a DatasetProfile,
    pub plan: &'a AnalysisPlan,
    pub execution: &'a ExecutionReport,
    pub narrative: &'a Narrative,
    pub stages: &'a [StageSummary],
}

/// A written report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledReport {
    pub path: PathBuf,
    pub bytes: usize,
    pub charts_embedded: usize,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait ReportCompiler: Send + Sync {
    /// Render `input` into `output`.
    async fn compile(
        &self,
        input: &ReportInput<'_>,
        output: &Path,
    ) -> Result<CompiledReport, ReportError>;
}

const TEMPLATE: &str = include_str!("report.html.tera");

#[derive(Debug, Serialize)]
struct ChartView {
    name: String,
    data_uri: String,
}

#[derive(Debug, Serialize)]
struct AnalysisView {
    key: String,
    question: String,
    chart_type: String,
    succeeded: bool,
    reason: Option<String>,
    result: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportView<'a> {
    run_id: &'a str,
    generated_at: String,
    profile: &'a DatasetProfile,
    description: &'a str,
    narrative: &'a Narrative,
    analyses: Vec<AnalysisView>,
    succeeded: usize,
    dropped: usize,
    charts: Vec<ChartView>,
    other_artifacts: Vec<String>,
    warnings: Vec<String>,
    exit_status: String,
    stages: &'a [StageSummary],
}

/// Renders the report with an embedded Tera template.
#[derive(Debug, Clone, Default)]
pub struct HtmlReportCompiler;

impl HtmlReportCompiler {
    pub fn new() -> Self {
        Self
    }

    fn analyses(input: &ReportInput<'_>) -> Vec<AnalysisView> {
        let results = input.execution.stdout_json.parsed();
        input
            .plan
            .analyses
            .iter()
            .enumerate()
            .map(|(i, planned)| {
                let key = analysis_key(i + 1);
                let coverage = input.execution.coverage.iter().find(|c| c.key == key);
                let succeeded = coverage.is_some_and(|c| c.status == CoverageStatus::Succeeded);
                let result = results
                    .and_then(|r| r.get(&key))
                    .filter(|_| succeeded)
                    .and_then(|v| serde_json::to_string_pretty(v).ok());
                AnalysisView {
                    reason: coverage.and_then(|c| c.reason.clone()),
                    key,
                    question: planned.question.clone(),
                    chart_type: planned.chart_type.clone(),
                    succeeded,
                    result,
                }
            })
            .collect()
    }
}

/// MIME type for artifacts the page can display inline.
fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[async_trait]
impl ReportCompiler for HtmlReportCompiler {
    async fn compile(
        &self,
        input: &ReportInput<'_>,
        output: &Path,
    ) -> Result<CompiledReport, ReportError> {
        let mut warnings = Vec::new();
        let mut charts = Vec::new();
        let mut other_artifacts = Vec::new();

        for path in &input.execution.artifact_paths {
            let Some(mime) = image_mime(path) else {
                other_artifacts.push(file_name(path));
                continue;
            };
            match tokio::fs::read(path).await {
                Ok(bytes) => charts.push(ChartView {
                    name: file_name(path),
                    data_uri: format!("data:{};base64,{}", mime, BASE64.encode(bytes)),
                }),
                Err(e) => {
                    let error = ReportError::ChartUnreadable {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(error = %error, "Skipping chart");
                    warnings.push(error.to_string());
                }
            }
        }

        let analyses = Self::analyses(input);
        let succeeded = analyses.iter().filter(|a| a.succeeded).count();

        let mut all_warnings = input.execution.warnings.clone();
        all_warnings.extend(warnings.iter().cloned());

        let view = ReportView {
            run_id: input.run_id,
            generated_at: chrono::Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
            profile: input.profile,
            description: &input.plan.dataset_description,
            narrative: input.narrative,
            dropped: analyses.len() - succeeded,
            succeeded,
            analyses,
            charts,
            other_artifacts,
            warnings: all_warnings,
            exit_status: input.execution.exit_status.to_string(),
            stages: input.stages,
        };
        let charts_embedded = view.charts.len();

        let context = Context::from_serialize(&view)?;
        let html = Tera::one_off(TEMPLATE, &context, true)?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, html.as_bytes()).await?;

        tracing::info!(
            path = %output.display(),
            charts = charts_embedded,
            analyses_succeeded = succeeded,
            "Report written"
        );

        Ok(CompiledReport {
            path: output.to_path_buf(),
            bytes: html.len(),
            charts_embedded,
            warnings,
        })
    }
}
