//! Stage orchestrator for one analysis run.
//!
//! Runs Profile → Plan → Generate → Execute → Narrate → Compile in order.
//! Every stage produces exactly one [`StageResult`], persisted before the
//! next stage starts. A stage needs its predecessor to be at least a partial
//! success; the first failure ends the run with `PipelineFailed` and leaves
//! every earlier record in place. Execute is the stage that normally ends
//! partial: its warnings and analysis coverage flow into the narrative and
//! the report.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancelSignal;
use crate::error::ProfileError;
use crate::llm::{
    ChainError, ChainSuccess, GenerationRequest, GenerationResponse, ProviderAttempt,
    ProviderInvoker, RateLimiter, TaskKind,
};
use crate::metrics::MetricsCollector;
use crate::profile::{ArrowProfiler, DatasetFormat, DatasetProfile, Profiler};
use crate::prompts::{
    build_codegen_prompt, build_narrative_prompt, build_plan_prompt, NarrativeInput, Prompt,
};
use crate::report::{CompiledReport, HtmlReportCompiler, ReportCompiler, ReportInput};
use crate::runner::{
    AnalysisCoverage, ExecutionReport, ExecutionVerdict, SandboxConfig, SandboxError,
    SandboxRunner,
};

use super::config::{ChainSet, PipelineConfig};
use super::documents::{AnalysisPlan, GeneratedScript, Narrative};
use super::stage::{
    StageError, StageErrorKind, StageKind, StageRecord, StageResult, StageStatus, StageSummary,
};
use super::store::{new_run_id, StageStore, StoreError};

/// Failures that prevent the run from being recorded at all.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to persist run state: {0}")]
    Store(#[from] StoreError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded { report_path: PathBuf },
    Failed { at_stage: StageKind, reason: StageError },
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub stages: Vec<StageSummary>,
    /// Coverage of the planned analyses, empty if Execute never finished.
    pub coverage: Vec<AnalysisCoverage>,
    pub terminal: TerminalState,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.terminal, TerminalState::Succeeded { .. })
    }

    /// True when the run finished but some stage was only partially successful.
    pub fn degraded(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.status == StageStatus::PartialSuccess)
    }
}

/// Mutable state of one run.
struct RunState {
    store: StageStore,
    stages: Vec<StageSummary>,
}

/// A stage that failed and ended the run.
struct Halt {
    stage: StageKind,
    reason: StageError,
}

type StageOutput<T> = Result<T, Halt>;

/// Sequences the six stages of a run.
#[derive(Clone)]
pub struct StageOrchestrator {
    config: PipelineConfig,
    chains: ChainSet,
    invoker: ProviderInvoker,
    profiler: Arc<dyn Profiler>,
    compiler: Arc<dyn ReportCompiler>,
    metrics: MetricsCollector,
}

impl StageOrchestrator {
    /// Create an orchestrator with the Arrow profiler and the HTML compiler.
    ///
    /// The rate limiter may be shared with other orchestrators.
    pub fn new(config: PipelineConfig, chains: ChainSet, limiter: Arc<RateLimiter>) -> Self {
        let invoker = ProviderInvoker::new(limiter, config.invoker.clone());
        Self {
            config,
            chains,
            invoker,
            profiler: Arc::new(ArrowProfiler::new()),
            compiler: Arc::new(HtmlReportCompiler::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_profiler(mut self, profiler: Arc<dyn Profiler>) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn ReportCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline on `dataset` under a fresh run id.
    ///
    /// # Errors
    ///
    /// Only failure to persist stage records is an error; stage failures are
    /// reported through [`TerminalState::Failed`].
    pub async fn run(
        &self,
        dataset: &Path,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.run_with_id(dataset, new_run_id(), cancel).await
    }

    pub async fn run_with_id(
        &self,
        dataset: &Path,
        run_id: impl Into<String>,
        cancel: &CancelSignal,
    ) -> Result<PipelineOutcome, PipelineError> {
        let store = StageStore::create(&self.config.output_dir, run_id).await?;
        tracing::info!(
            run_id = %store.run_id(),
            dataset = %dataset.display(),
            run_dir = %store.run_dir().display(),
            "Pipeline run started"
        );

        let mut state = RunState {
            store,
            stages: Vec::new(),
        };
        let mut coverage = Vec::new();

        let terminal = match self.stages(dataset, cancel, &mut state, &mut coverage).await? {
            Ok(report) => {
                tracing::info!(
                    run_id = %state.store.run_id(),
                    report = %report.path.display(),
                    "Pipeline run succeeded"
                );
                TerminalState::Succeeded {
                    report_path: report.path,
                }
            }
            Err(halt) => {
                tracing::error!(
                    run_id = %state.store.run_id(),
                    stage = %halt.stage,
                    error = %halt.reason,
                    "Pipeline run failed"
                );
                TerminalState::Failed {
                    at_stage: halt.stage,
                    reason: halt.reason,
                }
            }
        };

        Ok(PipelineOutcome {
            run_id: state.store.run_id().to_string(),
            run_dir: state.store.run_dir().to_path_buf(),
            stages: state.stages,
            coverage,
            terminal,
        })
    }

    async fn stages(
        &self,
        dataset: &Path,
        cancel: &CancelSignal,
        state: &mut RunState,
        coverage: &mut Vec<AnalysisCoverage>,
    ) -> Result<StageOutput<CompiledReport>, PipelineError> {
        let (profile, format) = match self.profile_stage(dataset, cancel, state).await? {
            Ok(profiled) => profiled,
            Err(halt) => return Ok(Err(halt)),
        };
        let plan = match self.plan_stage(&profile, cancel, state).await? {
            Ok(plan) => plan,
            Err(halt) => return Ok(Err(halt)),
        };
        let script = match self
            .generate_stage(&profile, &plan, format, cancel, state)
            .await?
        {
            Ok(script) => script,
            Err(halt) => return Ok(Err(halt)),
        };
        let execution = match self
            .execute_stage(dataset, &plan, &script, cancel, state)
            .await?
        {
            Ok(execution) => execution,
            Err(halt) => return Ok(Err(halt)),
        };
        coverage.clone_from(&execution.coverage);

        let narrative = match self.narrate_stage(&plan, &execution, cancel, state).await? {
            Ok(narrative) => narrative,
            Err(halt) => return Ok(Err(halt)),
        };
        self.compile_stage(&profile, &plan, &execution, &narrative, cancel, state)
            .await
    }

    async fn profile_stage(
        &self,
        dataset: &Path,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<(DatasetProfile, DatasetFormat)>, PipelineError> {
        let stage = StageKind::Profile;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let profiled = async {
            let format = DatasetFormat::from_path(dataset)?;
            let profile = self.profiler.profile(dataset).await?;
            Ok::<_, ProfileError>((profile, format))
        }
        .await;

        match profiled {
            Ok((profile, format)) => {
                let record = StageRecord::from_result(
                    stage,
                    &StageResult::Success(&profile),
                    started_at,
                );
                self.persist(record, state).await?;
                Ok(Ok((profile, format)))
            }
            Err(e) => {
                let error = StageError::new(StageErrorKind::ProfileError, e.to_string());
                self.fail(stage, error, started_at, None, state).await
            }
        }
    }

    async fn plan_stage(
        &self,
        profile: &DatasetProfile,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<AnalysisPlan>, PipelineError> {
        let stage = StageKind::Plan;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let prompt = build_plan_prompt(profile);
        let (result, attempts) = self
            .call_chain(TaskKind::Plan, prompt, |r| {
                AnalysisPlan::from_response(r).map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(success) => {
                let warnings = success.value.unknown_columns(&profile.column_names());
                for warning in &warnings {
                    tracing::warn!(warning = %warning, "Plan references a column the dataset lacks");
                }
                self.served(stage, success, warnings, attempts, started_at, state)
                    .await
            }
            Err(e) => self.chain_failed(stage, e, attempts, started_at, state).await,
        }
    }

    async fn generate_stage(
        &self,
        profile: &DatasetProfile,
        plan: &AnalysisPlan,
        format: DatasetFormat,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<GeneratedScript>, PipelineError> {
        let stage = StageKind::Generate;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let prompt = build_codegen_prompt(profile, plan, format);
        let (result, attempts) = self
            .call_chain(TaskKind::Codegen, prompt, |r| {
                GeneratedScript::from_response(r).map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(success) => {
                state.store.write_script(&success.value.code).await?;
                tracing::debug!(lines = success.value.line_count(), "Generated analysis script");
                self.served(stage, success, Vec::new(), attempts, started_at, state)
                    .await
            }
            Err(e) => self.chain_failed(stage, e, attempts, started_at, state).await,
        }
    }

    async fn execute_stage(
        &self,
        dataset: &Path,
        plan: &AnalysisPlan,
        script: &GeneratedScript,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<ExecutionReport>, PipelineError> {
        let stage = StageKind::Execute;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let sandbox = SandboxRunner::new(
            SandboxConfig::new(state.store.sandbox_dir())
                .with_interpreter(&self.config.interpreter, self.config.interpreter_args.clone())
                .with_reader_grace(self.config.reader_grace),
        );
        let dataset_arg = std::path::absolute(dataset)
            .unwrap_or_else(|_| dataset.to_path_buf())
            .display()
            .to_string();

        let mut report = match sandbox
            .run(&script.code, &[dataset_arg], self.config.execution_timeout, cancel)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                let kind = match e {
                    SandboxError::Spawn { .. } => StageErrorKind::ExecutionCrash,
                    _ => StageErrorKind::Io,
                };
                let error = StageError::new(kind, e.to_string());
                return self.fail(stage, error, started_at, None, state).await;
            }
        };
        report.assess_coverage(plan.analyses.len());

        let warnings = match report.verdict() {
            ExecutionVerdict::Success => Vec::new(),
            ExecutionVerdict::PartialSuccess => {
                tracing::warn!(
                    exit_status = %report.exit_status,
                    succeeded = report.succeeded().len(),
                    dropped = report.dropped().len(),
                    artifacts = report.artifact_paths.len(),
                    "Execution partially succeeded"
                );
                let mut warnings = report.warnings.clone();
                if warnings.is_empty() {
                    warnings.push(format!("script {}", report.exit_status));
                }
                warnings
            }
            ExecutionVerdict::Failure(failure) => {
                let last_stderr = report
                    .stderr_text
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|l| !l.is_empty());
                let mut message = format!(
                    "script {} with no parseable output and no artifacts",
                    report.exit_status
                );
                if let Some(line) = last_stderr {
                    message = format!("{}: {}", message, line);
                }
                let error = StageError::new(failure.into(), message);
                return self.fail(stage, error, started_at, Some(&report), state).await;
            }
        };

        self.succeed(stage, report, warnings, started_at, state).await
    }

    async fn narrate_stage(
        &self,
        plan: &AnalysisPlan,
        execution: &ExecutionReport,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<Narrative>, PipelineError> {
        let stage = StageKind::Narrate;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let input = NarrativeInput {
            dataset_description: plan.dataset_description.clone(),
            results: execution.stdout_json.to_value(),
            succeeded: execution.succeeded().into_iter().map(str::to_string).collect(),
            dropped: execution.dropped().into_iter().map(str::to_string).collect(),
            chart_count: execution.artifact_paths.len(),
            warnings: execution.warnings.clone(),
        };
        let prompt = build_narrative_prompt(&input);
        let (result, attempts) = self
            .call_chain(TaskKind::Narrate, prompt, |r| {
                Narrative::from_response(r).map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(success) => {
                self.served(stage, success, Vec::new(), attempts, started_at, state)
                    .await
            }
            Err(e) => self.chain_failed(stage, e, attempts, started_at, state).await,
        }
    }

    async fn compile_stage(
        &self,
        profile: &DatasetProfile,
        plan: &AnalysisPlan,
        execution: &ExecutionReport,
        narrative: &Narrative,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<StageOutput<CompiledReport>, PipelineError> {
        let stage = StageKind::Compile;
        let started_at = Utc::now();
        if let Some(halt) = self.begin(stage, started_at, cancel, state).await? {
            return Ok(Err(halt));
        }

        let input = ReportInput {
            run_id: state.store.run_id(),
            profile,
            plan,
            execution,
            narrative,
            stages: &state.stages,
        };
        let output = state.store.report_path();

        match self.compiler.compile(&input, &output).await {
            Ok(compiled) => {
                let warnings = compiled.warnings.clone();
                self.succeed(stage, compiled, warnings, started_at, state).await
            }
            Err(e) => {
                let error = StageError::new(StageErrorKind::ReportError, e.to_string());
                self.fail(stage, error, started_at, None, state).await
            }
        }
    }

    /// Run the task's chain with the shared request settings.
    async fn call_chain<T, F>(
        &self,
        task: TaskKind,
        prompt: Prompt,
        validate: F,
    ) -> (Result<ChainSuccess<T>, ChainError>, Vec<ProviderAttempt>)
    where
        F: Fn(&GenerationResponse) -> Result<T, String>,
    {
        let chain = self.chains.for_task(task);
        let model = chain.primary().map(|l| l.model.clone()).unwrap_or_default();
        let request = GenerationRequest::new(model, prompt.into_messages())
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        chain.run(&self.invoker, &request, validate).await
    }

    /// Log the stage start, or end the run there if cancellation was requested.
    async fn begin(
        &self,
        stage: StageKind,
        started_at: DateTime<Utc>,
        cancel: &CancelSignal,
        state: &mut RunState,
    ) -> Result<Option<Halt>, PipelineError> {
        if !cancel.is_cancelled() {
            tracing::info!(run_id = %state.store.run_id(), stage = %stage, "Stage started");
            return Ok(None);
        }
        tracing::warn!(stage = %stage, "Run cancelled before stage");
        let halt = self
            .halt(stage, StageError::cancelled(), started_at, None, state)
            .await?;
        Ok(Some(halt))
    }

    async fn succeed<T: Serialize>(
        &self,
        stage: StageKind,
        payload: T,
        warnings: Vec<String>,
        started_at: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<StageOutput<T>, PipelineError> {
        let record =
            StageRecord::from_result(stage, &StageResult::from_warnings(&payload, warnings), started_at);
        self.persist(record, state).await?;
        Ok(Ok(payload))
    }

    /// Persist a stage served by a provider chain.
    async fn served<T: Serialize>(
        &self,
        stage: StageKind,
        success: ChainSuccess<T>,
        warnings: Vec<String>,
        attempts: Vec<ProviderAttempt>,
        started_at: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<StageOutput<T>, PipelineError> {
        let result = StageResult::from_warnings(&success.value, warnings);
        let record = StageRecord::from_result(stage, &result, started_at)
            .with_provider(&success.provider, &success.model)
            .with_attempts(attempts);
        self.persist(record, state).await?;
        Ok(Ok(success.value))
    }

    async fn chain_failed<T>(
        &self,
        stage: StageKind,
        error: ChainError,
        attempts: Vec<ProviderAttempt>,
        started_at: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<StageOutput<T>, PipelineError> {
        let reason = StageError::new(StageErrorKind::from_chain(&error), error.to_string());
        let result: StageResult<()> = StageResult::Failure(reason.clone());
        let record = StageRecord::from_result(stage, &result, started_at).with_attempts(attempts);
        self.persist(record, state).await?;
        Ok(Err(Halt { stage, reason }))
    }

    async fn fail<T>(
        &self,
        stage: StageKind,
        reason: StageError,
        started_at: DateTime<Utc>,
        diagnostics: Option<&ExecutionReport>,
        state: &mut RunState,
    ) -> Result<StageOutput<T>, PipelineError> {
        let halt = self
            .halt(stage, reason, started_at, diagnostics, state)
            .await?;
        Ok(Err(halt))
    }

    async fn halt(
        &self,
        stage: StageKind,
        reason: StageError,
        started_at: DateTime<Utc>,
        diagnostics: Option<&ExecutionReport>,
        state: &mut RunState,
    ) -> Result<Halt, PipelineError> {
        let result: StageResult<()> = StageResult::Failure(reason.clone());
        let mut record = StageRecord::from_result(stage, &result, started_at);
        if let Some(report) = diagnostics {
            record = record.with_payload(report);
        }
        self.persist(record, state).await?;
        Ok(Halt { stage, reason })
    }

    async fn persist(&self, record: StageRecord, state: &mut RunState) -> Result<(), PipelineError> {
        state.store.write_record(&record).await?;
        self.metrics.record_stage(
            record.stage.as_str(),
            record.status.as_str(),
            Duration::from_millis(record.duration_ms),
        );
        tracing::info!(
            run_id = %state.store.run_id(),
            stage = %record.stage,
            status = %record.status,
            duration_ms = record.duration_ms,
            provider = record.provider.as_deref().unwrap_or("-"),
            warnings = record.warnings.len(),
            "Stage finished"
        );
        state.stages.push(record.summary());
        Ok(())
    }
}
