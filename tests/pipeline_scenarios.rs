//! End-to-end pipeline runs with scripted providers.
//!
//! The "generated code" is a POSIX shell script run by `sh`, so these tests
//! need no Python. Scripts receive the dataset path as `$1` and the artifact
//! directory as `$ARTIFACT_DIR`, exactly as a generated Python script would.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use autoanalyst::cancel::{CancelHandle, CancelSignal};
use autoanalyst::llm::mock::ScriptedProvider;
use autoanalyst::llm::{FallbackChain, InvokerConfig, LlmProvider, RateLimiter, TaskKind};
use autoanalyst::pipeline::{
    ChainSet, PipelineConfig, PipelineOutcome, StageErrorKind, StageKind, StageOrchestrator,
    StageRecord, StageStatus, TerminalState,
};
use autoanalyst::runner::CoverageStatus;
use autoanalyst::LlmError;
use tempfile::{tempdir, TempDir};

const DATASET: &str = "region,revenue,month\n\
north,120.5,1\n\
south,80.0,1\n\
north,130.25,2\n\
east,95.0,2\n\
south,,3\n";

const PLAN: &str = r#"```json
{
  "dataset_description": "Monthly revenue by region",
  "cleaning_steps": ["Fill missing revenue with the median"],
  "analyses": [
    {"question": "Which region earns most?", "columns": ["region", "revenue"], "chart_type": "bar"},
    {"question": "How does revenue move by month?", "columns": ["month", "revenue"], "chart_type": "line"},
    {"question": "How is revenue distributed?", "columns": ["revenue"], "chart_type": "histogram"}
  ]
}
```"#;

const NARRATIVE: &str = r#"{
  "executive_summary": "North leads revenue.",
  "key_findings": ["North earns the most", "Revenue grows month over month"],
  "recommendations": ["Investigate the missing south figure"]
}"#;

const CLEAN_SCRIPT: &str = r#"```sh
test -f "$1" || exit 9
printf 'png' > "$ARTIFACT_DIR/chart_1.png"
printf 'png' > "$ARTIFACT_DIR/chart_2.png"
printf 'png' > "$ARTIFACT_DIR/chart_3.png"
echo "loading data"
echo '{"analysis_1": {"north": 250.75}, "analysis_2": {"1": 200.5, "2": 225.25}, "analysis_3": {"bins": 5}}'
```"#;

/// Analysis 3 raises after the first two charts are saved.
const CRASHING_SCRIPT: &str = r#"```sh
printf 'png' > "$ARTIFACT_DIR/chart_1.png"
printf 'png' > "$ARTIFACT_DIR/chart_2.png"
echo '{"analysis_1": {"north": 250.75}, "analysis_2": {"1": 200.5, "2": 225.25}}'
echo 'Traceback (most recent call last):' >&2
echo 'ValueError: bins must be positive' >&2
exit 1
```"#;

struct Harness {
    dir: TempDir,
    dataset: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let dataset = dir.path().join("revenue.csv");
        std::fs::write(&dataset, DATASET).unwrap();
        Self { dir, dataset }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::default()
            .with_output_dir(self.dir.path().join("runs"))
            .with_interpreter("sh", Vec::new())
            .with_execution_timeout(Duration::from_secs(10))
            .with_reader_grace(Duration::from_millis(300))
            .with_min_interval(Duration::from_millis(1))
            .with_invoker(InvokerConfig {
                max_retries: 1,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                retry_margin: Duration::ZERO,
                max_retry_wait: Duration::from_millis(10),
                call_timeout: Duration::from_secs(2),
                acquire_timeout: Duration::from_secs(5),
            })
    }

    fn orchestrator(&self, config: PipelineConfig, chains: ChainSet) -> StageOrchestrator {
        StageOrchestrator::new(
            config,
            chains,
            Arc::new(RateLimiter::new(Duration::from_millis(1))),
        )
    }

    async fn run(&self, orchestrator: &StageOrchestrator, cancel: &CancelSignal) -> PipelineOutcome {
        orchestrator.run(&self.dataset, cancel).await.unwrap()
    }
}

fn chain(task: TaskKind, links: &[&Arc<ScriptedProvider>]) -> FallbackChain {
    links.iter().fold(FallbackChain::new(task), |chain, provider| {
        chain.with_link((*provider).clone(), format!("{}-model", provider_name(provider)))
    })
}

fn provider_name(provider: &ScriptedProvider) -> String {
    provider.name().to_string()
}

fn single_chains(plan: &Arc<ScriptedProvider>, codegen: &Arc<ScriptedProvider>, narrate: &Arc<ScriptedProvider>) -> ChainSet {
    ChainSet {
        plan: chain(TaskKind::Plan, &[plan]),
        codegen: chain(TaskKind::Codegen, &[codegen]),
        narrate: chain(TaskKind::Narrate, &[narrate]),
    }
}

fn read_record(outcome: &PipelineOutcome, stage: StageKind) -> StageRecord {
    let path = outcome.run_dir.join(format!("{}.json", stage.file_stem()));
    serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap()
}

fn file_names(paths: &[serde_json::Value]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| p.as_str())
        .filter_map(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_clean_run_produces_report_and_every_record() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let codegen = Arc::new(ScriptedProvider::new("groq").reply(CLEAN_SCRIPT));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let orchestrator = harness.orchestrator(harness.config(), single_chains(&plan, &codegen, &narrate));

    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;

    let report_path = match &outcome.terminal {
        TerminalState::Succeeded { report_path } => report_path.clone(),
        other => panic!("expected success, got {:?}", other),
    };
    assert!(!outcome.degraded());
    assert_eq!(outcome.stages.len(), 6);
    for stage in StageKind::ALL {
        assert!(
            outcome.run_dir.join(format!("{}.json", stage.file_stem())).exists(),
            "missing record for {}",
            stage
        );
    }
    assert!(outcome.run_dir.join("stage2_generate.py").exists());
    assert_eq!(report_path, outcome.run_dir.join("report.html"));

    let html = std::fs::read_to_string(&report_path).unwrap();
    assert!(html.contains("North leads revenue."));
    assert!(html.contains("3 of 3 analyses"));
    assert_eq!(html.matches("data:image/png;base64,").count(), 3);

    let profile = read_record(&outcome, StageKind::Profile);
    assert_eq!(profile.payload.as_ref().unwrap()["row_count"], 5);
    let plan_record = read_record(&outcome, StageKind::Plan);
    assert_eq!(plan_record.provider.as_deref(), Some("gemini"));
    assert_eq!(plan_record.attempts.len(), 1);
}

#[tokio::test]
async fn test_crashing_analysis_keeps_charts_and_partial_results() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let codegen = Arc::new(ScriptedProvider::new("groq").reply(CRASHING_SCRIPT));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let orchestrator = harness.orchestrator(harness.config(), single_chains(&plan, &codegen, &narrate));

    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;

    assert!(outcome.succeeded(), "partial execution must not fail the run");
    assert!(outcome.degraded());

    let execute = read_record(&outcome, StageKind::Execute);
    assert_eq!(execute.status, StageStatus::PartialSuccess);
    let payload = execute.payload.unwrap();
    assert_eq!(payload["exit_status"]["status"], "crashed");
    let artifacts = payload["artifact_paths"].as_array().unwrap();
    assert_eq!(file_names(artifacts), vec!["chart_1.png", "chart_2.png"]);
    assert!(payload["stderr_text"]
        .as_str()
        .unwrap()
        .contains("ValueError: bins must be positive"));

    let succeeded: Vec<&str> = outcome
        .coverage
        .iter()
        .filter(|c| c.status == CoverageStatus::Succeeded)
        .map(|c| c.key.as_str())
        .collect();
    assert_eq!(succeeded, vec!["analysis_1", "analysis_2"]);
    assert!(execute.warnings.iter().any(|w| w.contains("analysis_3 dropped")));

    // The narrator is told which analyses were dropped.
    let narrate_request = &narrate.requests()[0];
    let user_prompt = &narrate_request.messages[1].content;
    assert!(user_prompt.contains("analysis_3"));

    let html = std::fs::read_to_string(outcome.run_dir.join("report.html")).unwrap();
    assert!(html.contains("2 of 3 analyses"));
    assert!(html.contains(r#"<span class="dropped">dropped</span>"#));
}

#[tokio::test]
async fn test_malformed_plan_twice_then_fallback() {
    let harness = Harness::new();
    let primary = Arc::new(
        ScriptedProvider::new("gemini")
            .reply("Here is my plan: analyse everything!")
            .reply("{\"dataset_description\": \"x\", \"analyses\": [}"),
    );
    let fallback = Arc::new(ScriptedProvider::new("openrouter").reply(PLAN));
    let codegen = Arc::new(ScriptedProvider::new("groq").reply(CLEAN_SCRIPT));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let chains = ChainSet {
        plan: chain(TaskKind::Plan, &[&primary, &fallback]),
        codegen: chain(TaskKind::Codegen, &[&codegen]),
        narrate: chain(TaskKind::Narrate, &[&narrate]),
    };
    let orchestrator = harness.orchestrator(harness.config(), chains);

    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;
    assert!(outcome.succeeded());

    let plan_record = read_record(&outcome, StageKind::Plan);
    assert_eq!(plan_record.status, StageStatus::Success);
    assert_eq!(plan_record.provider.as_deref(), Some("openrouter"));
    assert_eq!(plan_record.attempts.len(), 3);
    let outcomes: Vec<&str> = plan_record.attempts.iter().map(|a| a.outcome.label()).collect();
    assert_eq!(outcomes, vec!["transient_error", "transient_error", "ok"]);
    assert_eq!(primary.calls(), 2);
    assert_eq!(fallback.calls(), 1);
}

#[tokio::test]
async fn test_fatal_codegen_primary_uses_fallback_after_one_attempt() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let groq = Arc::new(ScriptedProvider::new("groq").fail(LlmError::ApiError {
        code: 401,
        message: "Invalid API Key".to_string(),
    }));
    let cerebras = Arc::new(ScriptedProvider::new("cerebras").reply(CLEAN_SCRIPT));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let chains = ChainSet {
        plan: chain(TaskKind::Plan, &[&plan]),
        codegen: chain(TaskKind::Codegen, &[&groq, &cerebras]),
        narrate: chain(TaskKind::Narrate, &[&narrate]),
    };
    let orchestrator = harness.orchestrator(harness.config(), chains);

    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;
    assert!(outcome.succeeded());

    let generate = read_record(&outcome, StageKind::Generate);
    assert_eq!(generate.attempts.len(), 2);
    assert_eq!(generate.attempts[0].outcome.label(), "fatal_error");
    assert_eq!(generate.provider.as_deref(), Some("cerebras"));
    assert_eq!(groq.calls(), 1);
}

#[tokio::test]
async fn test_no_usable_output_fails_at_execute_and_keeps_earlier_records() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let codegen = Arc::new(
        ScriptedProvider::new("groq").reply("```sh\necho 'NameError: df' >&2\nexit 3\n```"),
    );
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let orchestrator = harness.orchestrator(harness.config(), single_chains(&plan, &codegen, &narrate));

    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;

    match &outcome.terminal {
        TerminalState::Failed { at_stage, reason } => {
            assert_eq!(*at_stage, StageKind::Execute);
            assert_eq!(reason.kind, StageErrorKind::ExecutionCrash);
            assert!(reason.message.contains("NameError: df"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    for stage in [StageKind::Profile, StageKind::Plan, StageKind::Generate] {
        assert_eq!(read_record(&outcome, stage).status, StageStatus::Success);
    }
    let execute = read_record(&outcome, StageKind::Execute);
    assert_eq!(execute.status, StageStatus::Failure);
    assert_eq!(execute.payload.unwrap()["exit_code"], 3);
    assert!(!outcome.run_dir.join("stage4_narrate.json").exists());
    assert!(!outcome.run_dir.join("report.html").exists());
    assert_eq!(narrate.calls(), 0);
}

#[tokio::test]
async fn test_script_timeout_is_bounded() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let codegen = Arc::new(ScriptedProvider::new("groq").reply("```sh\nsleep 30\n```"));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let config = harness.config().with_execution_timeout(Duration::from_millis(500));
    let orchestrator = harness.orchestrator(config, single_chains(&plan, &codegen, &narrate));

    let start = Instant::now();
    let outcome = harness.run(&orchestrator, &CancelSignal::never()).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    match &outcome.terminal {
        TerminalState::Failed { at_stage, reason } => {
            assert_eq!(*at_stage, StageKind::Execute);
            assert_eq!(reason.kind, StageErrorKind::ExecutionTimeout);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_kills_running_script() {
    let harness = Harness::new();
    let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
    let codegen = Arc::new(ScriptedProvider::new("groq").reply("```sh\nsleep 30\n```"));
    let narrate = Arc::new(ScriptedProvider::new("gemini-narrate").reply(NARRATIVE));
    let orchestrator = harness.orchestrator(harness.config(), single_chains(&plan, &codegen, &narrate));

    let handle = CancelHandle::new();
    let signal = handle.signal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel();
    });

    let start = Instant::now();
    let outcome = harness.run(&orchestrator, &signal).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    match &outcome.terminal {
        TerminalState::Failed { at_stage, reason } => {
            assert_eq!(*at_stage, StageKind::Execute);
            assert_eq!(reason.kind, StageErrorKind::Cancelled);
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(narrate.calls(), 0);
}

#[tokio::test]
async fn test_runs_share_only_the_rate_limiter() {
    let harness = Harness::new();
    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(1)).with_interval("gemini", Duration::from_millis(150)));

    let build = || {
        let plan = Arc::new(ScriptedProvider::new("gemini").reply(PLAN));
        let codegen = Arc::new(ScriptedProvider::new("groq").reply(CLEAN_SCRIPT));
        let narrate = Arc::new(ScriptedProvider::new("gemini").reply(NARRATIVE));
        StageOrchestrator::new(
            harness.config(),
            single_chains(&plan, &codegen, &narrate),
            limiter.clone(),
        )
    };
    let (first, second) = (build(), build());

    let start = Instant::now();
    let never = CancelSignal::never();
    let (a, b) = tokio::join!(
        first.run(&harness.dataset, &never),
        second.run(&harness.dataset, &never)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.succeeded() && b.succeeded());
    assert_ne!(a.run_dir, b.run_dir);
    // Four gemini calls across both runs: at least three intervals apart.
    assert!(start.elapsed() >= Duration::from_millis(450));
}
