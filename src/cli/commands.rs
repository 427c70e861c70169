//! CLI command definitions for autoanalyst.
//!
//! This module provides the command-line interface for running the analysis
//! pipeline on one dataset and for inspecting a dataset profile.

use crate::cancel::CancelHandle;
use crate::llm::ApiKeys;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{PipelineConfig, PipelineOutcome, StageOrchestrator, TerminalState};
use crate::profile::{ArrowProfiler, Profiler};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Automated dataset analysis with language-model fallback chains.
#[derive(Parser)]
#[command(name = "autoanalyst")]
#[command(about = "Profile a dataset, generate and run an analysis, and write a narrated report")]
#[command(version)]
#[command(
    long_about = "autoanalyst turns a CSV, Parquet or JSON file into an HTML report.\n\nIt profiles the data, asks a model for an analysis plan, has another model write a script for it, runs the script in a sandbox, and has a model narrate the results.\n\nExample usage:\n  autoanalyst run sales.csv --output ./runs --timeout 120"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the full pipeline on a dataset.
    Run(RunArgs),

    /// Print the profile document of a dataset as JSON.
    Profile(ProfileArgs),
}

/// Arguments for `autoanalyst run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// CSV, Parquet, JSON or JSON Lines file to analyze.
    pub dataset: PathBuf,

    /// Directory receiving one subdirectory per run.
    #[arg(short = 'o', long, env = "AUTOANALYST_OUTPUT_DIR")]
    pub output: Option<PathBuf>,

    /// YAML file with provider chains, rate limits and retry settings.
    /// Applied after `AUTOANALYST_CONFIG`.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Wall-clock limit for the generated script, in seconds.
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Interpreter used to run the generated script.
    #[arg(long, env = "AUTOANALYST_PYTHON")]
    pub python: Option<String>,

    /// Write Prometheus metrics in text format to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Print the run outcome as JSON instead of a summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `autoanalyst profile`.
#[derive(Parser, Debug)]
pub struct ProfileArgs {
    /// CSV, Parquet, JSON or JSON Lines file to profile.
    pub dataset: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// The exit code is non-zero when a pipeline run ends in failure.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Profile(args) => {
            run_profile_command(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Resolve configuration: environment, then config file, then flags.
fn resolve_config(args: &RunArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;

    if let Some(path) = &args.config {
        config = config.merge_file(path)?;
    }
    if let Some(output) = &args.output {
        config = config.with_output_dir(output);
    }
    if let Some(secs) = args.timeout {
        config = config.with_execution_timeout(Duration::from_secs(secs));
    }
    if let Some(python) = &args.python {
        config = config.with_interpreter(python, Vec::new());
    }

    config.validate()?;
    Ok(config)
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    if !args.dataset.is_file() {
        anyhow::bail!("Dataset not found: {}", args.dataset.display());
    }

    if args.metrics_out.is_some() {
        init_metrics()?;
    }

    let config = resolve_config(&args)?;
    let chains = config.build_chains(&ApiKeys::from_env())?;
    let limiter = Arc::new(config.rate_limiter());
    let orchestrator = StageOrchestrator::new(config, chains, limiter);

    let cancel = CancelHandle::new();
    let signal = cancel.signal();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run(&args.dataset, &signal).await;
    ctrl_c.abort();
    let outcome = outcome?;

    if let Some(path) = &args.metrics_out {
        std::fs::write(path, export_metrics())?;
        info!(path = %path.display(), "Wrote metrics");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_summary(&outcome);
    }

    Ok(if outcome.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(outcome: &PipelineOutcome) {
    println!("Run {} ({})", outcome.run_id, outcome.run_dir.display());
    for stage in &outcome.stages {
        let via = match (&stage.provider, &stage.model) {
            (Some(provider), Some(model)) => format!(" via {}/{}", provider, model),
            _ => String::new(),
        };
        println!(
            "  {:<9} {:<16} {:>7} ms{}",
            stage.stage.as_str(),
            stage.status.as_str(),
            stage.duration_ms,
            via
        );
        for warning in &stage.warnings {
            println!("            ! {}", warning);
        }
    }

    if !outcome.coverage.is_empty() {
        let succeeded = outcome
            .coverage
            .iter()
            .filter(|c| c.status == crate::runner::CoverageStatus::Succeeded)
            .count();
        println!(
            "Analyses: {} of {} produced results",
            succeeded,
            outcome.coverage.len()
        );
    }

    match &outcome.terminal {
        TerminalState::Succeeded { report_path } => {
            println!("Report: {}", report_path.display());
        }
        TerminalState::Failed { at_stage, reason } => {
            println!("Failed at {}: {}", at_stage, reason);
        }
    }
}

async fn run_profile_command(args: ProfileArgs) -> anyhow::Result<()> {
    let profile = ArrowProfiler::new().profile(&args.dataset).await?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}
