//! Pipeline orchestration for dataset analysis runs.
//!
//! # Architecture
//!
//! - **Orchestrator**: runs the six stages and decides which failures end the run
//! - **Stage**: stage identities, results and the persisted record format
//! - **Store**: the per-run directory every stage record lands in
//! - **Documents**: plan, script and narrative parsed from model replies
//! - **Config**: limits, provider chains and environment/YAML loading
//!
//! # Pipeline Flow
//!
//! 1. **Profile**: the dataset is summarized into a profile document
//! 2. **Plan**: a model turns the profile into a list of analyses
//! 3. **Generate**: a model writes one script covering every analysis
//! 4. **Execute**: the script runs in a sandbox; charts and stdout are collected
//! 5. **Narrate**: a model writes findings from whatever results exist
//! 6. **Compile**: everything is rendered into `report.html`
//!
//! Stages 2, 3 and 5 go through a [`FallbackChain`](crate::llm::FallbackChain)
//! with per-provider retries. Execute may end partially successful; the run
//! carries on and the report lists the dropped analyses.
//!
//! # Example
//!
//! ```rust,ignore
//! use autoanalyst::cancel::CancelHandle;
//! use autoanalyst::llm::ApiKeys;
//! use autoanalyst::pipeline::{PipelineConfig, StageOrchestrator};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_env()?;
//! let chains = config.build_chains(&ApiKeys::from_env())?;
//! let limiter = Arc::new(config.rate_limiter());
//! let orchestrator = StageOrchestrator::new(config, chains, limiter);
//!
//! let cancel = CancelHandle::new();
//! let outcome = orchestrator.run("sales.csv".as_ref(), &cancel.signal()).await?;
//! println!("{}: {:?}", outcome.run_id, outcome.terminal);
//! ```

pub mod config;
pub mod documents;
pub mod orchestrator;
pub mod stage;
pub mod store;

// Re-export main types for convenience
pub use config::{ChainSet, ChainsConfig, ConfigError, LinkSpec, PipelineConfig};
pub use documents::{AnalysisPlan, DocumentError, GeneratedScript, Narrative, PlannedAnalysis};
pub use orchestrator::{PipelineError, PipelineOutcome, StageOrchestrator, TerminalState};
pub use stage::{
    StageError, StageErrorKind, StageKind, StageRecord, StageResult, StageStatus, StageSummary,
};
pub use store::{new_run_id, StageStore, StoreError};
