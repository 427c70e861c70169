//! Pipeline configuration.
//!
//! Settings come from, in increasing priority: defaults, `AUTOANALYST_*`
//! environment variables, an optional YAML file, and CLI flags (applied by
//! the caller through the `with_*` setters).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{
    build_provider, ApiKeys, FallbackChain, InvokerConfig, LlmProvider, ProviderKind,
    RateLimiter, TaskKind, DEFAULT_MIN_INTERVAL,
};

/// Upper bound on `invoker.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// No usable provider is left for a task.
    #[error("No provider with an API key is configured for task '{0}'")]
    EmptyChain(TaskKind),

    #[error("Invalid config file {path}: {message}")]
    File { path: PathBuf, message: String },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One provider/model link as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub provider: ProviderKind,
    pub model: String,
}

impl LinkSpec {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

/// Provider/model order for each task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainsConfig {
    pub plan: Vec<LinkSpec>,
    pub codegen: Vec<LinkSpec>,
    pub narrate: Vec<LinkSpec>,
}

impl Default for ChainsConfig {
    fn default() -> Self {
        let gemini = || {
            vec![
                LinkSpec::new(ProviderKind::Gemini, "gemini-2.5-flash"),
                LinkSpec::new(ProviderKind::Gemini, "gemini-1.5-flash"),
                LinkSpec::new(ProviderKind::Gemini, "gemini-1.5-pro"),
            ]
        };
        Self {
            plan: gemini(),
            codegen: vec![
                LinkSpec::new(ProviderKind::Groq, "llama-3.3-70b-versatile"),
                LinkSpec::new(ProviderKind::Cerebras, "llama-3.3-70b"),
            ],
            narrate: gemini(),
        }
    }
}

impl ChainsConfig {
    pub fn for_task(&self, task: TaskKind) -> &[LinkSpec] {
        match task {
            TaskKind::Plan => &self.plan,
            TaskKind::Codegen => &self.codegen,
            TaskKind::Narrate => &self.narrate,
        }
    }
}

/// Ready-to-run chains for the three model-backed tasks.
#[derive(Debug, Clone)]
pub struct ChainSet {
    pub plan: FallbackChain,
    pub codegen: FallbackChain,
    pub narrate: FallbackChain,
}

impl ChainSet {
    pub fn for_task(&self, task: TaskKind) -> &FallbackChain {
        match task {
            TaskKind::Plan => &self.plan,
            TaskKind::Codegen => &self.codegen,
            TaskKind::Narrate => &self.narrate,
        }
    }
}

/// Shape of the optional YAML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    chains: Option<ChainsConfig>,
    invoker: Option<InvokerConfig>,
    /// Seconds between calls, per provider name.
    rate_limits: HashMap<String, f64>,
    execution_timeout_secs: Option<u64>,
    interpreter: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

/// Configuration for one or more pipeline runs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory receiving one subdirectory per run.
    pub output_dir: PathBuf,

    // Execution settings
    /// Wall-clock limit for the generated script.
    pub execution_timeout: Duration,
    /// Interpreter command for the generated script.
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,
    /// How long to wait for output streams after the script ends.
    pub reader_grace: Duration,

    // LLM settings
    pub invoker: InvokerConfig,
    /// Minimum spacing between calls to a provider without its own interval.
    pub min_interval: Duration,
    /// Per-provider call spacing.
    pub provider_intervals: HashMap<String, Duration>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub chains: ChainsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./runs"),

            execution_timeout: Duration::from_secs(120),
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            reader_grace: Duration::from_secs(2),

            invoker: InvokerConfig::default(),
            min_interval: DEFAULT_MIN_INTERVAL,
            provider_intervals: HashMap::new(),
            temperature: 0.2,
            max_tokens: 8192,
            chains: ChainsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AUTOANALYST_OUTPUT_DIR`: Run directory root (default: ./runs)
    /// - `AUTOANALYST_EXEC_TIMEOUT_SECS`: Script timeout in seconds (default: 120)
    /// - `AUTOANALYST_PYTHON`: Interpreter command (default: python3)
    /// - `AUTOANALYST_MAX_RETRIES`: Retries per provider link (default: 2)
    /// - `AUTOANALYST_CALL_TIMEOUT_SECS`: Timeout per provider call (default: 120)
    /// - `AUTOANALYST_ACQUIRE_TIMEOUT_SECS`: Longest rate limiter wait per call (default: 300)
    /// - `AUTOANALYST_MIN_INTERVAL_MS`: Default call spacing per provider (default: 3000)
    /// - `AUTOANALYST_TEMPERATURE`: Sampling temperature (default: 0.2)
    /// - `AUTOANALYST_MAX_TOKENS`: Completion token cap (default: 8192)
    /// - `AUTOANALYST_CONFIG`: YAML file applied on top of the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AUTOANALYST_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        // Execution settings
        if let Ok(val) = std::env::var("AUTOANALYST_EXEC_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AUTOANALYST_EXEC_TIMEOUT_SECS")?;
            config.execution_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AUTOANALYST_PYTHON") {
            config.interpreter = val;
        }

        // LLM settings
        if let Ok(val) = std::env::var("AUTOANALYST_MAX_RETRIES") {
            config.invoker.max_retries = parse_env_value(&val, "AUTOANALYST_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("AUTOANALYST_CALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AUTOANALYST_CALL_TIMEOUT_SECS")?;
            config.invoker.call_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AUTOANALYST_ACQUIRE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AUTOANALYST_ACQUIRE_TIMEOUT_SECS")?;
            config.invoker.acquire_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AUTOANALYST_MIN_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "AUTOANALYST_MIN_INTERVAL_MS")?;
            config.min_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("AUTOANALYST_TEMPERATURE") {
            config.temperature = parse_env_value(&val, "AUTOANALYST_TEMPERATURE")?;
        }

        if let Ok(val) = std::env::var("AUTOANALYST_MAX_TOKENS") {
            config.max_tokens = parse_env_value(&val, "AUTOANALYST_MAX_TOKENS")?;
        }

        if let Ok(val) = std::env::var("AUTOANALYST_CONFIG") {
            config = config.merge_file(Path::new(&val))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply a YAML file on top of this configuration.
    ///
    /// ```yaml
    /// chains:
    ///   codegen:
    ///     - { provider: groq, model: llama-3.3-70b-versatile }
    ///     - { provider: openrouter, model: meta-llama/llama-3.3-70b-instruct }
    /// rate_limits:
    ///   gemini: 3.0
    /// invoker:
    ///   max_retries: 3
    ///   acquire_timeout: 60
    /// ```
    pub fn merge_file(self, path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.merge_yaml(&text).map_err(|message| ConfigError::File {
            path: path.to_path_buf(),
            message,
        })
    }

    fn merge_yaml(mut self, text: &str) -> Result<Self, String> {
        let file: ConfigFile = serde_yaml::from_str(text).map_err(|e| e.to_string())?;

        if let Some(chains) = file.chains {
            self.chains = chains;
        }
        if let Some(invoker) = file.invoker {
            self.invoker = invoker;
        }
        for (provider, secs) in file.rate_limits {
            let interval = Duration::try_from_secs_f64(secs)
                .map_err(|e| format!("rate_limits.{}: {}", provider, e))?;
            self.provider_intervals.insert(provider, interval);
        }
        if let Some(secs) = file.execution_timeout_secs {
            self.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(interpreter) = file.interpreter {
            self.interpreter = interpreter;
        }
        if let Some(temperature) = file.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = file.max_tokens {
            self.max_tokens = max_tokens;
        }
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "execution_timeout must be greater than 0".to_string(),
            ));
        }

        if self.interpreter.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "interpreter cannot be empty".to_string(),
            ));
        }

        if self.invoker.call_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.invoker.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::ValidationFailed(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }

        // A limit below the slowest cooldown would fail every call that
        // follows another one to the same provider.
        let slowest = self
            .provider_intervals
            .values()
            .copied()
            .fold(self.min_interval, Duration::max);
        if self.invoker.acquire_timeout < slowest || self.invoker.acquire_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(format!(
                "acquire_timeout ({:?}) must be positive and at least the longest rate limit interval ({:?})",
                self.invoker.acquire_timeout, slowest
            )));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        for task in [TaskKind::Plan, TaskKind::Codegen, TaskKind::Narrate] {
            if self.chains.for_task(task).is_empty() {
                return Err(ConfigError::EmptyChain(task));
            }
        }

        Ok(())
    }

    /// Build the shared rate limiter.
    pub fn rate_limiter(&self) -> RateLimiter {
        self.provider_intervals.iter().fold(
            RateLimiter::new(self.min_interval),
            |limiter, (provider, interval)| limiter.with_interval(provider.clone(), *interval),
        )
    }

    /// Build the provider chains, dropping links whose API key is missing.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyChain` when a task is left with no link.
    pub fn build_chains(&self, keys: &ApiKeys) -> Result<ChainSet, ConfigError> {
        let mut providers: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        let mut build = |task: TaskKind| -> Result<FallbackChain, ConfigError> {
            let mut chain = FallbackChain::new(task);
            for link in self.chains.for_task(task) {
                let provider = match providers.get(&link.provider) {
                    Some(provider) => provider.clone(),
                    None => match build_provider(link.provider, keys, self.invoker.call_timeout) {
                        Ok(provider) => {
                            providers.insert(link.provider, provider.clone());
                            provider
                        }
                        Err(e) => {
                            tracing::warn!(
                                task = %task,
                                provider = %link.provider,
                                model = %link.model,
                                error = %e,
                                "Dropping provider from chain"
                            );
                            continue;
                        }
                    },
                };
                chain = chain.with_link(provider, link.model.clone());
            }
            if chain.is_empty() {
                return Err(ConfigError::EmptyChain(task));
            }
            Ok(chain)
        };

        Ok(ChainSet {
            plan: build(TaskKind::Plan)?,
            codegen: build(TaskKind::Codegen)?,
            narrate: build(TaskKind::Narrate)?,
        })
    }

    /// Builder method to set the run directory root.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder method to set the script timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Builder method to set the interpreter and its leading arguments.
    pub fn with_interpreter(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.interpreter = command.into();
        self.interpreter_args = args;
        self
    }

    /// Builder method to set the stream grace period.
    pub fn with_reader_grace(mut self, grace: Duration) -> Self {
        self.reader_grace = grace;
        self
    }

    /// Builder method to set retry and timeout behaviour.
    pub fn with_invoker(mut self, invoker: InvokerConfig) -> Self {
        self.invoker = invoker;
        self
    }

    /// Builder method to set the default call spacing.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Builder method to set call spacing for one provider.
    pub fn with_provider_interval(mut self, provider: impl Into<String>, interval: Duration) -> Self {
        self.provider_intervals.insert(provider.into(), interval);
        self
    }

    /// Builder method to set temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builder method to set the completion token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Builder method to set the provider chains.
    pub fn with_chains(mut self, chains: ChainsConfig) -> Self {
        self.chains = chains;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.execution_timeout, Duration::from_secs(120));
        assert_eq!(config.interpreter, "python3");
        assert_eq!(config.min_interval, Duration::from_secs(3));
        assert!((config.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.chains.plan[0].model, "gemini-2.5-flash");
        assert_eq!(config.chains.plan.len(), 3);
        assert_eq!(config.chains.codegen[0].provider, ProviderKind::Groq);
        assert_eq!(config.chains.codegen[1].provider, ProviderKind::Cerebras);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_output_dir("/tmp/out")
            .with_execution_timeout(Duration::from_secs(30))
            .with_interpreter("sh", vec!["-e".to_string()])
            .with_min_interval(Duration::from_millis(10))
            .with_provider_interval("gemini", Duration::from_secs(5))
            .with_temperature(0.5)
            .with_max_tokens(1024);

        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.interpreter, "sh");
        assert_eq!(config.interpreter_args, vec!["-e".to_string()]);
        assert_eq!(config.max_tokens, 1024);

        let limiter = config.rate_limiter();
        assert_eq!(limiter.interval_for("gemini"), Duration::from_secs(5));
        assert_eq!(limiter.interval_for("groq"), Duration::from_millis(10));
    }

    #[test]
    fn test_validation_failures() {
        let err = PipelineConfig::default()
            .with_execution_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("execution_timeout"));

        let err = PipelineConfig::default()
            .with_temperature(3.0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("temperature"));

        let mut chains = ChainsConfig::default();
        chains.narrate.clear();
        let err = PipelineConfig::default()
            .with_chains(chains)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyChain(TaskKind::Narrate)));

        let err = PipelineConfig::default()
            .with_invoker(InvokerConfig {
                max_retries: u32::MAX,
                ..Default::default()
            })
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_acquire_timeout_must_cover_slowest_interval() {
        let short = InvokerConfig {
            acquire_timeout: Duration::from_secs(4),
            ..Default::default()
        };
        let config = PipelineConfig::default().with_invoker(short.clone());
        assert!(config.validate().is_ok());

        let err = config
            .with_provider_interval("gemini", Duration::from_secs(10))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("acquire_timeout"));

        let err = PipelineConfig::default()
            .with_invoker(InvokerConfig {
                acquire_timeout: Duration::ZERO,
                ..short
            })
            .with_min_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("acquire_timeout"));
    }

    #[test]
    fn test_merge_yaml() {
        let yaml = r#"
chains:
  codegen:
    - { provider: openrouter, model: meta-llama/llama-3.3-70b-instruct }
rate_limits:
  gemini: 1.5
invoker:
  max_retries: 4
  acquire_timeout: 30
execution_timeout_secs: 45
"#;
        let config = PipelineConfig::default().merge_yaml(yaml).unwrap();
        assert_eq!(config.chains.codegen.len(), 1);
        assert_eq!(config.chains.codegen[0].provider, ProviderKind::OpenRouter);
        // Tasks missing from the file fall back to defaults.
        assert_eq!(config.chains.plan, ChainsConfig::default().plan);
        assert_eq!(
            config.provider_intervals.get("gemini"),
            Some(&Duration::from_millis(1500))
        );
        assert_eq!(config.invoker.max_retries, 4);
        assert_eq!(config.invoker.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.invoker.call_timeout, InvokerConfig::default().call_timeout);
        assert_eq!(config.execution_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_merge_yaml_rejects_unknown_keys() {
        let err = PipelineConfig::default()
            .merge_yaml("docker_image: python\n")
            .unwrap_err();
        assert!(err.contains("docker_image"));
    }

    #[test]
    fn test_build_chains_drops_links_without_keys() {
        let keys = ApiKeys::default()
            .with_key(ProviderKind::Gemini, "g-key")
            .with_key(ProviderKind::Cerebras, "c-key");
        let chains = PipelineConfig::default().build_chains(&keys).unwrap();

        assert_eq!(chains.plan.links().len(), 3);
        assert_eq!(chains.codegen.links().len(), 1);
        assert_eq!(chains.codegen.links()[0].provider.name(), "cerebras");
        assert_eq!(chains.for_task(TaskKind::Narrate).links().len(), 3);
    }

    #[test]
    fn test_build_chains_fails_when_a_task_has_no_keys() {
        let keys = ApiKeys::default().with_key(ProviderKind::Groq, "k");
        let err = PipelineConfig::default().build_chains(&keys).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyChain(TaskKind::Plan)));
    }
}
