//! Subprocess sandbox for generated analysis scripts.
//!
//! The isolation here is for reliability, not security: the script runs as
//! a child process with its own working directory, a clean artifact
//! directory, a hard wall-clock limit and captured output streams.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::report::{ExecutionReport, ExitStatus, StdoutDocument};
use crate::cancel::CancelSignal;
use crate::metrics::MetricsCollector;

/// File name of the script inside the work dir, overwritten on every run.
pub const SCRIPT_FILE_NAME: &str = "analysis.py";

/// Configuration for the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Program that runs the script (e.g. "python3").
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,
    /// Working directory of the child; the script is written here.
    pub work_dir: PathBuf,
    /// Directory scripts write artifacts into, exported as `ARTIFACT_DIR`.
    pub artifact_dir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// How long to wait for output streams after the child is gone.
    pub reader_grace: Duration,
}

impl SandboxConfig {
    /// Python sandbox rooted at `work_dir`, artifacts in `work_dir/charts`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            artifact_dir: work_dir.join("charts"),
            work_dir,
            env: vec![
                ("MPLBACKEND".to_string(), "Agg".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ],
            reader_grace: Duration::from_secs(2),
        }
    }

    /// Sets the interpreter and its leading arguments.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>, args: Vec<String>) -> Self {
        self.interpreter = interpreter.into();
        self.interpreter_args = args;
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_reader_grace(mut self, grace: Duration) -> Self {
        self.reader_grace = grace;
        self
    }
}

/// Error types for sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Failed to spawn '{interpreter}': {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs scripts under a timeout and collects what they leave behind.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    config: SandboxConfig,
    metrics: MetricsCollector,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `script` with `args` for at most `timeout`.
    ///
    /// The artifact directory is emptied first. Timeouts, crashes and
    /// cancellation are reported in the returned [`ExecutionReport`]; only
    /// failures to set up or start the child are errors.
    pub async fn run(
        &self,
        script: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<ExecutionReport, SandboxError> {
        self.prepare_dirs().await?;

        let script_path = self.config.work_dir.join(SCRIPT_FILE_NAME);
        tokio::fs::write(&script_path, script.as_bytes()).await?;
        let script_sha256 = hex::encode(Sha256::digest(script.as_bytes()));

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(&self.config.interpreter_args)
            .arg(&script_path)
            .args(args)
            .current_dir(&self.config.work_dir)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("ARTIFACT_DIR", &self.config.artifact_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            script = %script_path.display(),
            timeout_secs = timeout.as_secs_f64(),
            "Starting sandboxed script"
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            interpreter: self.config.interpreter.clone(),
            source,
        })?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let mut warnings = Vec::new();
        let exit_status = tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    ExitStatus::Completed
                } else {
                    ExitStatus::Crashed { code: status.code() }
                }
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Script exceeded its time limit, killing");
                kill(&mut child).await;
                warnings.push(format!("script killed after exceeding {:?}", timeout));
                ExitStatus::TimedOut
            }
            _ = cancel.cancelled() => {
                warn!("Run cancelled, killing script");
                kill(&mut child).await;
                warnings.push("script killed on cancellation".to_string());
                ExitStatus::Cancelled
            }
        };
        let duration = started.elapsed();

        let grace = self.config.reader_grace;
        let stdout_text = collect(stdout_reader, grace, "stdout", &mut warnings).await;
        let stderr_text = collect(stderr_reader, grace, "stderr", &mut warnings).await;

        let exit_code = match &exit_status {
            ExitStatus::Crashed { code } => {
                warnings.push(format!("script {}", exit_status));
                *code
            }
            ExitStatus::Completed => Some(0),
            _ => None,
        };

        let stdout_json = StdoutDocument::parse(&stdout_text);
        match &stdout_json {
            StdoutDocument::Raw(_) => warnings.push("stdout is not a JSON document".to_string()),
            StdoutDocument::Empty => warnings.push("script printed nothing to stdout".to_string()),
            StdoutDocument::Parsed(_) => {}
        }

        let artifact_paths = scan_artifacts(&self.config.artifact_dir);

        self.metrics.record_sandbox_run(exit_status.label());
        debug!(
            exit_status = exit_status.label(),
            artifacts = artifact_paths.len(),
            duration_ms = duration.as_millis() as u64,
            "Sandboxed script finished"
        );

        Ok(ExecutionReport {
            exit_status,
            exit_code,
            stdout_json,
            stdout_text,
            stderr_text,
            artifact_paths,
            script_path,
            script_sha256,
            duration_ms: duration.as_millis() as u64,
            warnings,
            coverage: Vec::new(),
        })
    }

    async fn prepare_dirs(&self) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| SandboxError::Setup(format!("Failed to create work dir: {}", e)))?;

        match tokio::fs::remove_dir_all(&self.config.artifact_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::Setup(format!(
                    "Failed to clear artifact dir: {}",
                    e
                )))
            }
        }
        tokio::fs::create_dir_all(&self.config.artifact_dir)
            .await
            .map_err(|e| SandboxError::Setup(format!("Failed to create artifact dir: {}", e)))?;
        Ok(())
    }
}

async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill script: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap script: {}", e);
    }
}

/// A stream being drained into a shared buffer by a background task.
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

fn spawn_reader<R>(mut stream: R) -> StreamCapture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]);
        }
    });
    StreamCapture { buf, handle }
}

/// Join a stream reader, giving up after `grace`.
///
/// A grandchild that inherited the pipe can keep it open after the script
/// is gone. In that case the reader is abandoned and whatever it captured so
/// far is returned with a warning.
async fn collect(
    capture: Option<StreamCapture>,
    grace: Duration,
    stream: &str,
    warnings: &mut Vec<String>,
) -> String {
    let Some(StreamCapture { buf, mut handle }) = capture else {
        return String::new();
    };

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warnings.push(format!("failed to read {}: {}", stream, e)),
        Ok(Err(e)) => warnings.push(format!("{} reader failed: {}", stream, e)),
        Err(_) => {
            handle.abort();
            warnings.push(format!("{} still open after the script ended", stream));
        }
    }

    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner);
    let text = String::from_utf8_lossy(&bytes).into_owned();
    text
}

/// Every file under `dir`, sorted by path.
pub fn scan_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}
