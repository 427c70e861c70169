//! Single-provider invocation with timeout, classification and retry.
//!
//! The invoker owns the retry budget for one provider/model pair. Every
//! network call is preceded by a rate limiter acquisition bounded by
//! `acquire_timeout`, and the call itself is bounded by `call_timeout`.
//! Failures are classified into three kinds:
//!
//! - `RateLimited`: HTTP 429 or `RESOURCE_EXHAUSTED`. If the provider suggests
//!   a wait, sleep `hint + retry_margin`; otherwise back off exponentially.
//! - `Transient`: timeouts (including a rate limiter wait that ran out),
//!   connection errors, 408/409/5xx, undecodable or invalid responses.
//!   Back off exponentially.
//! - `Fatal`: bad request, auth, unknown model, missing credentials. Never
//!   retried.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::Clock;
use super::rate_limiter::RateLimiter;
use super::types::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Retry and timeout settings for one provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// First exponential backoff delay.
    #[serde(with = "duration_secs")]
    pub base_backoff: Duration,
    /// Cap on exponential backoff.
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    /// Added on top of a provider-suggested wait.
    #[serde(with = "duration_secs")]
    pub retry_margin: Duration,
    /// Cap on a provider-suggested wait.
    #[serde(with = "duration_secs")]
    pub max_retry_wait: Duration,
    /// Hard limit on a single provider call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Longest wait for a rate limiter slot before the attempt fails.
    #[serde(with = "duration_secs")]
    pub acquire_timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            retry_margin: Duration::from_secs(5),
            max_retry_wait: Duration::from_secs(120),
            call_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(300),
        }
    }
}

impl InvokerConfig {
    /// Delay before retry number `step` (0-based) without a provider hint.
    pub fn backoff(&self, step: u32) -> Duration {
        let factor = 2u32.saturating_pow(step.min(16));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay honoring a provider-suggested wait.
    pub fn hinted_delay(&self, hint: Duration) -> Duration {
        hint.min(self.max_retry_wait) + self.retry_margin
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// How a failed call should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Quota exhausted, with the provider's suggested wait if it gave one.
    RateLimited(Option<Duration>),
    Transient,
    Fatal,
}

/// Classify a provider error.
pub fn classify(error: &LlmError) -> FailureKind {
    match error {
        LlmError::RateLimited {
            message,
            retry_after,
        } => FailureKind::RateLimited(retry_after.or_else(|| parse_retry_hint(message))),
        LlmError::ApiError { code, message } => {
            if *code == 429 || message.contains("RESOURCE_EXHAUSTED") {
                FailureKind::RateLimited(parse_retry_hint(message))
            } else if matches!(code, 408 | 409 | 425) || *code >= 500 {
                FailureKind::Transient
            } else {
                FailureKind::Fatal
            }
        }
        LlmError::Timeout(_)
        | LlmError::RequestFailed(_)
        | LlmError::ParseError(_)
        | LlmError::InvalidResponse(_)
        | LlmError::Throttled(_) => FailureKind::Transient,
        LlmError::MissingApiKey(_) | LlmError::ClientBuild(_) => FailureKind::Fatal,
    }
}

/// Parse a provider-suggested wait out of an error message.
///
/// Accepted forms, case-insensitive:
/// - `retry in 27.5s`, `retry in 800ms`
/// - `retry after 30` (seconds)
/// - `"retryDelay": "27s"`
///
/// Anything else yields `None` and the caller falls back to backoff.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    const NUMBER: &str = r"([0-9]+(?:\.[0-9]+)?)";

    let patterns = [
        format!(r"(?i)\bretry\s+in\s+{NUMBER}\s*(ms|s)\b"),
        format!(r"(?i)\bretry[\s-]+after\s*:?\s*{NUMBER}\s*(ms|s)?\b"),
        format!(r#"(?i)"?retryDelay"?\s*:\s*"{NUMBER}(ms|s)""#),
    ];

    for pattern in &patterns {
        let re = Regex::new(pattern).ok()?;
        let Some(caps) = re.captures(message) else {
            continue;
        };
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let secs = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(unit) if unit == "ms" => value / 1000.0,
            _ => value,
        };
        return Duration::try_from_secs_f64(secs).ok();
    }

    None
}

/// Result of one provider attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    RateLimited {
        retry_after_ms: Option<u64>,
        message: String,
    },
    TransientError {
        message: String,
    },
    FatalError {
        message: String,
    },
}

impl AttemptOutcome {
    fn from_failure(kind: FailureKind, error: &LlmError) -> Self {
        let message = error.to_string();
        match kind {
            FailureKind::RateLimited(hint) => AttemptOutcome::RateLimited {
                retry_after_ms: hint.map(|d| d.as_millis() as u64),
                message,
            },
            FailureKind::Transient => AttemptOutcome::TransientError { message },
            FailureKind::Fatal => AttemptOutcome::FatalError { message },
        }
    }

    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Ok => "ok",
            AttemptOutcome::RateLimited { .. } => "rate_limited",
            AttemptOutcome::TransientError { .. } => "transient_error",
            AttemptOutcome::FatalError { .. } => "fatal_error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AttemptOutcome::Ok)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Ok => f.write_str("ok"),
            AttemptOutcome::RateLimited {
                retry_after_ms: Some(ms),
                message,
            } => write!(f, "rate limited (retry after {}ms): {}", ms, message),
            AttemptOutcome::RateLimited { message, .. } => write!(f, "rate limited: {}", message),
            AttemptOutcome::TransientError { message } => write!(f, "transient error: {}", message),
            AttemptOutcome::FatalError { message } => write!(f, "fatal error: {}", message),
        }
    }
}

/// One call to one provider/model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

/// Terminal failure of one provider/model pair.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvokeError {
    #[error("{provider}/{model} failed fatally: {message}")]
    Fatal {
        provider: String,
        model: String,
        message: String,
    },

    #[error("{provider}/{model} exhausted {attempts} attempts, last error: {last}")]
    Exhausted {
        provider: String,
        model: String,
        attempts: u32,
        last: String,
    },
}

/// Calls one provider with rate limiting, timeout and retry.
#[derive(Clone)]
pub struct ProviderInvoker {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: InvokerConfig,
    metrics: MetricsCollector,
}

impl ProviderInvoker {
    /// Create an invoker sleeping on the limiter's clock.
    pub fn new(limiter: Arc<RateLimiter>, config: InvokerConfig) -> Self {
        let clock = limiter.clock();
        Self {
            limiter,
            clock,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Invoke without response-shape validation.
    pub async fn invoke(
        &self,
        provider: &dyn LlmProvider,
        request: &GenerationRequest,
        log: &mut Vec<ProviderAttempt>,
    ) -> Result<GenerationResponse, InvokeError> {
        self.invoke_with(provider, request, |r| Ok(r.clone()), log)
            .await
    }

    /// Invoke and accept only responses that `validate` turns into a `T`.
    ///
    /// A rejected response is a transient failure of that attempt. Every
    /// attempt is appended to `log`.
    pub async fn invoke_with<T, F>(
        &self,
        provider: &dyn LlmProvider,
        request: &GenerationRequest,
        validate: F,
        log: &mut Vec<ProviderAttempt>,
    ) -> Result<T, InvokeError>
    where
        F: Fn(&GenerationResponse) -> Result<T, String>,
    {
        let name = provider.name().to_string();
        let model = request.model.clone();
        let total = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let mut backoff_step: u32 = 0;

        loop {
            attempt += 1;
            let acquired = self
                .limiter
                .acquire_timeout(&name, self.config.acquire_timeout)
                .await;

            let started_at = Utc::now();
            let start = Instant::now();
            let result = match acquired {
                Ok(_) => match tokio::time::timeout(
                    self.config.call_timeout,
                    provider.generate(request.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(self.config.call_timeout)),
                },
                Err(throttled) => Err(throttled.into()),
            };
            let latency = start.elapsed();

            let error = match result {
                Ok(response) => match validate(&response) {
                    Ok(value) => {
                        self.record(log, &name, &model, started_at, latency, AttemptOutcome::Ok);
                        tracing::debug!(
                            provider = %name,
                            model = %model,
                            attempt = attempt,
                            latency_ms = latency.as_millis() as u64,
                            tokens = response.usage.total(),
                            "Provider call succeeded"
                        );
                        return Ok(value);
                    }
                    Err(reason) => LlmError::InvalidResponse(reason),
                },
                Err(error) => error,
            };

            let kind = classify(&error);
            let outcome = AttemptOutcome::from_failure(kind, &error);
            self.record(log, &name, &model, started_at, latency, outcome);

            if kind == FailureKind::Fatal {
                tracing::warn!(
                    provider = %name,
                    model = %model,
                    error = %error,
                    "Fatal provider error, not retrying"
                );
                return Err(InvokeError::Fatal {
                    provider: name,
                    model,
                    message: error.to_string(),
                });
            }

            if attempt >= total {
                return Err(InvokeError::Exhausted {
                    provider: name,
                    model,
                    attempts: attempt,
                    last: error.to_string(),
                });
            }

            let delay = match kind {
                FailureKind::RateLimited(Some(hint)) => self.config.hinted_delay(hint),
                _ => {
                    let delay = self.config.backoff(backoff_step);
                    backoff_step += 1;
                    delay
                }
            };

            tracing::warn!(
                provider = %name,
                model = %model,
                attempt = attempt,
                max_attempts = total,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Provider call failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    fn record(
        &self,
        log: &mut Vec<ProviderAttempt>,
        provider: &str,
        model: &str,
        started_at: DateTime<Utc>,
        latency: Duration,
        outcome: AttemptOutcome,
    ) {
        self.metrics
            .record_provider_attempt(provider, model, outcome.label(), latency);
        log.push(ProviderAttempt {
            provider: provider.to_string(),
            model: model.to_string(),
            started_at,
            outcome,
            latency_ms: latency.as_millis() as u64,
        });
    }
}

impl fmt::Debug for ProviderInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderInvoker")
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish()
    }
}
