//! Ordered provider/model chains per logical task.
//!
//! A chain tries its primary link through the [`ProviderInvoker`] with a full
//! retry budget, then each fallback in turn with a fresh budget. The first
//! response that passes the task's shape check wins. The chain only fails
//! once every link is exhausted, and the error then lists every attempt.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::invoker::{ProviderAttempt, ProviderInvoker};
use super::types::{GenerationRequest, GenerationResponse, LlmProvider};

/// Logical tasks that call a language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Plan,
    Codegen,
    Narrate,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Plan => "plan",
            TaskKind::Codegen => "codegen",
            TaskKind::Narrate => "narrate",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plan" => Ok(TaskKind::Plan),
            "codegen" | "generate" => Ok(TaskKind::Codegen),
            "narrate" | "narrative" => Ok(TaskKind::Narrate),
            other => Err(format!("Unknown task: {}", other)),
        }
    }
}

/// One provider/model pair in a chain.
#[derive(Clone)]
pub struct ChainLink {
    pub provider: Arc<dyn LlmProvider>,
    pub model: String,
}

impl fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider.name(), self.model)
    }
}

/// The winning link and its validated value.
#[derive(Debug, Clone)]
pub struct ChainSuccess<T> {
    pub value: T,
    pub provider: String,
    pub model: String,
}

/// Chain failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChainError {
    #[error("No providers configured for task '{task}'")]
    Empty { task: TaskKind },

    #[error("All providers failed for task '{task}': {}", summarize(.attempts))]
    Exhausted {
        task: TaskKind,
        attempts: Vec<ProviderAttempt>,
    },
}

fn summarize(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .enumerate()
        .map(|(i, a)| format!("[{}] {}/{}: {}", i + 1, a.provider, a.model, a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A primary link followed by fallbacks for one task.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    task: TaskKind,
    links: Vec<ChainLink>,
}

impl FallbackChain {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            links: Vec::new(),
        }
    }

    /// Append a link; the first one added is the primary.
    pub fn with_link(mut self, provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        self.links.push(ChainLink {
            provider,
            model: model.into(),
        });
        self
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn primary(&self) -> Option<&ChainLink> {
        self.links.first()
    }

    pub fn fallbacks(&self) -> &[ChainLink] {
        self.links.get(1..).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run the chain.
    ///
    /// `request.model` is replaced by each link's model. The attempt log is
    /// returned alongside the result in both the success and failure cases.
    pub async fn run<T, F>(
        &self,
        invoker: &ProviderInvoker,
        request: &GenerationRequest,
        validate: F,
    ) -> (Result<ChainSuccess<T>, ChainError>, Vec<ProviderAttempt>)
    where
        F: Fn(&GenerationResponse) -> Result<T, String>,
    {
        let mut attempts = Vec::new();

        if self.links.is_empty() {
            return (Err(ChainError::Empty { task: self.task }), attempts);
        }

        for (position, link) in self.links.iter().enumerate() {
            let link_request = request.for_model(&link.model);
            match invoker
                .invoke_with(link.provider.as_ref(), &link_request, &validate, &mut attempts)
                .await
            {
                Ok(value) => {
                    if position > 0 {
                        tracing::info!(
                            task = %self.task,
                            provider = link.provider.name(),
                            model = %link.model,
                            "Fallback provider succeeded"
                        );
                    }
                    let success = ChainSuccess {
                        value,
                        provider: link.provider.name().to_string(),
                        model: link.model.clone(),
                    };
                    return (Ok(success), attempts);
                }
                Err(e) => {
                    tracing::warn!(
                        task = %self.task,
                        provider = link.provider.name(),
                        model = %link.model,
                        error = %e,
                        "Provider failed, trying next in fallback chain"
                    );
                }
            }
        }

        let error = ChainError::Exhausted {
            task: self.task,
            attempts: attempts.clone(),
        };
        (Err(error), attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::clock::ManualClock;
    use crate::llm::invoker::InvokerConfig;
    use crate::llm::mock::ScriptedProvider;
    use crate::llm::rate_limiter::RateLimiter;
    use crate::llm::Message;
    use std::time::Duration;

    fn invoker(max_retries: u32) -> ProviderInvoker {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(Duration::from_secs(3), clock));
        ProviderInvoker::new(
            limiter,
            InvokerConfig {
                max_retries,
                ..Default::default()
            },
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("", vec![Message::user("plan please")])
    }

    fn parse_json(r: &GenerationResponse) -> Result<serde_json::Value, String> {
        serde_json::from_str(r.first_content().unwrap_or_default()).map_err(|e| e.to_string())
    }

    #[tokio::test]
    async fn test_primary_success_makes_one_attempt() {
        let primary = Arc::new(ScriptedProvider::new("gemini").reply(r#"{"ok": true}"#));
        let chain = FallbackChain::new(TaskKind::Plan).with_link(primary.clone(), "gemini-2.5-flash");

        let (result, attempts) = chain.run(&invoker(2), &request(), parse_json).await;

        let success = result.unwrap();
        assert_eq!(success.provider, "gemini");
        assert_eq!(success.model, "gemini-2.5-flash");
        assert_eq!(attempts.len(), 1);
        assert_eq!(primary.requests()[0].model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_fatal_primary_falls_back() {
        let primary = Arc::new(ScriptedProvider::new("groq").fail(LlmError::ApiError {
            code: 401,
            message: "invalid api key".to_string(),
        }));
        let fallback = Arc::new(ScriptedProvider::new("cerebras").reply(r#"{"ok": 1}"#));
        let chain = FallbackChain::new(TaskKind::Codegen)
            .with_link(primary.clone(), "llama-3.3-70b-versatile")
            .with_link(fallback.clone(), "llama-3.3-70b");

        let (result, attempts) = chain.run(&invoker(3), &request(), parse_json).await;

        let success = result.unwrap();
        assert_eq!(success.provider, "cerebras");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome.label(), "fatal_error");
        assert!(attempts[1].outcome.is_ok());
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_primary_then_valid_fallback() {
        let primary = Arc::new(
            ScriptedProvider::new("gemini")
                .reply("not json at all")
                .reply("{still not"),
        );
        let fallback = Arc::new(ScriptedProvider::new("gemini").reply(r#"{"a": 1}"#));
        let chain = FallbackChain::new(TaskKind::Plan)
            .with_link(primary, "gemini-2.5-flash")
            .with_link(fallback, "gemini-1.5-flash");

        let (result, attempts) = chain.run(&invoker(1), &request(), parse_json).await;

        let success = result.unwrap();
        assert_eq!(success.model, "gemini-1.5-flash");
        assert_eq!(success.value["a"], 1);
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().filter(|a| !a.outcome.is_ok()).count(),
            2
        );
        assert!(attempts[2].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_all_links_exhausted_lists_every_attempt() {
        let primary = Arc::new(
            ScriptedProvider::new("groq")
                .fail(LlmError::RequestFailed("reset".to_string()))
                .fail(LlmError::RequestFailed("reset".to_string())),
        );
        let fallback = Arc::new(ScriptedProvider::new("cerebras").fail(LlmError::ApiError {
            code: 403,
            message: "forbidden".to_string(),
        }));
        let chain = FallbackChain::new(TaskKind::Codegen)
            .with_link(primary, "a")
            .with_link(fallback, "b");

        let (result, attempts) = chain.run(&invoker(1), &request(), parse_json).await;

        assert_eq!(attempts.len(), 3);
        let err = result.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("[1] groq/a: transient error"));
        assert!(text.contains("[3] cerebras/b: fatal error"));
        match err {
            ChainError::Exhausted { task, attempts } => {
                assert_eq!(task, TaskKind::Codegen);
                assert_eq!(attempts.len(), 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let chain = FallbackChain::new(TaskKind::Narrate);
        let (result, attempts) = chain.run(&invoker(1), &request(), parse_json).await;
        assert_eq!(
            result.unwrap_err(),
            ChainError::Empty {
                task: TaskKind::Narrate
            }
        );
        assert!(attempts.is_empty());
    }

    #[test]
    fn test_task_kind_from_str() {
        assert_eq!("codegen".parse::<TaskKind>(), Ok(TaskKind::Codegen));
        assert_eq!("Narrative".parse::<TaskKind>(), Ok(TaskKind::Narrate));
        assert!("compile".parse::<TaskKind>().is_err());
    }
}
