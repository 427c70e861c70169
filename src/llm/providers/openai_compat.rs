//! OpenAI-compatible provider adapter.
//!
//! Groq, Cerebras and OpenRouter all expose the `/chat/completions` endpoint
//! with the OpenAI request and response shape, so one adapter serves them all.
//! The adapter performs exactly one HTTP call per `generate`; retry, backoff
//! and rate limiting are owned by the invoker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};

/// Groq OpenAI-compatible endpoint.
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Cerebras OpenAI-compatible endpoint.
pub const CEREBRAS_BASE_URL: &str = "https://api.cerebras.ai/v1";

/// OpenRouter endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Adapter for any OpenAI-compatible chat completion API.
pub struct OpenAiCompatProvider {
    /// Provider name (e.g. "groq").
    name: String,
    /// HTTP client for making API requests.
    client: Client,
    /// API key for bearer authentication.
    api_key: String,
    /// Base URL, without the trailing `/chat/completions`.
    base_url: String,
    /// Per-request timeout configured on the HTTP client.
    request_timeout: Duration,
}

impl OpenAiCompatProvider {
    /// Create an adapter for an arbitrary OpenAI-compatible endpoint.
    ///
    /// # Arguments
    ///
    /// * `name` - Provider name used in logs and rate limiting
    /// * `base_url` - Base URL of the API
    /// * `api_key` - Bearer token
    /// * `request_timeout` - Hard limit for one HTTP exchange
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            request_timeout,
        })
    }

    /// Groq adapter.
    pub fn groq(api_key: impl Into<String>, request_timeout: Duration) -> Result<Self, LlmError> {
        Self::new("groq", GROQ_BASE_URL, api_key, request_timeout)
    }

    /// Cerebras adapter.
    pub fn cerebras(
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        Self::new("cerebras", CEREBRAS_BASE_URL, api_key, request_timeout)
    }

    /// OpenRouter adapter.
    pub fn openrouter(
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        Self::new("openrouter", OPENROUTER_BASE_URL, api_key, request_timeout)
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        mask_key(&self.api_key)
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute_request(&self, request: &ApiRequest) -> Result<GenerationResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.request_timeout)
                } else {
                    LlmError::RequestFailed(e.to_string())
                }
            })?;

        let status = http_response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let retry_after = http_response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);

            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|parsed| parsed.error.message)
                .unwrap_or(error_text);

            if status_code == 429 {
                return Err(LlmError::RateLimited {
                    message,
                    retry_after,
                });
            }
            return Err(LlmError::ApiError {
                code: status_code,
                message,
            });
        }

        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        // One completion is requested, so only the first choice matters.
        let (content, finish_reason) = match api_response.choices.into_iter().next() {
            Some(choice) => (
                choice.message.content.unwrap_or_default(),
                choice.finish_reason,
            ),
            None => (String::new(), None),
        };

        Ok(GenerationResponse {
            model: api_response.model.unwrap_or_else(|| request.model.clone()),
            content,
            finish_reason: finish_reason.map(|r| r.to_lowercase()),
            usage: api_response.usage.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let api_request = ApiRequest {
            model: request.model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        self.execute_request(&api_request).await
    }
}

/// Mask all but the first and last four characters of a key.
pub(crate) fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    /// Field names match [`Usage`]; `total_tokens` is ignored.
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_constructors() {
        let timeout = Duration::from_secs(30);
        let groq = OpenAiCompatProvider::groq("gsk-1234567890", timeout).expect("client");
        assert_eq!(groq.name(), "groq");
        assert_eq!(groq.base_url(), GROQ_BASE_URL);

        let cerebras = OpenAiCompatProvider::cerebras("csk", timeout).expect("client");
        assert_eq!(cerebras.name(), "cerebras");
        assert_eq!(cerebras.base_url(), CEREBRAS_BASE_URL);
    }

    #[test]
    fn test_api_key_masked() {
        let timeout = Duration::from_secs(5);
        let short = OpenAiCompatProvider::openrouter("abc", timeout).expect("client");
        assert_eq!(short.api_key_masked(), "***");

        let normal =
            OpenAiCompatProvider::openrouter("sk-1234567890abcdef", timeout).expect("client");
        assert_eq!(normal.api_key_masked(), "sk-1...cdef");
    }

    #[tokio::test]
    async fn test_generate_connection_error() {
        let provider = OpenAiCompatProvider::new(
            "local",
            "http://localhost:65535",
            "test-key",
            Duration::from_secs(5),
        )
        .expect("client");

        let request = GenerationRequest::new("test-model", vec![Message::user("test")]);
        let err = provider
            .generate(request)
            .await
            .expect_err("nothing listens on this port");

        assert!(matches!(
            err,
            LlmError::RequestFailed(_) | LlmError::Timeout(_)
        ));
    }

    #[test]
    fn test_api_request_serialization() {
        let request = ApiRequest {
            model: "llama-3.3-70b".to_string(),
            messages: vec![Message::user("Hello")],
            temperature: Some(0.2),
            max_tokens: None,
        };

        let json = serde_json::to_string(&request).expect("serialization should succeed");
        assert!(json.contains("\"model\":\"llama-3.3-70b\""));
        assert!(json.contains("\"temperature\":0.2"));
        assert!(!json.contains("max_tokens"));
    }

    #[test]
    fn test_response_with_null_content() {
        let raw = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":null}}]}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).expect("valid response");
        assert!(parsed.choices[0].message.content.is_none());
        assert!(parsed.usage.is_none());
    }

    #[test]
    fn test_response_usage_ignores_total() {
        let raw = r#"{"model":"llama-3.3-70b","choices":[{"message":{"content":"hi"},"finish_reason":"length"}],
            "usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).expect("valid response");
        let usage = parsed.usage.expect("usage present");
        assert_eq!(usage.total(), 42);
        assert_eq!(parsed.choices[0].finish_reason.as_deref(), Some("length"));
    }
}
