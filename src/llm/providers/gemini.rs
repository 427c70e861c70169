//! Google Gemini adapter over the `generateContent` REST endpoint.
//!
//! System messages are folded into `systemInstruction`; assistant turns are
//! sent with the `model` role. Quota errors keep the raw error body as the
//! message so the invoker can read the `retryDelay` hint out of it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::openai_compat::mask_key;
use crate::error::LlmError;
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider, Role, Usage};

/// Gemini REST API root.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Adapter for the Gemini API.
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    request_timeout: Duration,
}

impl GeminiProvider {
    /// Create a Gemini adapter against the public endpoint.
    pub fn new(api_key: impl Into<String>, request_timeout: Duration) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, GEMINI_BASE_URL, request_timeout)
    }

    /// Create a Gemini adapter against a custom endpoint (proxies, tests).
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            request_timeout,
        })
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        mask_key(&self.api_key)
    }

    fn build_body(request: &GenerationRequest) -> GeminiRequest {
        let system_text: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| GeminiContent {
                role: Some(match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                }
                .to_string()),
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();

        let system_instruction = if system_text.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart {
                    text: system_text.join("\n\n"),
                }],
            })
        };

        let generation_config =
            if request.temperature.is_none() && request.max_tokens.is_none() {
                None
            } else {
                Some(GenerationConfig {
                    temperature: request.temperature,
                    max_output_tokens: request.max_tokens,
                })
            };

        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let body = Self::build_body(&request);

        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
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
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let parsed = serde_json::from_str::<GeminiErrorResponse>(&error_text).ok();
            let exhausted = parsed
                .as_ref()
                .and_then(|p| p.error.status.as_deref())
                .is_some_and(|s| s == "RESOURCE_EXHAUSTED");

            if status_code == 429 || exhausted {
                return Err(LlmError::RateLimited {
                    message: error_text,
                    retry_after: None,
                });
            }

            return Err(LlmError::ApiError {
                code: status_code,
                message: parsed.map(|p| p.error.message).unwrap_or(error_text),
            });
        }

        let api_response: GeminiResponse = http_response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse Gemini response: {}", e)))?;

        // Candidate text arrives split across parts; `MAX_TOKENS` lowercases
        // to the stop reason the Generate stage treats as a cut-off script.
        let (content, finish_reason) = match api_response.candidates.into_iter().next() {
            Some(candidate) => (
                candidate
                    .content
                    .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
                    .unwrap_or_default(),
                candidate.finish_reason.map(|r| r.to_lowercase()),
            ),
            None => (String::new(), None),
        };

        let usage = api_response
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(GenerationResponse {
            model: api_response.model_version.unwrap_or(request.model),
            content,
            finish_reason,
            usage,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[test]
    fn test_build_body_folds_system_messages() {
        let request = GenerationRequest::new(
            "gemini-2.5-flash",
            vec![
                Message::system("You are a senior data analyst."),
                Message::user("Profile follows"),
                Message::assistant("ok"),
            ],
        )
        .with_temperature(0.3);

        let body = GeminiProvider::build_body(&request);
        let json = serde_json::to_value(&body).expect("serializable");

        assert_eq!(
            json["systemInstruction"]["parts"][0]["text"],
            "You are a senior data analyst."
        );
        assert_eq!(json["contents"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["generationConfig"]["temperature"], 0.3);
        assert!(json["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn test_build_body_without_sampling() {
        let request = GenerationRequest::new("m", vec![Message::user("hi")]);
        let json = serde_json::to_value(GeminiProvider::build_body(&request)).expect("json");
        assert!(json.get("generationConfig").is_none());
        assert!(json.get("systemInstruction").is_none());
    }

    #[test]
    fn test_parse_response_shape() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "{\"a\":"}, {"text": "1}"}], "role": "model"},
                            "finishReason": "STOP", "index": 0}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3, "totalTokenCount": 15},
            "modelVersion": "gemini-2.5-flash"
        }"#;
        let parsed: GeminiResponse = serde_json::from_str(raw).expect("valid");
        assert_eq!(parsed.candidates.len(), 1);
        let usage = parsed.usage_metadata.expect("usage");
        assert_eq!(usage.prompt_token_count + usage.candidates_token_count, 15);
    }

    #[test]
    fn test_parse_quota_error() {
        let raw = r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED",
            "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "27s"}]}}"#;
        let parsed: GeminiErrorResponse = serde_json::from_str(raw).expect("valid");
        assert_eq!(parsed.error.status.as_deref(), Some("RESOURCE_EXHAUSTED"));
    }
}
