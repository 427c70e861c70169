//! Vendor adapters behind the [`LlmProvider`] interface.
//!
//! - [`OpenAiCompatProvider`] serves Groq, Cerebras and OpenRouter
//! - [`GeminiProvider`] serves Google Gemini

pub mod gemini;
pub mod openai_compat;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;

pub use super::types::LlmProvider;
use crate::error::LlmError;

/// Supported provider vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    Groq,
    Cerebras,
    #[serde(rename = "openrouter", alias = "open_router")]
    OpenRouter,
}

impl ProviderKind {
    /// Environment variables holding the API key, in lookup order.
    pub fn key_vars(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::Gemini => &["GOOGLE_API_KEY", "GOOGLE_GEMINI_API_KEY"],
            ProviderKind::Groq => &["GROQ_API_KEY"],
            ProviderKind::Cerebras => &["CEREBRAS_API_KEY"],
            ProviderKind::OpenRouter => &["OPENROUTER_API_KEY"],
        }
    }

    /// Stable provider name, also the rate limiter key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Groq => "groq",
            ProviderKind::Cerebras => "cerebras",
            ProviderKind::OpenRouter => "openrouter",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "groq" => Ok(ProviderKind::Groq),
            "cerebras" => Ok(ProviderKind::Cerebras),
            "openrouter" | "open_router" => Ok(ProviderKind::OpenRouter),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// API keys resolved from the environment.
#[derive(Clone, Default)]
pub struct ApiKeys {
    keys: Vec<(ProviderKind, String)>,
}

impl ApiKeys {
    /// Read every known provider key from the environment.
    pub fn from_env() -> Self {
        let mut keys = Self::default();
        for kind in [
            ProviderKind::Gemini,
            ProviderKind::Groq,
            ProviderKind::Cerebras,
            ProviderKind::OpenRouter,
        ] {
            let found = kind
                .key_vars()
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
            if let Some(key) = found {
                keys = keys.with_key(kind, key);
            }
        }
        keys
    }

    /// Set the key for a provider.
    pub fn with_key(mut self, kind: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.retain(|(k, _)| *k != kind);
        self.keys.push((kind, key.into()));
        self
    }

    /// Look up the key for a provider.
    pub fn get(&self, kind: ProviderKind) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present: Vec<&str> = self.keys.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ApiKeys").field("present", &present).finish()
    }
}

/// Build the adapter for a provider kind.
///
/// # Errors
///
/// Returns `LlmError::MissingApiKey` when no key is configured for `kind`.
pub fn build_provider(
    kind: ProviderKind,
    keys: &ApiKeys,
    request_timeout: Duration,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let key = keys
        .get(kind)
        .ok_or_else(|| LlmError::MissingApiKey(kind.key_vars().join(" or ")))?;

    let provider: Arc<dyn LlmProvider> = match kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(key, request_timeout)?),
        ProviderKind::Groq => Arc::new(OpenAiCompatProvider::groq(key, request_timeout)?),
        ProviderKind::Cerebras => Arc::new(OpenAiCompatProvider::cerebras(key, request_timeout)?),
        ProviderKind::OpenRouter => {
            Arc::new(OpenAiCompatProvider::openrouter(key, request_timeout)?)
        }
    };
    Ok(provider)
}
