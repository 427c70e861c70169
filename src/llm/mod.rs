//! Language-model access for the pipeline.
//!
//! Layers, leaves first:
//!
//! - [`RateLimiter`]: per-provider minimum spacing, shared process-wide
//! - [`ProviderInvoker`]: one provider/model with timeout, classification and retry
//! - [`FallbackChain`]: primary plus fallbacks per task
//!
//! ```ignore
//! use std::sync::Arc;
//! use autoanalyst::llm::{FallbackChain, InvokerConfig, ProviderInvoker, RateLimiter, TaskKind};
//!
//! let limiter = Arc::new(RateLimiter::default());
//! let invoker = ProviderInvoker::new(limiter, InvokerConfig::default());
//! let chain = FallbackChain::new(TaskKind::Plan).with_link(gemini, "gemini-2.5-flash");
//! let (result, attempts) = chain.run(&invoker, &request, validate_plan).await;
//! ```

pub mod clock;
pub mod fallback;
pub mod invoker;
pub mod mock;
pub mod providers;
pub mod rate_limiter;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fallback::{ChainError, ChainLink, ChainSuccess, FallbackChain, TaskKind};
pub use invoker::{
    classify, parse_retry_hint, AttemptOutcome, FailureKind, InvokeError, InvokerConfig,
    ProviderAttempt, ProviderInvoker,
};
pub use providers::{build_provider, ApiKeys, GeminiProvider, OpenAiCompatProvider, ProviderKind};
pub use rate_limiter::{RateLimitError, RateLimiter, DEFAULT_MIN_INTERVAL};
pub use types::{GenerationRequest, GenerationResponse, LlmProvider, Message, Role, Usage};
