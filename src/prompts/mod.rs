//! Prompts for the three model-backed stages.
//!
//! - [`plan`] - profile to analysis plan
//! - [`codegen`] - profile and plan to a runnable analysis script
//! - [`narrative`] - execution results to the report narrative
//!
//! ```ignore
//! use autoanalyst::prompts::build_plan_prompt;
//! let prompt = build_plan_prompt(&profile);
//! let messages = prompt.into_messages();
//! ```

pub mod codegen;
pub mod narrative;
pub mod plan;

pub use codegen::build_codegen_prompt;
pub use narrative::{build_narrative_prompt, NarrativeInput};
pub use plan::build_plan_prompt;

use crate::llm::Message;

/// A system and user message pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

/// Pretty JSON for embedding in a prompt.
pub(crate) fn to_pretty_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}
