//! Scripted provider used by unit and integration tests.
//!
//! Each call to `generate` pops the next step off the script. Running past
//! the end of the script yields a 400 error, which the invoker treats as
//! fatal, so a mis-scripted test fails fast instead of retrying forever.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::types::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::error::LlmError;

enum Step {
    Reply(String),
    Fail(LlmError),
    Stall(Duration, String),
}

/// A provider that replays a fixed script of replies and errors.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, step: Step) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    /// Queue a successful reply.
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.push(Step::Reply(content.into()))
    }

    /// Queue an error.
    pub fn fail(self, error: LlmError) -> Self {
        self.push(Step::Fail(error))
    }

    /// Queue a reply delivered only after `delay`.
    pub fn stall(self, delay: Duration, content: impl Into<String>) -> Self {
        self.push(Step::Stall(delay, content.into()))
    }

    /// Number of `generate` calls made so far.
    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let model = request.model.clone();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match step {
            Some(Step::Reply(content)) => Ok(GenerationResponse::new(&model, content)),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Stall(delay, content)) => {
                tokio::time::sleep(delay).await;
                Ok(GenerationResponse::new(&model, content))
            }
            None => Err(LlmError::ApiError {
                code: 400,
                message: format!("{} has no scripted response left", self.name),
            }),
        }
    }
}
