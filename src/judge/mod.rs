//! LLM-as-judge backends used by the judged metrics.

pub mod openai;

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{error::JudgeError, types::TokenUsage};

pub use openai::{OpenAIJudge, OpenAIJudgeConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeCompletion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl JudgeCompletion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

#[async_trait]
pub trait JudgeModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<JudgeCompletion, JudgeError>;

    fn name(&self) -> &str {
        "judge"
    }
}

/// Replays canned completions in order; for offline runs and tests.
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    responses: Mutex<VecDeque<JudgeCompletion>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedJudge {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = JudgeCompletion>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JudgeModel for ScriptedJudge {
    async fn complete(&self, prompt: &str) -> Result<JudgeCompletion, JudgeError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.responses
            .lock()
            .map_err(|_| JudgeError::Provider("scripted judge lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| JudgeError::Provider("no more scripted responses".to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
