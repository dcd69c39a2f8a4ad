//! Reasoning backend abstraction.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: u64,
    pub temperature: f64,
    /// Optional system preamble sent ahead of the prompt.
    pub system_prompt: Option<String>,
    /// Upper bound on a single backend call. Enforced by the adapter.
    pub timeout: Duration,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.2,
            system_prompt: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl GenerateOptions {
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Token usage from an LLM call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
}

/// A reasoning backend.
///
/// Any error is terminal for the OBSERVE step that issued the call. Retries
/// and timeouts are the implementation's own business.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Generation, LlmError>;
}
