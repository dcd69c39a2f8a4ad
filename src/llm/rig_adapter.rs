//! Bridges rig-core completion models to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};

use crate::error::LlmError;
use crate::llm::provider::{GenerateOptions, Generation, LlmProvider, TokenUsage};

/// Adapter wrapping any rig `CompletionModel`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<Generation, LlmError> {
        let mut builder = self
            .model
            .completion_request(prompt.to_string())
            .max_tokens(options.max_tokens)
            .temperature(options.temperature);
        if let Some(ref system) = options.system_prompt {
            builder = builder.preamble(system.clone());
        }

        let response = tokio::time::timeout(options.timeout, builder.send())
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.model_name.clone(),
                timeout: options.timeout,
            })?
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response contained no text".to_string(),
            });
        }

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Generation complete"
        );

        Ok(Generation {
            content,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        })
    }
}
