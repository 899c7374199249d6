//! Model provider trait and implementations.

pub mod http;
pub mod openai;
pub mod scripted;

pub use openai::OpenAiCompatibleProvider;
pub use scripted::ScriptedProvider;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ModelConfig;
use crate::error::NarratorError;
use crate::types::{FinishReason, GenerationSettings, ModelMessage, ToolCall, Usage};

/// A request sent to a model provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ModelMessage>,
    pub settings: GenerationSettings,
    pub tools: Vec<ToolDefinition>,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Response from a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    /// Reasoning the model exposed separately from its answer.
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
}

impl ProviderResponse {
    /// A plain answer with no tool calls.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }
    }

    /// A response requesting the given `(name, arguments)` calls.
    pub fn tool_calls<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = (S, serde_json::Value)>,
        S: Into<String>,
    {
        Self {
            tool_calls: calls
                .into_iter()
                .enumerate()
                .map(|(i, (name, arguments))| ToolCall {
                    id: format!("call_{}", i + 1),
                    name: name.into(),
                    arguments,
                })
                .collect(),
            finish_reason: Some(FinishReason::ToolCalls),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Core trait implemented by all model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "openai-compatible").
    fn provider_name(&self) -> &str;
    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    /// Produce the next assistant turn (non-streaming).
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, NarratorError>;
}

/// Build the configured provider.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>, NarratorError> {
    if config.model.trim().is_empty() {
        return Err(NarratorError::Configuration(
            "model.model must name the workflow model".into(),
        ));
    }
    Ok(Arc::new(OpenAiCompatibleProvider::new(
        config.model.clone(),
        config.api_key.clone().unwrap_or_default(),
        config.base_url.clone(),
        std::time::Duration::from_secs(config.request_timeout_secs),
    )))
}
