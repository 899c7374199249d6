//! Shared test helpers and mock provider.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use narrator::config::NarratorConfig;
use narrator::error::NarratorError;
use narrator::provider::{ModelProvider, ProviderRequest, ProviderResponse};
use narrator::store::Fields;
use narrator::types::{ChatMessage, Role, Usage};
use narrator::workflow::WorkflowMode;

/// A mock provider that returns canned responses and records requests.
pub struct MockProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, NarratorError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a final text turn.
    pub fn queue_response(&self, text: &str) -> &Self {
        let mut response = ProviderResponse::text(text);
        response.usage = Usage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            ..Default::default()
        };
        self.responses.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Queue a turn with one tool call.
    pub fn queue_tool_call(&self, name: &str, args: serde_json::Value) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(ProviderResponse::tool_calls([(name, args)])));
        self
    }

    pub fn queue_error(&self, error: NarratorError) -> &Self {
        self.responses.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, NarratorError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(ProviderResponse::text("")))
    }
}

pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().expect("object")
}

/// Default config running the given workflow mode.
pub fn config(mode: WorkflowMode) -> NarratorConfig {
    let mut config = NarratorConfig::default();
    config.workflow.mode = mode;
    config
}

/// Alternating user/assistant turns.
pub fn transcript(turns: &[(&str, &str)]) -> Vec<ChatMessage> {
    turns
        .iter()
        .flat_map(|(user, assistant)| {
            [ChatMessage::user(*user), ChatMessage::assistant(*assistant)]
        })
        .collect()
}

/// Text of the newest user message in a request.
pub fn last_user_text(request: &ProviderRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
        .unwrap_or_default()
}

pub fn shared(provider: MockProvider) -> Arc<MockProvider> {
    Arc::new(provider)
}
