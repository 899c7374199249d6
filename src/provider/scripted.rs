//! Deterministic provider that replays scripted turns.
//!
//! Used for offline runs and tests. Turns come from a queue or from a
//! responder closure that sees each request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelProvider, ProviderRequest, ProviderResponse};
use crate::error::NarratorError;

type Responder =
    dyn Fn(&ProviderRequest) -> Result<ProviderResponse, NarratorError> + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<Result<ProviderResponse, String>>>),
    Responder(Arc<Responder>),
}

/// A provider that answers from a script.
pub struct ScriptedProvider {
    model_id: String,
    script: Script,
    delay: Option<Duration>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    /// Replay `responses` in order, then answer with an empty final turn.
    pub fn new(responses: impl IntoIterator<Item = ProviderResponse>) -> Self {
        Self {
            model_id: "scripted".into(),
            script: Script::Queue(Mutex::new(responses.into_iter().map(Ok).collect())),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Compute each turn from the request.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ProviderRequest) -> Result<ProviderResponse, NarratorError> + Send + Sync + 'static,
    {
        Self {
            model_id: "scripted".into(),
            script: Script::Responder(Arc::new(responder)),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a provider failure as the next turn (queue scripts only).
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Script::Queue(queue) = &self.script {
            queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(Err(message.into()));
        }
        self
    }

    /// Sleep before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, NarratorError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.script {
            Script::Responder(responder) => responder(request),
            Script::Queue(queue) => {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                match next {
                    Some(Ok(response)) => Ok(response),
                    Some(Err(message)) => Err(NarratorError::Provider {
                        provider: "scripted".into(),
                        message,
                    }),
                    None => Ok(ProviderResponse::text("")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationSettings, ModelMessage};

    fn request() -> ProviderRequest {
        ProviderRequest {
            messages: vec![ModelMessage::user("hello")],
            settings: GenerationSettings::default(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn queue_replays_in_order_then_fails() {
        let provider = ScriptedProvider::new([ProviderResponse::text("one")]).then_fail("down");

        assert_eq!(provider.complete(&request()).await.unwrap().text, "one");
        assert!(provider.complete(&request()).await.is_err());
        assert_eq!(provider.complete(&request()).await.unwrap().text, "");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn responder_sees_request() {
        let provider = ScriptedProvider::from_fn(|req| {
            Ok(ProviderResponse::text(format!("{} messages", req.messages.len())))
        });
        assert_eq!(provider.complete(&request()).await.unwrap().text, "1 messages");
    }
}
