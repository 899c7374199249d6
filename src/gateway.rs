//! Inbound request flow: directives first, then a workflow admission, then
//! scenario injection ahead of the forwarded messages.

use std::sync::Arc;

use futures::stream::BoxStream;
use tracing::debug;

use crate::agent_loop::RunStatus;
use crate::command::{CommandReply, CommandRouter};
use crate::config::NarratorConfig;
use crate::error::NarratorError;
use crate::history::{inject_scenario, InjectOptions};
use crate::provider::{create_provider, ModelProvider};
use crate::scheduler::{Admission, AdmissionMode, StreamingAdmission, UpdateScheduler};
use crate::session::SessionCatalog;
use crate::stream_transform::{Frame, StreamEventConverter};
use crate::types::ChatMessage;
use crate::workflow::WorkflowEngine;

/// Outcome of [`Narrator::prepare`].
#[derive(Debug)]
pub enum Prepared {
    /// A directive was answered; nothing goes upstream.
    Reply(CommandReply),
    /// Messages to forward upstream, scenario injected.
    Forward {
        messages: Vec<ChatMessage>,
        admission: Admission,
    },
}

/// Outcome of [`Narrator::prepare_streaming`].
pub enum PreparedStream {
    /// A directive was answered; `sse` holds it as one `chat.completion.chunk`
    /// line followed by `data: [DONE]`.
    Reply { reply: CommandReply, sse: String },
    /// Progress frames of the run; call [`Narrator::inject`] once they end.
    Progress {
        admission: StreamingAdmission,
        frames: BoxStream<'static, Frame>,
    },
}

impl std::fmt::Debug for PreparedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreparedStream::Reply { reply, .. } => {
                f.debug_struct("Reply").field("reply", reply).finish_non_exhaustive()
            }
            PreparedStream::Progress { admission, .. } => f
                .debug_struct("Progress")
                .field("outcome", &admission.outcome)
                .finish_non_exhaustive(),
        }
    }
}

/// Router, scheduler and injection behind one handle.
#[derive(Debug, Clone)]
pub struct Narrator {
    config: Arc<NarratorConfig>,
    router: CommandRouter,
    scheduler: UpdateScheduler,
}

impl Narrator {
    pub fn new(config: NarratorConfig, provider: Arc<dyn ModelProvider>) -> Self {
        let catalog = SessionCatalog::from_config(&config.store);
        let engine = WorkflowEngine::new(provider, &config);
        let scheduler = UpdateScheduler::new(engine, catalog.clone(), &config.scheduler);
        Self {
            router: CommandRouter::new(catalog),
            scheduler,
            config: Arc::new(config),
        }
    }

    /// Build the workflow provider from `config.model`.
    pub fn from_config(config: NarratorConfig) -> Result<Self, NarratorError> {
        let provider = create_provider(&config.model)?;
        Ok(Self::new(config, provider))
    }

    pub fn config(&self) -> &NarratorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Answer a directive or admit a run (in the configured mode) and
    /// inject the resulting scenario.
    pub async fn prepare(
        &self,
        session: &str,
        messages: &[ChatMessage],
    ) -> Result<Prepared, NarratorError> {
        if let Some(reply) = self.router.route(session, messages).await {
            return Ok(Prepared::Reply(reply));
        }
        let mode = self.config.scheduler.default_mode;
        let admission = self.scheduler.admit(session, messages, mode).await?;
        debug!(session, outcome = %admission.outcome, "admission resolved");
        let messages = self.inject_text(session, messages, &admission.state.injection_text).await?;
        Ok(Prepared::Forward {
            messages,
            admission,
        })
    }

    /// Like [`prepare`](Self::prepare), but hands back the run's frames
    /// instead of waiting for it.
    pub async fn prepare_streaming(
        &self,
        session: &str,
        messages: &[ChatMessage],
    ) -> Result<PreparedStream, NarratorError> {
        if let Some(reply) = self.router.route(session, messages).await {
            let request_id = uuid::Uuid::new_v4().to_string();
            let chunk = reply.to_chunk_json(&self.config.model.model, &request_id);
            let sse = format!("data: {chunk}\n\ndata: [DONE]\n\n");
            return Ok(PreparedStream::Reply { reply, sse });
        }
        let mut admission = self.scheduler.admit_streaming(session, messages).await?;
        let expose = self.config.stream.expose_reasoning;
        let frames = match admission.feed.take() {
            Some(feed) => StreamEventConverter::convert(feed, expose),
            None => {
                let status = RunStatus::Committed;
                Box::pin(futures::stream::iter([Frame::Done { status }]))
            }
        };
        Ok(PreparedStream::Progress { admission, frames })
    }

    /// Inject the session's last committed scenario.
    pub async fn inject(
        &self,
        session: &str,
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatMessage>, NarratorError> {
        let state = self.scheduler.last_committed(session).await?;
        self.inject_text(session, messages, &state.injection_text).await
    }

    async fn inject_text(
        &self,
        session: &str,
        messages: &[ChatMessage],
        scenario: &str,
    ) -> Result<Vec<ChatMessage>, NarratorError> {
        let store = self.scheduler.catalog().store(session).await?;
        let options = InjectOptions {
            max_history_length: self.config.history.max_history_length,
            ai_message_offset: store
                .snapshot()
                .metadata
                .ai_message_offset
                .unwrap_or(self.config.history.ai_message_offset),
        };
        Ok(inject_scenario(messages, scenario, options))
    }
}
