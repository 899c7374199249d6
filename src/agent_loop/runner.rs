//! The tool invocation loop.
//!
//! Each iteration asks the model for its next turn. Tool calls go through
//! the [`ToolRegistry`]; validation and execution failures are fed back so
//! the model can correct itself. A turn without tool calls ends the loop.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::NarratorError;
use crate::provider::{ModelProvider, ProviderRequest};
use crate::tools::{OutcomeKind, ToolExecutionContext, ToolOutcome, ToolRegistry};
use crate::types::{GenerationSettings, ModelMessage, Usage};

use super::events::{EventEmitter, StreamEventKind};
use super::types::{LoopOutput, ToolCallRecord};

/// Drives one model through one registry.
#[derive(Clone)]
pub struct ToolLoop {
    provider: Arc<dyn ModelProvider>,
    registry: ToolRegistry,
    settings: GenerationSettings,
    max_iterations: usize,
}

impl std::fmt::Debug for ToolLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoop")
            .field("model", &self.provider.model_id())
            .field("registry", &self.registry)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

/// Stage name, event sink and cancellation for one loop run.
#[derive(Debug, Clone, Copy)]
pub struct LoopScope<'a> {
    pub stage: &'a str,
    pub emitter: &'a EventEmitter,
    pub cancel: &'a CancellationToken,
}

impl ToolLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: ToolRegistry,
        max_iterations: usize,
    ) -> Self {
        Self {
            provider,
            registry,
            settings: GenerationSettings::default(),
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run until the model stops calling tools or the iteration cap is hit.
    ///
    /// Provider failures, fatal tool outcomes and cancellation end the loop
    /// with an error. A tool that is already running when cancellation
    /// arrives finishes, but its result is discarded.
    pub async fn run(
        &self,
        messages: Vec<ModelMessage>,
        scope: LoopScope<'_>,
    ) -> Result<LoopOutput, NarratorError> {
        let span = info_span!(
            "tool_loop",
            session = %scope.emitter.session(),
            run_id = %scope.emitter.run_id(),
            stage = scope.stage,
        );
        self.drive(messages, scope).instrument(span).await
    }

    async fn drive(
        &self,
        mut messages: Vec<ModelMessage>,
        scope: LoopScope<'_>,
    ) -> Result<LoopOutput, NarratorError> {
        let tools = self.registry.definitions();
        let mut trace = Vec::new();
        let mut usage = Usage::default();
        let mut last_text = String::new();

        for iteration in 1..=self.max_iterations {
            if scope.cancel.is_cancelled() {
                return Err(NarratorError::Cancelled);
            }

            let request = ProviderRequest {
                messages: messages.clone(),
                settings: self.settings.clone(),
                tools: tools.clone(),
            };
            let response = tokio::select! {
                biased;
                _ = scope.cancel.cancelled() => return Err(NarratorError::Cancelled),
                response = self.provider.complete(&request) => response?,
            };
            usage.merge(&response.usage);
            debug!(iteration, tool_calls = response.tool_calls.len(), "model turn");

            if let Some(reasoning) = response.reasoning.as_deref().filter(|r| !r.is_empty()) {
                scope.emitter.emit(
                    scope.stage,
                    StreamEventKind::ThoughtToken,
                    json!({ "text": reasoning, "source": "reasoning" }),
                );
            }

            if response.tool_calls.is_empty() {
                return Ok(LoopOutput {
                    text: response.text,
                    trace,
                    iterations: iteration,
                    degraded: false,
                    usage,
                });
            }

            if !response.text.is_empty() {
                scope.emitter.emit(
                    scope.stage,
                    StreamEventKind::ThoughtToken,
                    json!({ "text": response.text, "source": "assistant" }),
                );
                last_text = response.text.clone();
            }
            messages.push(ModelMessage::assistant_with_calls(
                response.text.clone(),
                &response.tool_calls,
            ));

            let ctx = ToolExecutionContext {
                session: scope.emitter.session().to_string(),
                stage: scope.stage.to_string(),
                iteration,
            };
            for call in &response.tool_calls {
                scope.emitter.emit(
                    scope.stage,
                    StreamEventKind::ToolInvoked,
                    json!({ "id": call.id, "tool": call.name, "arguments": call.arguments }),
                );

                let outcome = self.registry.invoke(call, &ctx).await;
                if scope.cancel.is_cancelled() {
                    debug!(tool = %call.name, "discarding result of cancelled stage");
                    return Err(NarratorError::Cancelled);
                }

                let result = outcome.to_result_json();
                let kind = outcome.kind();
                if outcome.is_error() {
                    warn!(
                        iteration,
                        tool = %call.name,
                        outcome = ?kind,
                        %result,
                        "tool call failed"
                    );
                }
                scope.emitter.emit(
                    scope.stage,
                    StreamEventKind::ToolResult,
                    json!({ "id": call.id, "tool": call.name, "outcome": kind, "result": result }),
                );
                trace.push(ToolCallRecord {
                    stage: scope.stage.to_string(),
                    iteration,
                    tool: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: result.clone(),
                    outcome: kind,
                });

                if let ToolOutcome::Fatal(err) = outcome {
                    return Err(err);
                }
                messages.push(ModelMessage::tool_result(
                    call.id.clone(),
                    result,
                    kind != OutcomeKind::Success,
                ));
            }
        }

        warn!(
            max_iterations = self.max_iterations,
            "iteration cap reached while the model still wanted tools"
        );
        Ok(LoopOutput {
            text: last_text,
            trace,
            iterations: self.max_iterations,
            degraded: true,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::events::RunUpdate;
    use crate::provider::{ProviderResponse, ScriptedProvider};
    use crate::tools::builtin::think_tool;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::read_only();
        registry.register(think_tool()).unwrap();
        registry
    }

    async fn run(
        provider: ScriptedProvider,
        max_iterations: usize,
    ) -> (Result<LoopOutput, NarratorError>, EventEmitter) {
        let emitter = EventEmitter::detached("s");
        let cancel = CancellationToken::new();
        let tool_loop = ToolLoop::new(Arc::new(provider), registry(), max_iterations);
        let out = tool_loop
            .run(
                vec![ModelMessage::user("go")],
                LoopScope {
                    stage: "memory_retrieval",
                    emitter: &emitter,
                    cancel: &cancel,
                },
            )
            .await;
        (out, emitter)
    }

    #[tokio::test]
    async fn stops_at_first_turn_without_tools() {
        let provider = ScriptedProvider::new([
            ProviderResponse::tool_calls([("think", json!({ "thought": "hmm" }))])
                .with_text("let me think"),
            ProviderResponse::text("done"),
        ]);

        let (out, emitter) = run(provider, 5).await;
        let out = out.unwrap();

        assert_eq!(out.text, "done");
        assert_eq!(out.iterations, 2);
        assert!(!out.degraded);
        assert_eq!(out.trace.len(), 1);
        assert_eq!(out.trace[0].outcome, OutcomeKind::Success);

        let kinds: Vec<StreamEventKind> = emitter.feed().events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StreamEventKind::ThoughtToken,
                StreamEventKind::ToolInvoked,
                StreamEventKind::ToolResult
            ]
        );
    }

    #[tokio::test]
    async fn exposed_reasoning_becomes_a_thought_token() {
        let provider = ScriptedProvider::new([
            ProviderResponse::text("nothing new").with_reasoning("The dragon was named before.")
        ]);

        let (out, emitter) = run(provider, 3).await;

        assert_eq!(out.unwrap().text, "nothing new");
        let events = emitter.feed().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, StreamEventKind::ThoughtToken);
        assert_eq!(events[0].payload["text"], json!("The dragon was named before."));
        assert_eq!(events[0].payload["source"], json!("reasoning"));
    }

    #[tokio::test]
    async fn validation_errors_are_fed_back() {
        let provider = ScriptedProvider::new([
            ProviderResponse::tool_calls([("think", json!({ "idea": "wrong key" }))]),
            ProviderResponse::text("fixed"),
        ]);
        let provider = Arc::new(provider);
        let emitter = EventEmitter::detached("s");
        let cancel = CancellationToken::new();
        let tool_loop = ToolLoop::new(provider.clone(), registry(), 5);

        let out = tool_loop
            .run(
                vec![ModelMessage::user("go")],
                LoopScope {
                    stage: "memory_retrieval",
                    emitter: &emitter,
                    cancel: &cancel,
                },
            )
            .await
            .unwrap();

        assert_eq!(out.trace[0].outcome, OutcomeKind::ValidationError);
        let second = &provider.requests()[1];
        let fed_back = second.messages.last().unwrap();
        assert_eq!(fed_back.role, crate::types::Role::Tool);
    }

    #[tokio::test]
    async fn cap_returns_degraded_best_effort() {
        let turn = || {
            ProviderResponse::tool_calls([("think", json!({ "thought": "again" }))])
                .with_text("partial")
        };
        let provider = ScriptedProvider::new([turn(), turn(), turn()]);

        let (out, _) = run(provider, 2).await;
        let out = out.unwrap();

        assert!(out.degraded);
        assert_eq!(out.iterations, 2);
        assert_eq!(out.text, "partial");
    }

    #[tokio::test]
    async fn provider_failure_stops_the_loop() {
        let provider = ScriptedProvider::new(Vec::new()).then_fail("upstream down");
        let (out, emitter) = run(provider, 3).await;
        assert!(matches!(out, Err(NarratorError::Provider { .. })));
        assert!(emitter.feed().events().is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_model_call() {
        let provider = Arc::new(ScriptedProvider::new([ProviderResponse::text("unused")]));
        let emitter = EventEmitter::detached("s");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = ToolLoop::new(provider.clone(), registry(), 3)
            .run(
                vec![ModelMessage::user("go")],
                LoopScope {
                    stage: "scenario_update",
                    emitter: &emitter,
                    cancel: &cancel,
                },
            )
            .await;

        assert!(matches!(out, Err(NarratorError::Cancelled)));
        assert_eq!(provider.call_count(), 0);
        let mut sub = emitter.feed().subscribe();
        emitter.finish(crate::agent_loop::RunStatus::Failed);
        assert!(matches!(sub.updates.recv().await, Some(RunUpdate::Finished { .. })));
    }
}
