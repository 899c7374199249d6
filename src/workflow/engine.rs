//! The workflow engine: runs a session's stages and commits the result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::agent_loop::{
    EventEmitter, LoopOutput, LoopScope, RunId, RunStatus, StreamEventKind, ToolCallRecord,
    ToolLoop,
};
use crate::config::NarratorConfig;
use crate::error::NarratorError;
use crate::history::extract_latest_ai_message;
use crate::knowledge::KnowledgeBase;
use crate::provider::ModelProvider;
use crate::store::render::{prompt_scenario, scenario_text, schema_text, TableFormat};
use crate::store::{Document, TableDiff, TableStore};
use crate::tools::builtin::{
    file_tools, lookup_knowledge_tool, read_file_tool, search_history_tool, think_tool, Workspace,
};
use crate::tools::table::read_table_tool;
use crate::tools::{table_tools, TableSource, ToolRegistry, TransactionHandle};
use crate::types::{ChatMessage, GenerationSettings, ModelMessage, Role, Usage};
use crate::util::text::chunk_chars;
use crate::util::timeout::{with_cooperative_deadline, Deadline};

use super::prompts;
use super::stage::{Stage, WorkflowMode};

/// Bookkeeping record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub session: String,
    /// Stage running now, or the last one that ran.
    pub stage: Option<Stage>,
    pub status: RunStatus,
    pub iterations: usize,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn start(run_id: RunId, session: impl Into<String>) -> Self {
        Self {
            run_id,
            session: session.into(),
            stage: None,
            status: RunStatus::Running,
            iterations: 0,
            degraded: false,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// What a run hands back to its caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub ok: bool,
    pub status: RunStatus,
    /// The new scenario on commit; the previous one otherwise.
    pub scenario_text: String,
    /// Changes the run committed; empty unless `ok`.
    pub table_diff: TableDiff,
    pub trace: Vec<ToolCallRecord>,
    pub degraded: bool,
    /// Tokens spent across every stage of the run.
    pub usage: Usage,
    pub run: WorkflowRun,
}

/// Everything a stage sees.
#[derive(Debug, Clone, Default)]
struct StageState {
    scenario: String,
    last_ai_message: String,
    memory: String,
}

/// Runs the fixed stage pipeline against a session's table store.
#[derive(Clone)]
pub struct WorkflowEngine {
    provider: Arc<dyn ModelProvider>,
    settings: GenerationSettings,
    mode: WorkflowMode,
    max_iterations: usize,
    memory_budget: Duration,
    update_budget: Duration,
    grace: Duration,
    table_format: TableFormat,
    knowledge: KnowledgeBase,
    workspace: Option<Workspace>,
    search_max_results: usize,
    search_context_chars: usize,
    chunk_chars: usize,
    history_window: usize,
    default_offset: usize,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("model", &self.provider.model_id())
            .field("mode", &self.mode)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &NarratorConfig) -> Self {
        Self {
            provider,
            settings: config.model.generation_settings(),
            mode: config.workflow.mode,
            max_iterations: config.workflow.max_iterations,
            memory_budget: Duration::from_secs(config.workflow.memory_stage_timeout_secs),
            update_budget: Duration::from_secs(config.workflow.update_stage_timeout_secs),
            grace: Duration::from_millis(config.workflow.cancel_grace_ms),
            table_format: config.workflow.prompt_table_format,
            knowledge: KnowledgeBase::from_config(&config.knowledge),
            workspace: config.tools.workspace_dir.clone().map(Workspace::new),
            search_max_results: config.tools.search_max_results,
            search_context_chars: config.tools.search_context_chars,
            chunk_chars: config.stream.chunk_chars,
            history_window: config.history.workflow_window,
            default_offset: config.history.ai_message_offset,
        }
    }

    pub fn with_mode(mut self, mode: WorkflowMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_knowledge(mut self, knowledge: KnowledgeBase) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Override the per-stage budgets and the cancellation grace period.
    pub fn with_budgets(mut self, memory: Duration, update: Duration, grace: Duration) -> Self {
        self.memory_budget = memory;
        self.update_budget = update;
        self.grace = grace;
        self
    }

    pub fn mode(&self) -> WorkflowMode {
        self.mode
    }

    fn budget(&self, stage: Stage) -> Duration {
        match stage {
            Stage::MemoryRetrieval => self.memory_budget,
            Stage::ScenarioUpdate => self.update_budget,
        }
    }

    /// Longest a run can take: every stage budget plus its grace period.
    pub fn max_run_time(&self) -> Duration {
        self.mode
            .stages()
            .into_iter()
            .map(|s| self.budget(s) + self.grace)
            .sum()
    }

    /// Run every stage of the configured mode for one session.
    ///
    /// Never returns an error: failures and timeouts are reported in the
    /// result and leave the store untouched.
    pub async fn run(
        &self,
        store: &TableStore,
        history: &[ChatMessage],
        emitter: &EventEmitter,
        cancel: &CancellationToken,
    ) -> ScenarioResult {
        let (progress, _) = watch::channel(WorkflowRun::start(emitter.run_id(), emitter.session()));
        self.run_tracked(store, history, emitter, cancel, &progress).await
    }

    /// Like [`run`](Self::run), publishing the run record to `progress` as
    /// stages start and finish their tool loops.
    pub async fn run_tracked(
        &self,
        store: &TableStore,
        history: &[ChatMessage],
        emitter: &EventEmitter,
        cancel: &CancellationToken,
        progress: &watch::Sender<WorkflowRun>,
    ) -> ScenarioResult {
        let span = info_span!(
            "workflow",
            session = %emitter.session(),
            run_id = %emitter.run_id(),
            mode = %self.mode,
        );
        let result = self
            .run_stages(store, history, emitter, cancel, progress)
            .instrument(span)
            .await;
        progress.send_replace(result.run.clone());
        emitter.finish(result.status);
        result
    }

    async fn run_stages(
        &self,
        store: &TableStore,
        history: &[ChatMessage],
        emitter: &EventEmitter,
        cancel: &CancellationToken,
        progress: &watch::Sender<WorkflowRun>,
    ) -> ScenarioResult {
        let snapshot = store.snapshot();
        let history: Arc<[ChatMessage]> = window(history, self.history_window).into();
        let offset = snapshot
            .metadata
            .ai_message_offset
            .unwrap_or(self.default_offset);
        let last_ai_message = extract_latest_ai_message(&history, offset)
            .or_else(|| extract_latest_ai_message(&history, 0))
            .unwrap_or_default()
            .to_string();

        let mut state = StageState {
            scenario: prompt_scenario(&snapshot, self.table_format),
            last_ai_message,
            memory: String::new(),
        };
        let mut out = ScenarioResult {
            ok: false,
            status: RunStatus::Running,
            scenario_text: scenario_text(&snapshot),
            table_diff: TableDiff::default(),
            trace: Vec::new(),
            degraded: false,
            usage: Usage::default(),
            run: WorkflowRun::start(emitter.run_id(), emitter.session()),
        };
        info!(messages = history.len(), offset, "workflow run started");

        let mut next = self.mode.entry();
        while let Some(stage) = next {
            out.run.stage = Some(stage);
            progress.send_replace(out.run.clone());
            let stage_cancel = cancel.child_token();
            let scope = LoopScope {
                stage: stage.as_str(),
                emitter,
                cancel: &stage_cancel,
            };
            info!(stage = scope.stage, "stage started");

            match stage {
                Stage::MemoryRetrieval => {
                    let run = self.memory_stage(store, history.clone(), &state, scope);
                    let outcome = with_cooperative_deadline(
                        self.memory_budget,
                        self.grace,
                        &stage_cancel,
                        run,
                    )
                    .await;
                    match outcome {
                        Deadline::Finished(Ok(loop_out)) => {
                            state.memory = prompts::memory_note(&loop_out.text);
                            absorb(&mut out, loop_out, progress);
                        }
                        Deadline::Finished(Err(_)) if cancel.is_cancelled() => {
                            return fail(out, RunStatus::Failed, NarratorError::Cancelled);
                        }
                        Deadline::Finished(Err(e)) => {
                            warn!(
                                stage = scope.stage,
                                error = %e,
                                "memory stage failed; continuing without memory"
                            );
                            state.memory = prompts::memory_note(prompts::MEMORY_UNAVAILABLE);
                            out.degraded = true;
                        }
                        Deadline::Expired { drained } => {
                            return self.timed_out(out, stage, drained);
                        }
                    }
                }
                Stage::ScenarioUpdate => {
                    let tx = tokio::select! {
                        _ = cancel.cancelled() => {
                            return fail(out, RunStatus::Failed, NarratorError::Cancelled);
                        }
                        tx = store.begin() => tx,
                    };
                    let doc = tx.document().clone();
                    let handle = TransactionHandle::new(tx);
                    let run = self.update_stage(&handle, &doc, &state, scope);
                    let outcome = with_cooperative_deadline(
                        self.update_budget,
                        self.grace,
                        &stage_cancel,
                        run,
                    )
                    .await;
                    let tx = handle.take().await;

                    match outcome {
                        Deadline::Finished(Ok(loop_out)) => {
                            let Some(mut tx) = tx else {
                                let err = NarratorError::InvalidState(
                                    "scenario transaction vanished".into(),
                                );
                                return fail(out, RunStatus::Failed, err);
                            };
                            let summary = loop_out.text.trim().to_string();
                            if !summary.is_empty() {
                                tx.set_summary(summary);
                            }
                            absorb(&mut out, loop_out, progress);
                            match tx.commit().await {
                                Ok(receipt) => {
                                    out.scenario_text = scenario_text(&receipt.snapshot);
                                    out.table_diff = receipt.diff;
                                }
                                Err(e) => return fail(out, RunStatus::Failed, e),
                            }
                        }
                        Deadline::Finished(Err(e)) => {
                            drop(tx);
                            let e = if cancel.is_cancelled() {
                                NarratorError::Cancelled
                            } else {
                                e
                            };
                            return fail(out, RunStatus::Failed, e);
                        }
                        Deadline::Expired { drained } => {
                            drop(tx);
                            return self.timed_out(out, stage, drained);
                        }
                    }
                }
            }
            next = self.mode.next(stage);
        }

        let stage = out.run.stage.map_or("forward_only", Stage::as_str);
        for chunk in chunk_chars(&out.scenario_text, self.chunk_chars) {
            emitter.emit(stage, StreamEventKind::FinalChunk, json!({ "text": chunk }));
        }
        out.ok = true;
        out.status = RunStatus::Committed;
        out.run.finish(RunStatus::Committed, None);
        info!(
            changes = out.table_diff.len(),
            iterations = out.run.iterations,
            tokens = out.usage.total_tokens,
            degraded = out.degraded,
            "workflow run committed"
        );
        out
    }

    fn timed_out(&self, out: ScenarioResult, stage: Stage, drained: bool) -> ScenarioResult {
        if !drained {
            warn!(
                stage = stage.as_str(),
                "in-flight tool did not finish within the grace period"
            );
        }
        let err = NarratorError::WorkflowTimeout {
            stage: stage.to_string(),
            budget_ms: self.budget(stage).as_millis() as u64,
        };
        fail(out, RunStatus::TimedOut, err)
    }

    fn stage_loop(&self, registry: ToolRegistry) -> ToolLoop {
        ToolLoop::new(self.provider.clone(), registry, self.max_iterations)
            .with_settings(self.settings.clone())
    }

    async fn memory_stage(
        &self,
        store: &TableStore,
        history: Arc<[ChatMessage]>,
        state: &StageState,
        scope: LoopScope<'_>,
    ) -> Result<LoopOutput, NarratorError> {
        let mut registry = ToolRegistry::new(Stage::MemoryRetrieval.access());
        registry.register(think_tool())?;
        registry.register(search_history_tool(
            history,
            self.search_max_results,
            self.search_context_chars,
        ))?;
        registry.register(read_table_tool(TableSource::Committed(store.clone())))?;
        if !self.knowledge.is_empty() {
            registry.register(lookup_knowledge_tool(self.knowledge.clone()))?;
        }
        if let Some(workspace) = &self.workspace {
            registry.register(read_file_tool(workspace.clone()))?;
        }

        let messages = vec![
            ModelMessage::system(prompts::MEMORY_SYSTEM_PROMPT),
            ModelMessage::user(prompts::memory_user_prompt(
                &state.scenario,
                &state.last_ai_message,
            )),
        ];
        self.stage_loop(registry).run(messages, scope).await
    }

    async fn update_stage(
        &self,
        handle: &TransactionHandle,
        doc: &Document,
        state: &StageState,
        scope: LoopScope<'_>,
    ) -> Result<LoopOutput, NarratorError> {
        let mut registry = ToolRegistry::new(Stage::ScenarioUpdate.access());
        registry.register(think_tool())?;
        registry.register_all(table_tools(handle))?;
        if let Some(workspace) = &self.workspace {
            registry.register_all(file_tools(workspace))?;
        }

        let messages = vec![
            ModelMessage::system(prompts::UPDATE_SYSTEM_PROMPT),
            ModelMessage::user(prompts::update_user_prompt(
                &state.scenario,
                &schema_text(doc),
                &state.last_ai_message,
                &state.memory,
            )),
        ];
        self.stage_loop(registry).run(messages, scope).await
    }
}

/// The newest `limit` non-system messages.
fn window(history: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let relevant: Vec<&ChatMessage> = history.iter().filter(|m| m.role != Role::System).collect();
    let skip = relevant.len().saturating_sub(limit);
    relevant.into_iter().skip(skip).cloned().collect()
}

fn absorb(out: &mut ScenarioResult, loop_out: LoopOutput, progress: &watch::Sender<WorkflowRun>) {
    out.run.iterations += loop_out.iterations;
    out.degraded |= loop_out.degraded;
    out.run.degraded = out.degraded;
    out.trace.extend(loop_out.trace);
    out.usage += loop_out.usage;
    progress.send_replace(out.run.clone());
}

fn fail(mut out: ScenarioResult, status: RunStatus, err: NarratorError) -> ScenarioResult {
    warn!(
        stage = out.run.stage.map_or("none", Stage::as_str),
        status = %status,
        error = %err,
        "workflow run did not commit"
    );
    out.ok = false;
    out.status = status;
    out.table_diff = TableDiff::default();
    out.run.degraded = out.degraded;
    out.run.finish(status, Some(err.to_string()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderResponse, ScriptedProvider};
    use crate::store::default_templates;

    fn engine(provider: ScriptedProvider, mode: WorkflowMode) -> WorkflowEngine {
        WorkflowEngine::new(Arc::new(provider), &NarratorConfig::default()).with_mode(mode)
    }

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("We enter the forest."),
            ChatMessage::assistant("A dragon named Ember blocks the path."),
        ]
    }

    #[tokio::test]
    async fn skip_memory_commits_rows_and_summary() {
        let provider = ScriptedProvider::new([
            ProviderResponse::tool_calls([(
                "create_row",
                json!({ "table": "characters", "fields": { "name": "Ember", "identity": "dragon" } }),
            )]),
            ProviderResponse::text("A dragon blocks the forest path."),
        ]);
        let store = TableStore::in_memory(&default_templates()).unwrap();
        let emitter = EventEmitter::detached("s");

        let result = engine(provider, WorkflowMode::SkipMemory)
            .run(&store, &history(), &emitter, &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert_eq!(result.status, RunStatus::Committed);
        assert_eq!(result.table_diff.len(), 1);
        assert_eq!(store.read_table("characters").unwrap().len(), 1);
        assert_eq!(
            store.snapshot().summary.as_deref(),
            Some("A dragon blocks the forest path.")
        );
        assert!(result.scenario_text.starts_with("A dragon blocks the forest path."));
        assert_eq!(emitter.feed().status(), Some(RunStatus::Committed));
    }

    #[tokio::test]
    async fn json_table_format_reaches_the_update_prompt() {
        let provider = Arc::new(ScriptedProvider::new([ProviderResponse::text("Quiet.")]));
        let mut config = NarratorConfig::default();
        config.workflow.mode = WorkflowMode::SkipMemory;
        config.workflow.prompt_table_format = TableFormat::Json;
        let store = TableStore::in_memory(&default_templates()).unwrap();
        store
            .create_row("characters", json!({ "name": "Ember" }).as_object().cloned().unwrap())
            .await
            .unwrap();

        let result = WorkflowEngine::new(provider.clone(), &config)
            .run(&store, &history(), &EventEmitter::detached("s"), &CancellationToken::new())
            .await;

        assert!(result.ok);
        let prompt = provider.requests()[0].messages.last().unwrap().text();
        assert!(prompt.contains("\"characters\": ["));
        assert!(!prompt.contains("A1 | Ember"));
        assert!(result.scenario_text.contains("A1 | Ember"));
    }

    #[tokio::test]
    async fn forward_only_returns_current_state() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let store = TableStore::in_memory(&default_templates()).unwrap();
        let engine = WorkflowEngine::new(provider.clone(), &NarratorConfig::default())
            .with_mode(WorkflowMode::ForwardOnly);

        let result = engine
            .run(&store, &history(), &EventEmitter::detached("s"), &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(result.scenario_text, scenario_text(&store.snapshot()));
    }

    #[tokio::test]
    async fn memory_failure_degrades_and_continues() {
        let provider = ScriptedProvider::new(Vec::new()).then_fail("memory model down");
        let store = TableStore::in_memory(&default_templates()).unwrap();

        let result = engine(provider, WorkflowMode::Full)
            .run(&store, &history(), &EventEmitter::detached("s"), &CancellationToken::new())
            .await;

        assert!(result.ok);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn update_failure_discards_changes() {
        let provider = ScriptedProvider::new([ProviderResponse::tool_calls([(
            "create_row",
            json!({ "table": "characters", "fields": { "name": "Ember" } }),
        )])])
        .then_fail("update model down");
        let store = TableStore::in_memory(&default_templates()).unwrap();

        let result = engine(provider, WorkflowMode::SkipMemory)
            .run(&store, &history(), &EventEmitter::detached("s"), &CancellationToken::new())
            .await;

        assert!(!result.ok);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.table_diff.is_empty());
        assert!(store.read_table("characters").unwrap().is_empty());
        assert!(result.run.error.is_some());
    }

    #[test]
    fn window_drops_system_and_old_messages() {
        let mut messages = vec![ChatMessage::system("sys")];
        messages.extend(history());
        let kept = window(&messages, 1);
        assert_eq!(kept, vec![history()[1].clone()]);
    }

    #[test]
    fn max_run_time_sums_stage_budgets() {
        let e = engine(ScriptedProvider::new(Vec::new()), WorkflowMode::Full).with_budgets(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_millis(500),
        );
        assert_eq!(e.max_run_time(), Duration::from_secs(4));
        assert_eq!(e.with_mode(WorkflowMode::ForwardOnly).max_run_time(), Duration::ZERO);
    }
}
