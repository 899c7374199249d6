//! Admission control across concurrent requests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, fields, shared, transcript, MockProvider};
use narrator::agent_loop::RunStatus;
use narrator::config::NarratorConfig;
use narrator::scheduler::{AdmissionMode, AdmissionOutcome, UpdateScheduler};
use narrator::session::SessionCatalog;
use narrator::workflow::{Stage, WorkflowEngine, WorkflowMode};
use serde_json::json;
use tempfile::TempDir;

fn dragon_provider(delay: Duration) -> Arc<MockProvider> {
    let provider = shared(MockProvider::new().with_delay(delay));
    provider
        .queue_tool_call(
            "create_row",
            json!({ "table": "characters", "fields": { "name": "dragon", "identity": "red dragon" } }),
        )
        .queue_response("A dragon guards the forest.");
    provider
}

fn scheduler_with(provider: Arc<MockProvider>, config: &NarratorConfig) -> UpdateScheduler {
    let engine = WorkflowEngine::new(provider, config);
    UpdateScheduler::new(engine, SessionCatalog::from_config(&config.store), &config.scheduler)
}

fn chat() -> Vec<narrator::types::ChatMessage> {
    transcript(&[("I draw my sword.", "A red dragon lands before you.")])
}

#[tokio::test(start_paused = true)]
async fn concurrent_admissions_share_one_run() {
    let provider = dragon_provider(Duration::from_millis(200));
    let scheduler = scheduler_with(provider.clone(), &config(WorkflowMode::SkipMemory));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .admit("tavern", &chat(), AdmissionMode::Blocking)
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut admissions = Vec::new();
    for task in tasks {
        admissions.push(task.await.unwrap());
    }

    let started = admissions
        .iter()
        .filter(|a| a.outcome == AdmissionOutcome::Started)
        .count();
    assert_eq!(started, 1);
    assert!(admissions
        .iter()
        .all(|a| a.run_id == admissions[0].run_id && a.status == Some(RunStatus::Committed)));
    assert!(admissions.iter().all(|a| a.state.row_count == 1));
    assert_eq!(provider.call_count(), 2);
    assert_eq!(scheduler.runs("tavern").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sessions_run_independently() {
    let provider = shared(MockProvider::new().with_delay(Duration::from_millis(100)));
    let scheduler = scheduler_with(provider.clone(), &config(WorkflowMode::SkipMemory));

    let (north_chat, south_chat) = (chat(), chat());
    let (a, b) = tokio::join!(
        scheduler.admit("north", &north_chat, AdmissionMode::Blocking),
        scheduler.admit("south", &south_chat, AdmissionMode::Blocking),
    );

    assert_eq!(a.unwrap().outcome, AdmissionOutcome::Started);
    assert_eq!(b.unwrap().outcome, AdmissionOutcome::Started);
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn admissions_beyond_the_cap_are_refused() {
    let mut config = config(WorkflowMode::SkipMemory);
    config.scheduler.max_outstanding_runs = 1;
    let scheduler = scheduler_with(dragon_provider(Duration::from_secs(1)), &config);

    let first = scheduler
        .admit("north", &chat(), AdmissionMode::NonBlocking)
        .await
        .unwrap();
    let second = scheduler
        .admit("south", &chat(), AdmissionMode::Blocking)
        .await
        .unwrap();

    assert_eq!(first.outcome, AdmissionOutcome::Started);
    assert_eq!(second.outcome, AdmissionOutcome::Refused);
    assert_eq!(second.run_id, None);
    assert_eq!(scheduler.in_flight("south"), None);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_frees_the_slot_without_changes() {
    let scheduler = scheduler_with(
        dragon_provider(Duration::from_secs(1)),
        &config(WorkflowMode::SkipMemory),
    );
    let admission = scheduler
        .admit_streaming("tavern", &chat())
        .await
        .unwrap();
    assert_eq!(admission.outcome, AdmissionOutcome::Started);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(scheduler.cancel("tavern"));
    let result = admission.result.unwrap().wait().await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(scheduler.in_flight("tavern"), None);
    assert!(!scheduler.cancel("tavern"));
    let state = scheduler.last_committed("tavern").await.unwrap();
    assert_eq!(state.row_count, 0);
}

#[tokio::test]
async fn committed_state_survives_a_new_scheduler() {
    let dir = TempDir::new().unwrap();
    let mut config = config(WorkflowMode::SkipMemory);
    config.store.data_dir = Some(dir.path().to_path_buf());

    let first = scheduler_with(dragon_provider(Duration::ZERO), &config);
    let admitted = first
        .admit("tavern", &chat(), AdmissionMode::Blocking)
        .await
        .unwrap();
    assert_eq!(admitted.status, Some(RunStatus::Committed));

    let second = scheduler_with(shared(MockProvider::new()), &config);
    let state = second.last_committed("tavern").await.unwrap();
    assert_eq!(state.row_count, 1);
    assert!(state.injection_text.contains("red dragon"));
    let store = second.catalog().store("tavern").await.unwrap();
    assert_eq!(
        store.read_table("characters").unwrap()[0].fields,
        fields(json!({ "name": "dragon", "identity": "red dragon" }))
    );
}

#[tokio::test]
async fn forward_only_never_calls_the_model() {
    let provider = shared(MockProvider::new());
    let scheduler = scheduler_with(provider.clone(), &config(WorkflowMode::ForwardOnly));

    let blocking = scheduler
        .admit("tavern", &chat(), AdmissionMode::Blocking)
        .await
        .unwrap();
    let streaming = scheduler.admit_streaming("tavern", &chat()).await.unwrap();

    assert_eq!(blocking.outcome, AdmissionOutcome::Skipped);
    assert_eq!(streaming.outcome, AdmissionOutcome::Skipped);
    assert!(streaming.feed.is_none());
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_run_returns_the_previous_state() {
    let mut config = config(WorkflowMode::SkipMemory);
    config.workflow.update_stage_timeout_secs = 1;
    config.workflow.cancel_grace_ms = 200;
    let scheduler = scheduler_with(dragon_provider(Duration::from_secs(5)), &config);

    let admission = scheduler
        .admit("tavern", &chat(), AdmissionMode::Blocking)
        .await
        .unwrap();

    assert_eq!(admission.outcome, AdmissionOutcome::Started);
    assert_eq!(admission.status, Some(RunStatus::TimedOut));
    assert_eq!(admission.state.row_count, 0);
    assert_eq!(scheduler.in_flight("tavern"), None);
    let runs = scheduler.runs("tavern");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::TimedOut);
}

#[tokio::test]
async fn failed_flush_frees_the_slot() {
    let dir = TempDir::new().unwrap();
    let mut config = config(WorkflowMode::SkipMemory);
    config.store.data_dir = Some(dir.path().to_path_buf());
    let scheduler = scheduler_with(dragon_provider(Duration::ZERO), &config);
    scheduler.catalog().store("tavern").await.unwrap();
    let blocker = dir.path().join(".tavern.json.tmp");
    std::fs::create_dir(&blocker).unwrap();
    std::fs::write(blocker.join("keep"), b"x").unwrap();

    let admission = scheduler
        .admit("tavern", &chat(), AdmissionMode::Blocking)
        .await
        .unwrap();

    assert_eq!(admission.status, Some(RunStatus::Failed));
    assert_eq!(admission.state.row_count, 0);
    assert_eq!(scheduler.in_flight("tavern"), None);
    let state = scheduler.last_committed("tavern").await.unwrap();
    assert_eq!(state.row_count, 0);
}

#[tokio::test(start_paused = true)]
async fn running_record_follows_the_stages() {
    let provider = shared(MockProvider::new().with_delay(Duration::from_secs(1)));
    provider
        .queue_response("The dragon was first seen here.")
        .queue_tool_call(
            "create_row",
            json!({ "table": "characters", "fields": { "name": "dragon" } }),
        )
        .queue_response("A dragon guards the forest.");
    let scheduler = scheduler_with(provider, &config(WorkflowMode::Full));

    let admission = scheduler
        .admit("tavern", &chat(), AdmissionMode::NonBlocking)
        .await
        .unwrap();
    assert_eq!(admission.outcome, AdmissionOutcome::Started);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let runs = scheduler.runs("tavern");
    assert_eq!(runs.len(), 1);
    assert_eq!(Some(runs[0].run_id), admission.run_id);
    assert_eq!(runs[0].status, RunStatus::Running);
    assert_eq!(runs[0].stage, Some(Stage::ScenarioUpdate));
    assert_eq!(runs[0].iterations, 1);

    let result = admission.result.unwrap().wait().await.unwrap();
    assert_eq!(result.status, RunStatus::Committed);
    let runs = scheduler.runs("tavern");
    assert_eq!(runs[0].status, RunStatus::Committed);
    assert_eq!(runs[0].iterations, 3);
}
