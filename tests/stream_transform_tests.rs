//! Tests for streaming run progress to clients.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{config, shared, transcript, MockProvider};
use futures::StreamExt;
use narrator::agent_loop::{RunStatus, RunUpdate, StreamEvent, StreamEventKind};
use narrator::scheduler::{AdmissionOutcome, UpdateScheduler};
use narrator::session::SessionCatalog;
use narrator::stream_transform::{
    sse_lines, Frame, StreamEventConverter, StreamTransform, WORKFLOW_COMPLETE, WORKFLOW_MODEL,
};
use narrator::workflow::{WorkflowEngine, WorkflowMode};
use serde_json::json;

fn scheduler(provider: Arc<MockProvider>) -> UpdateScheduler {
    let config = config(WorkflowMode::SkipMemory);
    let engine = WorkflowEngine::new(provider, &config);
    UpdateScheduler::new(engine, SessionCatalog::from_config(&config.store), &config.scheduler)
}

fn chat() -> Vec<narrator::types::ChatMessage> {
    transcript(&[("I draw my sword.", "A red dragon lands before you.")])
}

fn queue_dragon_run(provider: &MockProvider) {
    provider
        .queue_tool_call(
            "create_row",
            json!({ "table": "characters", "fields": { "name": "dragon" } }),
        )
        .queue_response("A dragon lands in the clearing.");
}

async fn stream_run(scheduler: &UpdateScheduler, expose: bool) -> Vec<Frame> {
    let mut admission = scheduler.admit_streaming("s", &chat()).await.unwrap();
    let feed = admission.feed.take().unwrap();
    StreamEventConverter::convert(feed, expose).collect().await
}

#[tokio::test]
async fn sequence_numbers_continue_across_runs() {
    let provider = shared(MockProvider::new());
    queue_dragon_run(&provider);
    queue_dragon_run(&provider);
    let scheduler = scheduler(provider);

    let first = stream_run(&scheduler, true).await;
    let second = stream_run(&scheduler, true).await;

    let seqs: Vec<u64> = first.iter().chain(&second).filter_map(Frame::seq).collect();
    assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    assert_eq!(first.last(), Some(&Frame::Done { status: RunStatus::Committed }));
    assert_eq!(second.last(), Some(&Frame::Done { status: RunStatus::Committed }));
}

#[tokio::test]
async fn hidden_reasoning_streams_only_the_scenario() {
    let provider = shared(MockProvider::new());
    queue_dragon_run(&provider);
    let scheduler = scheduler(provider);

    let frames = stream_run(&scheduler, false).await;

    let (events, done) = frames.split_at(frames.len() - 1);
    assert!(!events.is_empty());
    assert!(events.iter().all(|f| f.event_type() == "final_chunk"));
    assert!(matches!(done[0], Frame::Done { status: RunStatus::Committed }));
    let text: String = events.iter().map(Frame::content).collect();
    assert!(text.starts_with("A dragon lands in the clearing."));
}

#[tokio::test(start_paused = true)]
async fn joined_stream_replays_the_whole_run() {
    let provider = shared(MockProvider::new().with_delay(Duration::from_millis(300)));
    queue_dragon_run(&provider);
    let scheduler = scheduler(provider);

    let mut first = scheduler.admit_streaming("s", &chat()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    let mut joined = scheduler.admit_streaming("s", &chat()).await.unwrap();
    assert_eq!(joined.outcome, AdmissionOutcome::Joined);

    let a: Vec<Frame> =
        StreamEventConverter::convert(first.feed.take().unwrap(), true).collect().await;
    let b: Vec<Frame> =
        StreamEventConverter::convert(joined.feed.take().unwrap(), true).collect().await;

    assert_eq!(a, b);
    assert_eq!(a[0].event_type(), "tool_invoked");
}

#[tokio::test]
async fn sse_chunks_follow_the_completion_chunk_shape() {
    let provider = shared(MockProvider::new());
    queue_dragon_run(&provider);
    let scheduler = scheduler(provider);
    let mut admission = scheduler.admit_streaming("s", &chat()).await.unwrap();
    let frames = StreamEventConverter::convert(admission.feed.take().unwrap(), true);

    let lines: Vec<String> = sse_lines(frames, "abc", 1_700_000_000).collect().await;

    let chunks: Vec<serde_json::Value> = lines
        .iter()
        .map(|line| {
            let body = line.strip_prefix("data: ").unwrap().trim_end();
            serde_json::from_str(body).unwrap()
        })
        .collect();
    let first = &chunks[0];
    assert_eq!(first["id"], json!("chatcmpl-abc"));
    assert_eq!(first["object"], json!("chat.completion.chunk"));
    assert_eq!(first["model"], json!(WORKFLOW_MODEL));
    assert_eq!(first["workflow_event"], json!(true));
    assert_eq!(first["event_type"], json!("tool_invoked"));
    assert!(first["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap()
        .contains("calling tool: create_row"));
    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], json!(WORKFLOW_COMPLETE));
    assert_eq!(last["workflow_status"], json!("committed"));
}

#[tokio::test]
async fn custom_update_streams_are_reordered() {
    let event = |seq: u64| StreamEvent {
        session: "s".into(),
        run_id: uuid::Uuid::nil(),
        seq,
        stage: "scenario_update".into(),
        kind: StreamEventKind::FinalChunk,
        payload: json!({ "text": seq.to_string() }),
        timestamp: Utc::now(),
    };
    let updates = async_stream::stream! {
        yield RunUpdate::Event(event(4));
        yield RunUpdate::Event(event(3));
        yield RunUpdate::Event(event(5));
        yield RunUpdate::Finished { status: RunStatus::TimedOut };
    };

    let frames: Vec<Frame> = StreamEventConverter::new(3, true)
        .transform(Box::pin(updates))
        .collect()
        .await;

    let text: String = frames.iter().map(Frame::content).collect();
    assert_eq!(text, "345");
    assert_eq!(frames.last(), Some(&Frame::Done { status: RunStatus::TimedOut }));
}
