//! Tool registry and table tools working together.

mod common;

use std::sync::Arc;

use narrator::store::{default_templates, TableStore};
use narrator::tools::builtin::{file_tools, search_history_tool, think_tool, Workspace};
use narrator::tools::table::{create_row_tool, read_table_tool};
use narrator::tools::{
    table_tools, OutcomeKind, TableSource, ToolExecutionContext, ToolOutcome, ToolRegistry,
    TransactionHandle,
};
use narrator::types::{ChatMessage, ToolCall};
use serde_json::json;
use tempfile::TempDir;

fn ctx() -> ToolExecutionContext {
    ToolExecutionContext {
        session: "s".into(),
        stage: "scenario_update".into(),
        iteration: 1,
    }
}

fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: "call_1".into(),
        name: name.into(),
        arguments,
    }
}

async fn update_registry(store: &TableStore) -> (ToolRegistry, TransactionHandle) {
    let handle = TransactionHandle::new(store.begin().await);
    let mut registry = ToolRegistry::with_mutation();
    registry.register_all(table_tools(&handle)).unwrap();
    (registry, handle)
}

#[tokio::test]
async fn read_only_registry_refuses_mutating_tools() {
    let store = TableStore::in_memory(&default_templates()).unwrap();
    let handle = TransactionHandle::new(store.begin().await);
    let mut registry = ToolRegistry::read_only();

    registry.register(think_tool()).unwrap();
    registry
        .register(read_table_tool(TableSource::Committed(store.clone())))
        .unwrap();
    let refused = registry.register(create_row_tool(handle));

    assert!(refused.is_err());
    assert_eq!(registry.names(), vec!["think", "read_table"]);
}

#[tokio::test]
async fn edits_stay_private_until_the_transaction_commits() {
    let store = TableStore::in_memory(&default_templates()).unwrap();
    let (registry, handle) = update_registry(&store).await;

    let created = registry
        .invoke(
            &call(
                "create_row",
                json!({ "table": "characters", "fields": { "name": "Ember" } }),
            ),
            &ctx(),
        )
        .await;
    match created {
        ToolOutcome::Success(value) => assert_eq!(value, json!({ "row_id": "A1" })),
        other => panic!("create_row failed: {other:?}"),
    }

    let working = registry
        .invoke(&call("read_table", json!({ "table": "characters" })), &ctx())
        .await;
    assert_eq!(working.to_result_json()["rows"][0]["id"], json!("A1"));
    assert!(store.read_table("characters").unwrap().is_empty());

    handle.take().await.unwrap().commit().await.unwrap();
    assert_eq!(store.read_table("characters").unwrap().len(), 1);
}

#[tokio::test]
async fn schema_violations_come_back_as_validation_errors() {
    let store = TableStore::in_memory(&default_templates()).unwrap();
    let (registry, _handle) = update_registry(&store).await;

    let missing_arg = registry
        .invoke(&call("create_row", json!({ "table": "characters" })), &ctx())
        .await;
    let unknown_column = registry
        .invoke(
            &call(
                "create_row",
                json!({ "table": "characters", "fields": { "name": "Ash", "wingspan": 3 } }),
            ),
            &ctx(),
        )
        .await;
    let unknown_tool = registry.invoke(&call("summon", json!({})), &ctx()).await;

    assert_eq!(missing_arg.kind(), OutcomeKind::ValidationError);
    assert_eq!(unknown_column.kind(), OutcomeKind::ValidationError);
    assert_eq!(unknown_tool.kind(), OutcomeKind::ValidationError);
    let message = unknown_tool.to_result_json()["error"]["message"].clone();
    assert!(message.as_str().unwrap().contains("create_row"));
}

#[tokio::test]
async fn closed_handle_is_fatal() {
    let store = TableStore::in_memory(&default_templates()).unwrap();
    let (registry, handle) = update_registry(&store).await;
    drop(handle.take().await);

    let outcome = registry
        .invoke(&call("delete_row", json!({ "table": "characters", "row_id": "A1" })), &ctx())
        .await;

    assert_eq!(outcome.kind(), OutcomeKind::Fatal);
}

#[tokio::test]
async fn string_encoded_arguments_are_accepted() {
    let history: Arc<[ChatMessage]> = common::transcript(&[
        ("We enter the forest.", "Moss covers the ancient oaks."),
        ("I draw my sword.", "A dragon lifts its head from the moss."),
    ])
    .into();
    let mut registry = ToolRegistry::read_only();
    registry.register(search_history_tool(history, 10, 40)).unwrap();

    let outcome = registry
        .invoke(
            &call("search_history", json!(r#"{"pattern":"dragon","scope":"assistant"}"#)),
            &ctx(),
        )
        .await;

    match outcome {
        ToolOutcome::Success(report) => assert_eq!(report["results_count"], json!(1)),
        other => panic!("search failed: {other:?}"),
    }
}

#[tokio::test]
async fn file_tools_cannot_leave_the_workspace() {
    let dir = TempDir::new().unwrap();
    let mut registry = ToolRegistry::with_mutation();
    registry
        .register_all(file_tools(&Workspace::new(dir.path())))
        .unwrap();

    let escaped = registry
        .invoke(&call("read_file", json!({ "path": "../../etc/passwd" })), &ctx())
        .await;
    let written = registry
        .invoke(
            &call("write_file", json!({ "path": "notes/lore.md", "content": "Ember sleeps." })),
            &ctx(),
        )
        .await;

    assert!(escaped.is_error());
    assert_eq!(written.kind(), OutcomeKind::Success);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes/lore.md")).unwrap(),
        "Ember sleeps."
    );
}
