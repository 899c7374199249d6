//! OpenAI-compatible provider against a mock HTTP server.

use std::time::Duration;

use narrator::error::NarratorError;
use narrator::provider::{ModelProvider, OpenAiCompatibleProvider, ProviderRequest, ToolDefinition};
use narrator::types::{FinishReason, GenerationSettings, ModelMessage};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> OpenAiCompatibleProvider {
    OpenAiCompatibleProvider::new(
        "story-model".into(),
        "test-key".into(),
        format!("{}/v1", server.uri()),
        Duration::from_secs(5),
    )
}

fn request() -> ProviderRequest {
    ProviderRequest {
        messages: vec![
            ModelMessage::system("You keep the scenario tables."),
            ModelMessage::user("A dragon appears."),
        ],
        settings: GenerationSettings::default(),
        tools: vec![ToolDefinition {
            name: "read_table".into(),
            description: "Read a table".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }],
    }
}

#[tokio::test]
async fn text_answer_with_reasoning_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({ "model": "story-model", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "Noted the dragon.",
                    "reasoning_content": "A new character entered."
                },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = provider(&server).complete(&request()).await.unwrap();

    assert_eq!(response.text, "Noted the dragon.");
    assert_eq!(response.reasoning.as_deref(), Some("A new character entered."));
    assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    assert_eq!(response.usage.total_tokens, 17);
    assert!(response.tool_calls.is_empty());
}

#[tokio::test]
async fn tool_call_arguments_are_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "tools": [{ "type": "function", "function": { "name": "read_table" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "read_table", "arguments": "{\"table\":\"characters\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let response = provider(&server).complete(&request()).await.unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_9");
    assert_eq!(response.tool_calls[0].arguments, json!({ "table": "characters" }));
    assert_eq!(response.text, "");
}

#[tokio::test]
async fn unauthorized_maps_to_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request()).await.unwrap_err();

    assert!(matches!(err, NarratorError::Authentication(ref body) if body == "bad key"));
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429).set_body_json(json!({ "error": { "retry_after": 2 } })),
        )
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request()).await.unwrap_err();

    assert!(matches!(
        err,
        NarratorError::RateLimited {
            retry_after_ms: Some(2000)
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn empty_choices_is_an_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = provider(&server).complete(&request()).await.unwrap_err();

    assert!(matches!(err, NarratorError::Api { .. }));
}
