//! OpenAI-compatible Chat Completions provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::NarratorError;
use crate::types::*;

use super::http::{bearer_headers, shared_client, status_to_error};
use super::{ModelProvider, ProviderRequest, ProviderResponse};

/// Any endpoint that speaks `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleProvider {
    model: String,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(model: String, api_key: String, base_url: String, timeout: Duration) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn build_request_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> =
            request.messages.iter().flat_map(message_to_openai).collect();

        let mut obj = serde_json::Map::new();
        obj.insert("model".into(), self.model.clone().into());
        obj.insert("messages".into(), messages.into());
        obj.insert("stream".into(), false.into());

        let s = &request.settings;
        if let Some(max) = s.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = s.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = s.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(pp) = s.presence_penalty {
            obj.insert("presence_penalty".into(), pp.into());
        }
        if let Some(fp) = s.frequency_penalty {
            obj.insert("frequency_penalty".into(), fp.into());
        }
        if let Some(seed) = s.seed {
            obj.insert("seed".into(), seed.into());
        }

        if !request.tools.is_empty() {
            let tool_defs: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        serde_json::Value::Object(obj)
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn provider_name(&self) -> &str {
        "openai-compatible"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, NarratorError> {
        let body = self.build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat completion request"
        );

        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }

        let data: ChatResponse = resp.json().await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| NarratorError::api(status, "No choices in chat completion response"))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments)),
            })
            .collect();

        Ok(ProviderResponse {
            text: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            tool_calls,
            finish_reason: choice.finish_reason.as_deref().and_then(|s| s.parse().ok()),
            usage: data
                .usage
                .map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                    ..Default::default()
                })
                .unwrap_or_default(),
        })
    }
}

/// One internal message may expand to several wire messages (one per tool
/// result).
fn message_to_openai(msg: &ModelMessage) -> Vec<serde_json::Value> {
    let role = msg.role.as_str();

    if msg.role == Role::Tool {
        return msg
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult(tr) => Some(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id,
                    "content": match &tr.result {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                })),
                _ => None,
            })
            .collect();
    }

    let tool_calls = msg.tool_calls();
    if !tool_calls.is_empty() {
        let tc_json: Vec<serde_json::Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": match &tc.arguments {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                    }
                })
            })
            .collect();
        let text = msg.text();
        return vec![serde_json::json!({
            "role": role,
            "content": if text.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(text)
            },
            "tool_calls": tc_json,
        })];
    }

    vec![serde_json::json!({ "role": role, "content": msg.text() })]
}

// Chat Completions response types (internal)

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunction,
}

#[derive(Deserialize)]
struct ChatFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
