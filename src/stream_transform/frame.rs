//! Client-facing frames and their OpenAI-compatible SSE rendering.

use std::fmt::Write;

use serde_json::{json, Value};

use crate::agent_loop::{RunStatus, StreamEvent, StreamEventKind};
use crate::util::text::truncate_utf8;

/// Model name reported in workflow chunks.
pub const WORKFLOW_MODEL: &str = "narrator-workflow";
/// Finish reason of the terminal sentinel chunk.
pub const WORKFLOW_COMPLETE: &str = "workflow_complete";

const ARGUMENT_PREVIEW: usize = 100;
const RESULT_PREVIEW: usize = 200;

/// One client-facing item.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// Always the last frame of a converted stream.
    Done { status: RunStatus },
}

impl Frame {
    /// `event_type` of the rendered chunk.
    pub fn event_type(&self) -> String {
        match self {
            Frame::Event(event) => event.kind.to_string(),
            Frame::Done { .. } => WORKFLOW_COMPLETE.to_string(),
        }
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            Frame::Event(event) => Some(event.seq),
            Frame::Done { .. } => None,
        }
    }

    /// Human-readable delta text.
    pub fn content(&self) -> String {
        match self {
            Frame::Done { .. } => String::new(),
            Frame::Event(event) => event_content(event),
        }
    }

    /// `chat.completion.chunk` body for this frame.
    pub fn to_chunk(&self, request_id: &str, created: i64) -> Value {
        let (delta, finish_reason, extra) = match self {
            Frame::Done { status } => (
                json!({}),
                Value::from(WORKFLOW_COMPLETE),
                json!({ "workflow_status": status.to_string() }),
            ),
            Frame::Event(event) => (
                json!({ "role": "assistant", "content": self.content() }),
                Value::Null,
                json!({
                    "seq": event.seq,
                    "stage": event.stage,
                    "run_id": event.run_id,
                    "payload": event.payload,
                }),
            ),
        };
        let mut chunk = json!({
            "id": format!("chatcmpl-{request_id}"),
            "object": "chat.completion.chunk",
            "created": created,
            "model": WORKFLOW_MODEL,
            "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
            "workflow_event": true,
            "event_type": self.event_type(),
        });
        if let (Some(chunk), Value::Object(extra)) = (chunk.as_object_mut(), extra) {
            chunk.extend(extra);
        }
        chunk
    }

    /// One `data:` line, blank-line terminated.
    pub fn to_sse(&self, request_id: &str, created: i64) -> String {
        format!("data: {}\n\n", self.to_chunk(request_id, created))
    }
}

fn preview(value: &Value, max: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.len() > max {
        format!("{}...", truncate_utf8(&text, max))
    } else {
        text
    }
}

fn event_content(event: &StreamEvent) -> String {
    let payload = &event.payload;
    let tool = payload.get("tool").and_then(Value::as_str).unwrap_or("?");
    match event.kind {
        StreamEventKind::FinalChunk | StreamEventKind::ThoughtToken => payload
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        StreamEventKind::ToolInvoked => {
            let mut out = format!("\n[{}] calling tool: {tool}\n", event.stage);
            if let Some(args) = payload.get("arguments").and_then(Value::as_object) {
                for (key, value) in args {
                    let _ = writeln!(out, "  {key}: {}", preview(value, ARGUMENT_PREVIEW));
                }
            }
            out
        }
        StreamEventKind::ToolResult => {
            let outcome = payload.get("outcome").and_then(Value::as_str).unwrap_or("unknown");
            let result = payload.get("result").unwrap_or(&Value::Null);
            format!(
                "[{}] tool {tool} finished ({outcome}): {}\n",
                event.stage,
                preview(result, RESULT_PREVIEW)
            )
        }
    }
}
