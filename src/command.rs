//! Control directives typed into the chat (`$show`, `$rm`, ...).
//!
//! The router answers directives itself; no model or tool is involved.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use strum::{Display, EnumString};
use tracing::{info, warn};

use crate::error::NarratorError;
use crate::history::auto_find_ai_message_index;
use crate::session::SessionCatalog;
use crate::store::render::scenario_text;
use crate::types::{ChatMessage, Role};

static DIRECTIVE: OnceLock<Option<Regex>> = OnceLock::new();

fn directive_regex() -> Option<&'static Regex> {
    DIRECTIVE
        .get_or_init(|| Regex::new(r"(?i)\$(show|rm|reset|reindex|help|drp)\b").ok())
        .as_ref()
}

const HELP: &str = "\
Available commands:
- $show: display the current scenario and tables
- $rm / $reset: clear every table and the scenario summary
- $reindex: re-detect which assistant message the workflow reads
- $help / $drp: show this list";

/// A recognized control directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Directive {
    Show,
    #[strum(serialize = "reset", serialize = "rm")]
    Reset,
    Reindex,
    #[strum(serialize = "help", serialize = "drp")]
    Help,
}

/// A synthesized answer to a directive.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub directive: Directive,
    pub text: String,
}

impl CommandReply {
    /// `chat.completion` body carrying the reply.
    pub fn to_completion_json(&self, model: &str, request_id: &str) -> Value {
        json!({
            "id": format!("chatcmpl-{request_id}"),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": self.text },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
        })
    }

    /// Single `chat.completion.chunk` body, for streaming clients.
    pub fn to_chunk_json(&self, model: &str, request_id: &str) -> Value {
        json!({
            "id": format!("chatcmpl-{request_id}"),
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "role": "assistant", "content": self.text },
                "finish_reason": "stop",
            }],
        })
    }
}

/// Directive in the newest user message, if any.
pub fn parse_directive(messages: &[ChatMessage]) -> Option<Directive> {
    let newest = messages.iter().rev().find(|m| m.role == Role::User)?;
    let token = directive_regex()?.captures(&newest.content)?.get(1)?.as_str();
    token.parse().ok()
}

/// Intercepts directives before a workflow run is admitted.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    catalog: SessionCatalog,
}

impl CommandRouter {
    pub fn new(catalog: SessionCatalog) -> Self {
        Self { catalog }
    }

    /// Handle a directive; `None` means the request is not a directive and
    /// should go on to the scheduler.
    pub async fn route(&self, session: &str, messages: &[ChatMessage]) -> Option<CommandReply> {
        let directive = parse_directive(messages)?;
        info!(session, %directive, "directive received");
        let text = match self.execute(directive, session, messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!(session, %directive, error = %e, "directive failed");
                format!("Command ${directive} failed: {e}")
            }
        };
        Some(CommandReply { directive, text })
    }

    async fn execute(
        &self,
        directive: Directive,
        session: &str,
        messages: &[ChatMessage],
    ) -> Result<String, NarratorError> {
        if directive == Directive::Help {
            return Ok(HELP.to_string());
        }
        let store = self.catalog.store(session).await?;
        match directive {
            Directive::Show => Ok(format!(
                "Current scenario:\n\n{}",
                scenario_text(&store.snapshot())
            )),
            Directive::Reset => {
                store.reset().await?;
                Ok("Scenario tables and summary have been reset.".to_string())
            }
            Directive::Reindex => {
                let offset = auto_find_ai_message_index(messages);
                store.set_ai_message_offset(offset).await?;
                Ok(format!("Assistant message offset set to {offset}."))
            }
            Directive::Help => Ok(HELP.to_string()),
        }
    }
}
