//! Name-indexed tool registry with per-stage access control.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolExecutionContext};
use super::types::ToolAccess;
use super::validation::validate_arguments;
use crate::error::NarratorError;
use crate::provider::ToolDefinition;
use crate::types::ToolCall;

/// Classification of a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    ValidationError,
    ExecutionError,
    Fatal,
}

/// Result of [`ToolRegistry::invoke`].
#[derive(Debug)]
pub enum ToolOutcome {
    Success(serde_json::Value),
    /// Unknown tool, forbidden access, or arguments that do not fit the schema.
    ValidationFailed(String),
    /// The tool ran and failed, or panicked.
    ExecutionFailed(String),
    /// An error the loop must not swallow (persistence, cancellation).
    Fatal(NarratorError),
}

impl ToolOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Success,
            Self::ValidationFailed(_) => OutcomeKind::ValidationError,
            Self::ExecutionFailed(_) => OutcomeKind::ExecutionError,
            Self::Fatal(_) => OutcomeKind::Fatal,
        }
    }

    /// JSON fed back to the model as the tool result.
    pub fn to_result_json(&self) -> serde_json::Value {
        match self {
            Self::Success(value) => value.clone(),
            Self::ValidationFailed(message) => serde_json::json!({
                "error": { "kind": "validation", "message": message },
            }),
            Self::ExecutionFailed(message) => serde_json::json!({
                "error": { "kind": "tool_execution", "message": message },
            }),
            Self::Fatal(err) => serde_json::json!({
                "error": { "kind": "fatal", "message": err.to_string() },
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success(_))
    }
}

/// Registry of tools available to one loop.
///
/// A registry is created with the highest access level it admits; a
/// read-only registry refuses to register or invoke mutating tools.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
    permitted: ToolAccess,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("permitted", &self.permitted)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(permitted: ToolAccess) -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            permitted,
        }
    }

    pub fn read_only() -> Self {
        Self::new(ToolAccess::ReadOnly)
    }

    pub fn with_mutation() -> Self {
        Self::new(ToolAccess::Mutating)
    }

    pub fn permitted(&self) -> ToolAccess {
        self.permitted
    }

    /// Register a tool. Fails on duplicate names and on mutating tools in a
    /// read-only registry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), NarratorError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(NarratorError::Configuration(format!(
                "tool '{name}' registered twice"
            )));
        }
        if !self.allows(tool.access()) {
            return Err(NarratorError::Configuration(format!(
                "tool '{name}' mutates state and cannot be registered in a read-only stage"
            )));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Register every tool in order.
    pub fn register_all(
        &mut self,
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
    ) -> Result<(), NarratorError> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    fn allows(&self, access: ToolAccess) -> bool {
        access == ToolAccess::ReadOnly || self.permitted == ToolAccess::Mutating
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Definitions advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters().schema.clone(),
            })
            .collect()
    }

    /// Validate and execute one call. Never panics and never returns a
    /// recoverable error as `Fatal`.
    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolExecutionContext) -> ToolOutcome {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutcome::ValidationFailed(format!(
                "unknown tool '{}'; available tools: {}",
                call.name,
                self.names().join(", ")
            ));
        };

        if !self.allows(tool.access()) {
            return ToolOutcome::ValidationFailed(format!(
                "tool '{}' is not permitted in this stage",
                call.name
            ));
        }

        let args = match normalize_arguments(&call.arguments) {
            Ok(args) => args,
            Err(message) => return ToolOutcome::ValidationFailed(message),
        };

        if let Err(message) = validate_arguments(&args, &tool.parameters().schema) {
            return ToolOutcome::ValidationFailed(format!("{}: {message}", call.name));
        }

        let args = ToolArguments::new(args);
        let result = AssertUnwindSafe(tool.execute(&args, ctx))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(value)) => ToolOutcome::Success(value),
            Ok(Err(NarratorError::Validation(message))) => ToolOutcome::ValidationFailed(message),
            Ok(Err(err)) if err.is_recoverable_in_loop() => {
                ToolOutcome::ExecutionFailed(err.to_string())
            }
            Ok(Err(err)) => ToolOutcome::Fatal(err),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %call.name, %detail, "tool panicked");
                ToolOutcome::ExecutionFailed(format!("tool '{}' panicked: {detail}", call.name))
            }
        }
    }
}

/// Providers may hand arguments over as a JSON string; parse those.
fn normalize_arguments(raw: &serde_json::Value) -> Result<serde_json::Value, String> {
    match raw {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(serde_json::json!({}));
            }
            serde_json::from_str(trimmed)
                .map_err(|e| format!("arguments are not valid JSON: {e}"))
        }
        serde_json::Value::Null => Ok(serde_json::json!({})),
        other => Ok(other.clone()),
    }
}
