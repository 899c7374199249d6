//! Core run types for the tool loop and workflow runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::OutcomeKind;
use crate::types::Usage;

/// Unique run identifier.
pub type RunId = Uuid;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Running,
    Committed,
    Failed,
    TimedOut,
}

/// One tool call as it happened, for the run trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub stage: String,
    pub iteration: usize,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub result: serde_json::Value,
    pub outcome: OutcomeKind,
}

/// What a finished tool loop produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopOutput {
    /// Final answer, or the last interim text when the cap was hit.
    pub text: String,
    pub trace: Vec<ToolCallRecord>,
    /// Model calls made.
    pub iterations: usize,
    /// The iteration cap was reached while the model still wanted tools.
    pub degraded: bool,
    pub usage: Usage,
}
