//! The staged scenario workflow: memory retrieval, then scenario update.

pub mod engine;
pub mod prompts;
pub mod stage;

pub use engine::{ScenarioResult, WorkflowEngine, WorkflowRun};
pub use stage::{Stage, WorkflowMode};
