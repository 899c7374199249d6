//! Convenience re-exports for common use.

pub use crate::agent_loop::{RunStatus, StreamEvent, StreamEventKind};
pub use crate::command::{CommandReply, CommandRouter, Directive};
pub use crate::config::NarratorConfig;
pub use crate::error::{NarratorError, Result};
pub use crate::gateway::{Narrator, Prepared, PreparedStream};
pub use crate::provider::ModelProvider;
pub use crate::scheduler::{Admission, AdmissionMode, AdmissionOutcome, UpdateScheduler};
pub use crate::session::{ScenarioState, SessionCatalog};
pub use crate::store::TableStore;
pub use crate::stream_transform::{Frame, StreamEventConverter};
pub use crate::types::{ChatMessage, Role};
pub use crate::workflow::{ScenarioResult, WorkflowEngine, WorkflowMode};
