//! Tool system for function calling.

pub mod arguments;
pub mod builtin;
pub mod registry;
pub mod table;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use registry::{OutcomeKind, ToolOutcome, ToolRegistry};
pub use table::{table_tools, TableSource, TransactionHandle};
pub use tool::{AgentTool, Tool, ToolExecutionContext};
pub use types::{AgentToolParameters, ToolAccess};
