//! Built-in stage tools.
//!
//! `think`, `search_history` and `lookup_external_knowledge` are read-only
//! and offered to the memory stage. The file tools are confined to a
//! [`Workspace`] root; `write_file` and `edit_file` are mutating.
//!
//! ```rust
//! use narrator::tools::builtin::think_tool;
//!
//! let tool = think_tool();
//! assert_eq!(tool.name(), "think");
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::error::NarratorError;
use crate::history::{search_history, SearchScope};
use crate::knowledge::KnowledgeBase;
use crate::tools::tool::{AgentTool, Tool, ToolExecutionContext};
use crate::tools::types::AgentToolParameters;
use crate::types::ChatMessage;
use crate::util::text::truncate_utf8;

const READ_FILE_MAX_BYTES: usize = 65_536;
const SEARCH_MAX_RESULTS_CEILING: u64 = 100;

/// Create the `think` tool. It records a thought and does nothing else.
pub fn think_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "think",
        "Write down reasoning before acting. Has no side effects",
        AgentToolParameters::object()
            .string("thought", "The reasoning step", true)
            .build(),
        |args, ctx: ToolExecutionContext| async move {
            let thought = args.get_str("thought")?;
            tracing::debug!(stage = %ctx.stage, iteration = ctx.iteration, %thought, "think");
            Ok(json!({ "recorded": true }))
        },
    ))
}

/// Create the `search_history` tool over a fixed transcript.
pub fn search_history_tool(
    history: Arc<[ChatMessage]>,
    default_max_results: usize,
    context_chars: usize,
) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "search_history",
        "Regex search over the conversation. Prefer linked patterns such as \
         '(Ash|the knight).*?(sword)|(sword).*?(Ash|the knight)' over bare word lists",
        AgentToolParameters::object()
            .string("pattern", "Regular expression; '.' also matches newlines", true)
            .string_enum(
                "scope",
                "Which messages to search (default all)",
                &["all", "user", "assistant"],
                false,
            )
            .integer("max_results", "Maximum hits to return, 1-100", false)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let history = history.clone();
            async move {
                let pattern = args.get_str("pattern")?;
                let scope = match args.get_str_opt("scope") {
                    Some(raw) => raw
                        .parse::<SearchScope>()
                        .map_err(|_| NarratorError::validation(format!("unknown scope '{raw}'")))?,
                    None => SearchScope::All,
                };
                let max_results = args
                    .get_u64_opt("max_results")
                    .map(|n| n.clamp(1, SEARCH_MAX_RESULTS_CEILING) as usize)
                    .unwrap_or(default_max_results);
                let report = search_history(&history, pattern, scope, max_results, context_chars);
                Ok(serde_json::to_value(report)?)
            }
        },
    ))
}

/// Create the `lookup_external_knowledge` tool. Lookups never fail; a
/// broken source yields an empty, `degraded` answer.
pub fn lookup_knowledge_tool(knowledge: KnowledgeBase) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "lookup_external_knowledge",
        "Look up background facts about a single term (a name, place or concept), not a sentence",
        AgentToolParameters::object()
            .string("query", "A single term", true)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let knowledge = knowledge.clone();
            async move {
                let query = args.get_str("query")?;
                Ok(serde_json::to_value(knowledge.lookup(query).await)?)
            }
        },
    ))
}

/// A directory the file tools may not leave.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative to the root, or absolute inside it) without
    /// touching the file system.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, NarratorError> {
        let requested = Path::new(path);
        let relative = if requested.is_absolute() {
            requested.strip_prefix(&self.root).map_err(|_| {
                NarratorError::validation(format!(
                    "path must be inside the workspace ({}): {path}",
                    self.root.display()
                ))
            })?
        } else {
            requested
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                _ => {
                    return Err(NarratorError::validation(format!(
                        "path escapes the workspace: {path}"
                    )))
                }
            }
        }
        if depth == 0 {
            return Err(NarratorError::validation(format!("path names no file: {path}")));
        }
        Ok(resolved)
    }
}

fn io_error(tool: &str, path: &Path, e: std::io::Error) -> NarratorError {
    NarratorError::tool(tool, format!("{}: {e}", path.display()))
}

/// Create the `read_file` tool. Content is capped at 64 KB.
pub fn read_file_tool(workspace: Workspace) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "read_file",
        "Read a workspace file as UTF-8 text",
        AgentToolParameters::object()
            .string("path", "Path relative to the workspace", true)
            .build(),
        move |args, _ctx: ToolExecutionContext| {
            let workspace = workspace.clone();
            async move {
                let path = workspace.resolve(args.get_str("path")?)?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| io_error("read_file", &path, e))?;

                let total_bytes = content.len();
                let truncated = total_bytes > READ_FILE_MAX_BYTES;
                let display = if truncated {
                    let mut s = truncate_utf8(&content, READ_FILE_MAX_BYTES);
                    s.push_str("\n... (truncated)");
                    s
                } else {
                    content
                };

                Ok(json!({
                    "content": display,
                    "bytes": total_bytes,
                    "truncated": truncated,
                }))
            }
        },
    ))
}

/// Create the `write_file` tool. Parent directories are created.
pub fn write_file_tool(workspace: Workspace) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "write_file",
            "Write a workspace file, replacing any existing content",
            AgentToolParameters::object()
                .string("path", "Path relative to the workspace", true)
                .string("content", "Full file content", true)
                .build(),
            move |args, _ctx: ToolExecutionContext| {
                let workspace = workspace.clone();
                async move {
                    let path = workspace.resolve(args.get_str("path")?)?;
                    let content = args.get_str("content")?;
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| io_error("write_file", parent, e))?;
                    }
                    tokio::fs::write(&path, content)
                        .await
                        .map_err(|e| io_error("write_file", &path, e))?;
                    Ok(json!({
                        "path": path.display().to_string(),
                        "bytes_written": content.len(),
                    }))
                }
            },
        )
        .mutating(),
    )
}

/// Replace `old` with `new` in `current`, checking the occurrence count.
///
/// An empty `old` creates a new file and is only valid when `current` is
/// `None`.
fn apply_edit(
    current: Option<&str>,
    old: &str,
    new: &str,
    expected: usize,
) -> Result<String, String> {
    match current {
        None if old.is_empty() => Ok(new.to_string()),
        None => Err("file not found; use an empty old_string to create it".into()),
        Some(_) if old.is_empty() => {
            Err("file already exists; old_string must not be empty".into())
        }
        Some(content) => {
            let found = content.matches(old).count();
            if found == 0 {
                Err("old_string was not found in the file".into())
            } else if found != expected {
                let noun = if expected == 1 { "occurrence" } else { "occurrences" };
                Err(format!("expected {expected} {noun} but found {found}"))
            } else if old == new {
                Err("old_string and new_string are identical".into())
            } else {
                Ok(content.replace(old, new))
            }
        }
    }
}

/// Create the `edit_file` tool.
pub fn edit_file_tool(workspace: Workspace) -> Arc<dyn Tool> {
    Arc::new(
        AgentTool::new(
            "edit_file",
            "Replace exact text in a workspace file. Give enough surrounding context to match \
             only the intended spot; set expected_replacements to replace several",
            AgentToolParameters::object()
                .string("path", "Path relative to the workspace", true)
                .string("old_string", "Exact text to replace; empty creates a new file", true)
                .string("new_string", "Replacement text", true)
                .integer("expected_replacements", "Occurrences to replace (default 1)", false)
                .build(),
            move |args, _ctx: ToolExecutionContext| {
                let workspace = workspace.clone();
                async move {
                    let path = workspace.resolve(args.get_str("path")?)?;
                    let old = args.get_str("old_string")?;
                    let new = args.get_str("new_string")?;
                    let expected = args.get_u64_opt("expected_replacements").unwrap_or(1) as usize;

                    let current = match tokio::fs::read_to_string(&path).await {
                        Ok(text) => Some(text.replace("\r\n", "\n")),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(io_error("edit_file", &path, e)),
                    };
                    let created = current.is_none();
                    let updated = apply_edit(current.as_deref(), old, new, expected)
                        .map_err(|msg| NarratorError::tool("edit_file", msg))?;

                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| io_error("edit_file", parent, e))?;
                    }
                    tokio::fs::write(&path, &updated)
                        .await
                        .map_err(|e| io_error("edit_file", &path, e))?;

                    Ok(json!({
                        "path": path.display().to_string(),
                        "created": created,
                        "replacements": if created { 0 } else { expected },
                    }))
                }
            },
        )
        .mutating(),
    )
}

/// The three file tools over one workspace.
pub fn file_tools(workspace: &Workspace) -> Vec<Arc<dyn Tool>> {
    vec![
        read_file_tool(workspace.clone()),
        write_file_tool(workspace.clone()),
        edit_file_tool(workspace.clone()),
    ]
}
