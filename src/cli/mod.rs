//! CLI entry point for narrator.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::NarratorError;
use crate::types::ChatMessage;
use crate::workflow::WorkflowMode;

/// Narrator scenario workflow CLI
#[derive(Parser, Debug)]
#[command(name = "narrator", version, about = "Scenario workflow engine for role-play chats")]
pub struct Cli {
    /// Config file (defaults to ~/.narrator/config.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding one scenario file per session
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Session id
    #[arg(short, long, global = true, default_value = "default")]
    pub session: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the workflow for a transcript and print the injected scenario
    Update(UpdateArgs),
    /// Print the session's current scenario
    Show,
    /// Clear the session's tables and summary
    Reset,
    /// Run a chat directive such as "$show" through the router
    Command(CommandArgs),
}

/// Arguments for `narrator update`.
#[derive(Parser, Debug)]
pub struct UpdateArgs {
    /// JSON file with an array of {"role", "content"} messages
    pub transcript: PathBuf,

    /// Print progress as SSE frames while the workflow runs
    #[arg(long)]
    pub stream: bool,

    /// Override the workflow mode (full, skip_memory, forward_only)
    #[arg(long)]
    pub mode: Option<WorkflowMode>,
}

/// Arguments for `narrator command`.
#[derive(Parser, Debug)]
pub struct CommandArgs {
    /// Message text containing the directive
    pub text: String,
}

/// Read a transcript file into chat messages.
pub fn load_transcript(path: &std::path::Path) -> Result<Vec<ChatMessage>, NarratorError> {
    let raw = std::fs::read_to_string(path)?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&raw)?;
    if messages.is_empty() {
        return Err(NarratorError::validation(format!(
            "{} contains no messages",
            path.display()
        )));
    }
    Ok(messages)
}
