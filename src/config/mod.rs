//! Configuration system (layered: defaults < TOML file < environment).
//!
//! ```toml
//! [model]
//! base_url = "https://api.deepseek.com/v1"
//! model = "deepseek-chat"
//!
//! [workflow]
//! mode = "full"
//! max_iterations = 12
//!
//! [stream]
//! expose_reasoning = false
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::NarratorError;
use crate::scheduler::{AdmissionMode, DuplicatePolicy};
use crate::store::render::TableFormat;
use crate::store::{default_templates, TableTemplate};
use crate::types::GenerationSettings;
use crate::workflow::WorkflowMode;

/// Workflow model endpoint and sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            temperature: Some(0.3),
            max_tokens: None,
            request_timeout_secs: 120,
        }
    }
}

impl ModelConfig {
    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings::builder()
            .maybe_temperature(self.temperature)
            .maybe_max_tokens(self.max_tokens)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub mode: WorkflowMode,
    /// Model calls allowed per stage before the loop gives up (degraded).
    pub max_iterations: usize,
    pub memory_stage_timeout_secs: u64,
    pub update_stage_timeout_secs: u64,
    /// How long a cancelled stage may take to wind down its in-flight tool.
    pub cancel_grace_ms: u64,
    /// How the tables appear in stage prompts.
    pub prompt_table_format: TableFormat,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            mode: WorkflowMode::Full,
            max_iterations: 12,
            memory_stage_timeout_secs: 60,
            update_stage_timeout_secs: 180,
            cancel_grace_ms: 2_000,
            prompt_table_format: TableFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_mode: AdmissionMode,
    pub duplicate_policy: DuplicatePolicy,
    /// Runs in flight across all sessions before new admissions are refused.
    pub max_outstanding_runs: usize,
    /// Finished run records kept per session.
    pub run_history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_mode: AdmissionMode::Blocking,
            duplicate_policy: DuplicatePolicy::Join,
            max_outstanding_runs: 16,
            run_history_limit: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Forward tool and thought frames, not only final chunks.
    pub expose_reasoning: bool,
    /// Maximum characters per final-chunk event.
    pub chunk_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            expose_reasoning: true,
            chunk_chars: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one `<session>.json` per session. In memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Table templates; the stock set when empty.
    pub tables: Vec<TableTemplate>,
}

impl StoreConfig {
    pub fn templates(&self) -> Vec<TableTemplate> {
        if self.tables.is_empty() {
            default_templates()
        } else {
            self.tables.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// UTF-8 text file searched by `lookup_external_knowledge`.
    pub file: Option<PathBuf>,
    pub wikipedia: bool,
    pub wikipedia_base_url: String,
    pub max_chars: usize,
    pub timeout_secs: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            file: None,
            wikipedia: false,
            wikipedia_base_url: "https://en.wikipedia.org".into(),
            max_chars: 2_000,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Root for the file tools; they are not offered when unset.
    pub workspace_dir: Option<PathBuf>,
    pub search_max_results: usize,
    pub search_context_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace_dir: None,
            search_max_results: 10,
            search_context_chars: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Assistant turns kept when injecting the scenario into a request.
    pub max_history_length: usize,
    /// Newest messages handed to the workflow.
    pub workflow_window: usize,
    /// Default assistant-message offset when the store has none recorded.
    pub ai_message_offset: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_history_length: 20,
            workflow_window: 40,
            ai_message_offset: 0,
        }
    }
}

/// Full configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    pub model: ModelConfig,
    pub workflow: WorkflowConfig,
    pub scheduler: SchedulerConfig,
    pub stream: StreamConfig,
    pub store: StoreConfig,
    pub knowledge: KnowledgeConfig,
    pub tools: ToolsConfig,
    pub history: HistoryConfig,
}

impl NarratorConfig {
    /// `~/.narrator/config.toml`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        directories::UserDirs::new().map(|d| d.home_dir().join(".narrator").join("config.toml"))
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, NarratorError> {
        toml::from_str(raw)
            .map_err(|e| NarratorError::Configuration(format!("invalid config: {e}")))
    }

    /// Defaults, then the file at `path` (or the default path when it
    /// exists), then `.env` and process environment. Validated.
    pub fn load(path: Option<&Path>) -> Result<Self, NarratorError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        let mut config = match file {
            Some(file) => {
                let raw = std::fs::read_to_string(&file).map_err(|e| {
                    NarratorError::Configuration(format!("cannot read {}: {e}", file.display()))
                })?;
                tracing::debug!(path = %file.display(), "loading config file");
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        let _ = dotenvy::dotenv();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NARRATOR_*` overrides from a lookup function.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), NarratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NARRATOR_API_KEY") {
            self.model.api_key = Some(v);
        }
        if let Some(v) = lookup("NARRATOR_BASE_URL") {
            self.model.base_url = v;
        }
        if let Some(v) = lookup("NARRATOR_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = lookup("NARRATOR_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("NARRATOR_EXPOSE_REASONING") {
            self.stream.expose_reasoning = parse_bool("NARRATOR_EXPOSE_REASONING", &v)?;
        }
        if let Some(v) = lookup("NARRATOR_WORKFLOW_MODE") {
            self.workflow.mode = WorkflowMode::from_str(&v).map_err(|_| {
                NarratorError::Configuration(format!("NARRATOR_WORKFLOW_MODE: unknown mode '{v}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), NarratorError> {
        let bad = |msg: &str| Err(NarratorError::Configuration(msg.to_string()));
        if self.workflow.max_iterations == 0 {
            return bad("workflow.max_iterations must be at least 1");
        }
        if self.workflow.memory_stage_timeout_secs == 0
            || self.workflow.update_stage_timeout_secs == 0
        {
            return bad("workflow stage timeouts must be positive");
        }
        if self.scheduler.max_outstanding_runs == 0 {
            return bad("scheduler.max_outstanding_runs must be at least 1");
        }
        if self.stream.chunk_chars == 0 {
            return bad("stream.chunk_chars must be at least 1");
        }
        for template in &self.store.tables {
            template.schema.check(&template.name)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, NarratorError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(NarratorError::Configuration(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        NarratorConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = NarratorConfig::from_toml_str(
            r#"
            [workflow]
            mode = "skip_memory"
            max_iterations = 4

            [stream]
            expose_reasoning = false
            "#,
        )
        .unwrap();

        assert_eq!(config.workflow.mode, WorkflowMode::SkipMemory);
        assert_eq!(config.workflow.max_iterations, 4);
        assert_eq!(config.workflow.update_stage_timeout_secs, 180);
        assert!(!config.stream.expose_reasoning);
        assert_eq!(config.model, ModelConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = NarratorConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("NARRATOR_MODEL", "deepseek-chat"),
            ("NARRATOR_EXPOSE_REASONING", "off"),
            ("NARRATOR_WORKFLOW_MODE", "forward_only"),
        ]);

        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.model.model, "deepseek-chat");
        assert!(!config.stream.expose_reasoning);
        assert_eq!(config.workflow.mode, WorkflowMode::ForwardOnly);
    }

    #[test]
    fn bad_env_boolean_is_a_configuration_error() {
        let mut config = NarratorConfig::default();
        let err = config
            .apply_env_from(|k| (k == "NARRATOR_EXPOSE_REASONING").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, NarratorError::Configuration(_)));
    }

    #[test]
    fn zero_iteration_cap_is_rejected() {
        let mut config = NarratorConfig::default();
        config.workflow.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [[store.tables]]
            name = "quests"
            schema = [{ name = "title", required = true }, { name = "status" }]
            "#,
        )
        .unwrap();

        let config = NarratorConfig::load(Some(&path)).unwrap();

        let templates = config.store.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].name, "quests");
        assert!(templates[0].schema.column("title").unwrap().required);
    }
}
