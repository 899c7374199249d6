//! Error types for narrator.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

/// Primary error type for all narrator operations.
#[derive(Error, Debug)]
pub enum NarratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed tool call, unknown table/field/row, or a schema violation.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Workflow stage '{stage}' exceeded its {budget_ms}ms budget")]
    WorkflowTimeout { stage: String, budget_ms: u64 },

    #[error("Persistence error at {path}: {message}")]
    Persistence { path: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl NarratorError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn persistence(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::WorkflowTimeout { .. } => ErrorCategory::Timeout,
            Self::Persistence { .. } | Self::Io(_) => ErrorCategory::Persistence,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) => ErrorCategory::Network,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::Provider { .. } => ErrorCategory::Api,
            Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
                | ErrorCategory::Persistence
        )
    }

    /// Whether a tool loop should feed this error back to the model instead
    /// of stopping.
    pub fn is_recoverable_in_loop(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::ToolExecution
        )
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Validation => RecoverySuggestion::CorrectArguments,
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::RateLimit => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Network => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Server => RecoverySuggestion::RetryWithBackoff,
            ErrorCategory::Persistence => RecoverySuggestion::CheckStorage,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, NarratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_tool_errors_are_recoverable_in_loop() {
        assert!(NarratorError::validation("bad").is_recoverable_in_loop());
        assert!(NarratorError::tool("think", "boom").is_recoverable_in_loop());
        assert!(!NarratorError::Cancelled.is_recoverable_in_loop());
        assert!(!NarratorError::persistence("/tmp/x", "disk full").is_recoverable_in_loop());
    }

    #[test]
    fn persistence_errors_are_retryable_once_by_policy() {
        let err = NarratorError::persistence("/tmp/x", "rename failed");
        assert!(err.is_retryable());
        assert_eq!(err.recovery_suggestion(), RecoverySuggestion::CheckStorage);
    }

    #[test]
    fn api_status_maps_to_category() {
        assert_eq!(NarratorError::api(401, "x").category(), ErrorCategory::Authentication);
        assert_eq!(NarratorError::api(503, "x").category(), ErrorCategory::Server);
        assert_eq!(NarratorError::api(400, "x").category(), ErrorCategory::Api);
    }
}
