//! Unified error classification and recovery.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    ToolExecution,
    Timeout,
    Persistence,
    Cancelled,
    Authentication,
    RateLimit,
    Network,
    Server,
    Api,
    Configuration,
    Serialization,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    CorrectArguments,
    RetryWithBackoff,
    CheckCredentials,
    CheckConfiguration,
    CheckStorage,
    IncreaseTimeout,
    CheckToolImplementation,
    ContactSupport,
}

impl RecoverySuggestion {
    /// One-line advice for a human operator.
    pub fn hint(self) -> &'static str {
        match self {
            Self::CorrectArguments => "check the arguments and try again",
            Self::RetryWithBackoff => "wait a moment and retry",
            Self::CheckCredentials => "check NARRATOR_API_KEY or model.api_key",
            Self::CheckConfiguration => "check the config file and NARRATOR_* variables",
            Self::CheckStorage => "check that the data directory is writable",
            Self::IncreaseTimeout => "raise the workflow stage timeouts",
            Self::CheckToolImplementation => "inspect the failing tool's inputs",
            Self::ContactSupport => "see the logs (RUST_LOG=narrator=debug) for details",
        }
    }
}
