//! Typed access to tool call arguments.

use crate::error::NarratorError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, NarratorError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing("string", key))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an optional unsigned integer argument.
    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    /// Get any JSON value by key.
    pub fn get_value(&self, key: &str) -> Result<&serde_json::Value, NarratorError> {
        self.value.get(key).ok_or_else(|| missing("", key))
    }

    /// Get a nested object.
    pub fn get_object(
        &self,
        key: &str,
    ) -> Result<&serde_json::Map<String, serde_json::Value>, NarratorError> {
        self.value
            .get(key)
            .and_then(|v| v.as_object())
            .ok_or_else(|| missing("object", key))
    }
}

fn missing(kind: &str, key: &str) -> NarratorError {
    if kind.is_empty() {
        NarratorError::Validation(format!("Missing argument: {key}"))
    } else {
        NarratorError::Validation(format!("Missing {kind} argument: {key}"))
    }
}
