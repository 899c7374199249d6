//! Token accounting across the model turns of one run.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// Tokens reported by the model for one or more turns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl Usage {
    /// Fold another turn's counts into this total.
    pub fn merge(&mut self, turn: &Usage) {
        *self += *turn;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, turn: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(turn.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(turn.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(turn.total_tokens);
        self.reasoning_tokens = match (self.reasoning_tokens, turn.reasoning_tokens) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
        };
    }
}
