//! Pipeline stages and the transition table that orders them.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::tools::ToolAccess;

/// One phase of the workflow pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    /// Search history and outside knowledge; writes a memory note.
    MemoryRetrieval,
    /// Edit the tables and write the new summary.
    ScenarioUpdate,
}

impl Stage {
    /// Snake-case name used in event and log fields.
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Highest tool access the stage's registry admits.
    pub fn access(self) -> ToolAccess {
        match self {
            Stage::MemoryRetrieval => ToolAccess::ReadOnly,
            Stage::ScenarioUpdate => ToolAccess::Mutating,
        }
    }
}

/// Which stages a run goes through.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowMode {
    /// Memory retrieval, then scenario update.
    #[default]
    Full,
    /// Scenario update only.
    SkipMemory,
    /// No stages; the committed state is returned as is.
    ForwardOnly,
}

impl WorkflowMode {
    /// First stage, or `None` when the mode runs nothing.
    pub fn entry(self) -> Option<Stage> {
        match self {
            WorkflowMode::Full => Some(Stage::MemoryRetrieval),
            WorkflowMode::SkipMemory => Some(Stage::ScenarioUpdate),
            WorkflowMode::ForwardOnly => None,
        }
    }

    /// Stage after `stage`, or `None` when the run is done.
    pub fn next(self, stage: Stage) -> Option<Stage> {
        match (self, stage) {
            (WorkflowMode::Full, Stage::MemoryRetrieval) => Some(Stage::ScenarioUpdate),
            (_, Stage::ScenarioUpdate) => None,
            (WorkflowMode::SkipMemory | WorkflowMode::ForwardOnly, Stage::MemoryRetrieval) => None,
        }
    }

    /// Every stage in run order.
    pub fn stages(self) -> Vec<Stage> {
        std::iter::successors(self.entry(), |s| self.next(*s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn modes_select_stage_sequences() {
        assert_eq!(
            WorkflowMode::Full.stages(),
            vec![Stage::MemoryRetrieval, Stage::ScenarioUpdate]
        );
        assert_eq!(WorkflowMode::SkipMemory.stages(), vec![Stage::ScenarioUpdate]);
        assert!(WorkflowMode::ForwardOnly.stages().is_empty());
    }

    #[test]
    fn only_update_stage_may_mutate() {
        assert_eq!(Stage::MemoryRetrieval.access(), ToolAccess::ReadOnly);
        assert_eq!(Stage::ScenarioUpdate.access(), ToolAccess::Mutating);
    }

    #[test]
    fn names_round_trip_through_strings() {
        assert_eq!(Stage::MemoryRetrieval.to_string(), "memory_retrieval");
        assert_eq!(WorkflowMode::from_str("skip_memory").unwrap(), WorkflowMode::SkipMemory);
        assert!(WorkflowMode::from_str("turbo").is_err());
    }
}
