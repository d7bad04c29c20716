use crate::error::OrchestrationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the six fixed production stages, in pipeline order.
///
/// `Ord` follows declaration order, so ordered maps keyed by `Stage`
/// iterate in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TrendIngestion,
    ScriptGeneration,
    SceneGeneration,
    Localization,
    Review,
    Publish,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Self::TrendIngestion,
        Self::ScriptGeneration,
        Self::SceneGeneration,
        Self::Localization,
        Self::Review,
        Self::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrendIngestion => "trend_ingestion",
            Self::ScriptGeneration => "script_generation",
            Self::SceneGeneration => "scene_generation",
            Self::Localization => "localization",
            Self::Review => "review",
            Self::Publish => "publish",
        }
    }

    /// State the run moves into once this stage succeeds.
    pub fn success_state(&self) -> WorkflowState {
        match self {
            Self::TrendIngestion => WorkflowState::TrendIngested,
            Self::ScriptGeneration => WorkflowState::ScriptGenerated,
            Self::SceneGeneration => WorkflowState::ScenesGenerated,
            Self::Localization => WorkflowState::Localized,
            Self::Review => WorkflowState::Approved,
            Self::Publish => WorkflowState::Published,
        }
    }

    /// Only scene synthesis walks the quality/cost profile list.
    pub fn carries_profile(&self) -> bool {
        matches!(self, Self::SceneGeneration)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = OrchestrationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "trend_ingestion" => Ok(Self::TrendIngestion),
            "script_generation" => Ok(Self::ScriptGeneration),
            "scene_generation" => Ok(Self::SceneGeneration),
            "localization" => Ok(Self::Localization),
            "review" => Ok(Self::Review),
            "publish" => Ok(Self::Publish),
            _ => Err(OrchestrationError::UnknownStage(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    TrendIngested,
    ScriptGenerated,
    ScenesGenerated,
    Localized,
    Approved,
    Published,
    HaltedCostCap,
    FailedRetryExhausted,
    BlockedPolicy,
    BlockedReviewGate,
    FailedTerminal,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::TrendIngested => "trend_ingested",
            Self::ScriptGenerated => "script_generated",
            Self::ScenesGenerated => "scenes_generated",
            Self::Localized => "localized",
            Self::Approved => "approved",
            Self::Published => "published",
            Self::HaltedCostCap => "halted_cost_cap",
            Self::FailedRetryExhausted => "failed_retry_exhausted",
            Self::BlockedPolicy => "blocked_policy",
            Self::BlockedReviewGate => "blocked_review_gate",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    /// Non-success end states. `Published` ends a run too but is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::HaltedCostCap
                | Self::FailedRetryExhausted
                | Self::BlockedPolicy
                | Self::BlockedReviewGate
                | Self::FailedTerminal
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Stage, WorkflowState};
    use std::str::FromStr;

    #[test]
    fn stage_order_maps_onto_forward_states() {
        let states: Vec<WorkflowState> = Stage::ORDER.iter().map(|s| s.success_state()).collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::TrendIngested,
                WorkflowState::ScriptGenerated,
                WorkflowState::ScenesGenerated,
                WorkflowState::Localized,
                WorkflowState::Approved,
                WorkflowState::Published,
            ]
        );
        assert!(Stage::ORDER.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn stage_names_round_trip_and_reject_unknown() {
        for stage in Stage::ORDER {
            assert_eq!(Stage::from_str(stage.as_str()).expect("known stage"), stage);
        }
        let error = Stage::from_str("render").expect_err("unknown stage");
        assert_eq!(error.code(), "WORKFLOW_STAGE_UNKNOWN");
    }

    #[test]
    fn only_failure_states_are_terminal() {
        assert!(!WorkflowState::Published.is_terminal());
        assert!(!WorkflowState::Created.is_terminal());
        assert!(WorkflowState::HaltedCostCap.is_terminal());
        assert!(WorkflowState::BlockedReviewGate.is_terminal());
        assert_eq!(
            serde_json::to_string(&WorkflowState::BlockedReviewGate).expect("serialize"),
            "\"blocked_review_gate\""
        );
    }
}
