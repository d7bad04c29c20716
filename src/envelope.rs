use crate::budget::BudgetHaltEvent;
use crate::normalizer::CanonicalStatus;
use crate::schema::{Stage, WorkflowState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Completed,
    Halted,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    HaltedCostCap,
    BlockedPolicy,
    BlockedReview,
    FailedTerminal,
    FailedRetryExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageOutcome,
    pub result_code: String,
    pub reason_code: String,
    pub attempt_count: u32,
    pub stage_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seedance_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub stage: Stage,
    pub attempt_number: u32,
    pub status: CanonicalStatus,
    pub result_code: String,
    pub reason_code: String,
    pub cost_usd: f64,
    pub workflow_cost_usd: f64,
    pub daily_spend_usd: f64,
    pub seedance_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub stage: Stage,
    pub retry_index: u32,
    pub reason_code: String,
    pub result_code: String,
    pub backoff_seconds: u64,
    pub seedance_profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub stage: Stage,
    pub attempt_number: u32,
    pub seedance_profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTracking {
    pub run_date: String,
    pub per_video_budget_cap_usd: f64,
    pub daily_spend_cap_usd: f64,
    pub workflow_cost_usd: f64,
    pub daily_spend_before_usd: f64,
    pub daily_spend_after_usd: f64,
    pub budget_halt_event: Option<BudgetHaltEvent>,
}

/// Same shape on every return path, success or halt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEnvelope {
    pub workflow_id: String,
    pub status: EnvelopeStatus,
    pub state: WorkflowState,
    pub result_code: String,
    pub reason_code: String,
    /// Last forward state reached before a terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_from_state: Option<WorkflowState>,
    pub stage_order: Vec<Stage>,
    pub state_trace: Vec<WorkflowState>,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub attempt_trace: Vec<AttemptEvent>,
    pub retry_trace: Vec<RetryEvent>,
    pub seedance_profile_trace: Vec<ProfileEvent>,
    pub cost_tracking: CostTracking,
}

impl WorkflowEnvelope {
    pub fn is_published(&self) -> bool {
        self.state == WorkflowState::Published
    }

    pub fn budget_halt_event(&self) -> Option<&BudgetHaltEvent> {
        self.cost_tracking.budget_halt_event.as_ref()
    }

    pub fn backoff_schedule(&self) -> Vec<u64> {
        self.retry_trace.iter().map(|entry| entry.backoff_seconds).collect()
    }

    pub fn profiles_for(&self, stage: Stage) -> Vec<&str> {
        self.seedance_profile_trace
            .iter()
            .filter(|entry| entry.stage == stage)
            .map(|entry| entry.seedance_profile.as_str())
            .collect()
    }
}
