use crate::ledger::LedgerError;
use thiserror::Error;

/// Errors raised by the orchestration engine itself.
///
/// These are configuration or contract violations, never stage outcomes:
/// a stage that fails is reported inside the envelope, not through this type.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("workflow_id is required")]
    WorkflowIdRequired,
    #[error("run_date must use YYYY-MM-DD (got {0:?})")]
    RunDateInvalid(String),
    #[error("per_video_budget_cap_usd must be greater than zero")]
    PerVideoBudgetInvalid,
    #[error("daily_spend_cap_usd must be greater than zero")]
    DailySpendCapInvalid,
    #[error("max_retries_per_stage must be zero or greater")]
    RetryCeilingInvalid,
    #[error("retry_backoff_base_seconds must be greater than zero")]
    BackoffBaseInvalid,
    #[error("seedance profile fallback order requires at least one profile")]
    ProfileOrderInvalid,
    #[error("missing stage handlers: {}", .0.join(", "))]
    StageHandlerMissing(Vec<String>),
    #[error("stage {stage} cost_usd cannot be negative")]
    StageCostInvalid { stage: String },
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl OrchestrationError {
    /// Stable machine-readable code for operator-facing output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowIdRequired => "WORKFLOW_ID_REQUIRED",
            Self::RunDateInvalid(_) => "WORKFLOW_RUN_DATE_INVALID",
            Self::PerVideoBudgetInvalid => "WORKFLOW_PER_VIDEO_BUDGET_INVALID",
            Self::DailySpendCapInvalid => "WORKFLOW_DAILY_SPEND_CAP_INVALID",
            Self::RetryCeilingInvalid => "WORKFLOW_RETRY_CEILING_INVALID",
            Self::BackoffBaseInvalid => "WORKFLOW_BACKOFF_BASE_INVALID",
            Self::ProfileOrderInvalid => "WORKFLOW_SEEDANCE_PROFILE_ORDER_INVALID",
            Self::StageHandlerMissing(_) => "WORKFLOW_STAGE_HANDLER_MISSING",
            Self::StageCostInvalid { .. } => "WORKFLOW_STAGE_COST_INVALID",
            Self::UnknownStage(_) => "WORKFLOW_STAGE_UNKNOWN",
            Self::Config(_) => "WORKFLOW_CONFIG_INVALID",
            Self::Ledger(_) => "WORKFLOW_LEDGER_ERROR",
        }
    }
}
