use crate::error::OrchestrationError;
use crate::handlers::{StageError, StageResponse};
use crate::schema::Stage;
use crate::util::round_usd;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PASS_CODE: &str = "PASS";
pub const BLOCKED_POLICY_GATE_CODE: &str = "BLOCKED_POLICY_GATE";
pub const HUMAN_APPROVAL_REQUIRED_CODE: &str = "HUMAN_APPROVAL_REQUIRED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Success,
    RetryableFailure,
    TerminalFailure,
    BlockedPolicy,
    BlockedReview,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::TerminalFailure => "terminal_failure",
            Self::BlockedPolicy => "blocked_policy",
            Self::BlockedReview => "blocked_review",
        }
    }
}

/// Resolves a handler status token (case-insensitive, trimmed).
///
/// Anything not listed, including an empty token, is a terminal failure:
/// an unknown signal must never advance the run.
pub fn canonical_status(token: &str) -> CanonicalStatus {
    let token = token.trim().to_ascii_lowercase();
    match token.as_str() {
        "success" | "ok" | "pass" | "generated" | "ready_for_review" | "approved"
        | "published" => CanonicalStatus::Success,
        "retryable_failure" | "retryable" | "retryable_error" => CanonicalStatus::RetryableFailure,
        t if t.starts_with("failed_retryable") => CanonicalStatus::RetryableFailure,
        "terminal_failure" | "failed_terminal" | "error" => CanonicalStatus::TerminalFailure,
        "blocked_policy" => CanonicalStatus::BlockedPolicy,
        "blocked_review" | "pending_review" | "human_approval_required" => {
            CanonicalStatus::BlockedReview
        }
        _ => CanonicalStatus::TerminalFailure,
    }
}

/// Canonical view of one attempt's outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResult {
    pub status: CanonicalStatus,
    pub result_code: String,
    pub reason_code: String,
    pub cost_usd: f64,
    pub seedance_profile: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Maps a handler outcome into a [`NormalizedResult`].
///
/// Stage overrides run after alias resolution and win over the outer status:
/// a localization response whose policy code is not `PASS` is a policy
/// block, a review response whose decision is not `approved` is a review
/// block. A negative (or non-finite) cost is a contract error.
pub fn normalize_stage_result(
    stage: Stage,
    outcome: Result<StageResponse, StageError>,
    seedance_profile: Option<&str>,
) -> Result<NormalizedResult, OrchestrationError> {
    let response = match outcome {
        Ok(response) => response,
        Err(error) => return Ok(from_stage_error(error, seedance_profile)),
    };

    let cost_usd = round_usd(response.cost_usd);
    if !cost_usd.is_finite() || cost_usd < 0.0 {
        return Err(OrchestrationError::StageCostInvalid {
            stage: stage.as_str().to_string(),
        });
    }

    let mut status = canonical_status(&response.status);
    let mut result_code = non_empty_or(&response.result_code, PASS_CODE);
    let mut reason_code = non_empty_or(&response.reason_code, &result_code);

    if stage == Stage::Localization {
        let policy_result = response
            .policy_result_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .unwrap_or(PASS_CODE);
        if policy_result != PASS_CODE {
            status = CanonicalStatus::BlockedPolicy;
            result_code = BLOCKED_POLICY_GATE_CODE.to_string();
            reason_code = non_empty_or(
                response.policy_reason_code.as_deref().unwrap_or_default(),
                policy_result,
            );
        }
    }

    if stage == Stage::Review {
        let review_status = response
            .review_status
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "approved".to_string());
        if review_status != "approved" {
            status = CanonicalStatus::BlockedReview;
            result_code = HUMAN_APPROVAL_REQUIRED_CODE.to_string();
            reason_code = non_empty_or(&response.reason_code, HUMAN_APPROVAL_REQUIRED_CODE);
        }
    }

    Ok(NormalizedResult {
        status,
        result_code,
        reason_code,
        cost_usd,
        seedance_profile: seedance_profile.map(str::to_string),
        payload: response.payload,
    })
}

fn from_stage_error(error: StageError, seedance_profile: Option<&str>) -> NormalizedResult {
    let status = if error.is_retryable() {
        CanonicalStatus::RetryableFailure
    } else {
        CanonicalStatus::TerminalFailure
    };
    let code = non_empty_or(&error.code, "STAGE_HANDLER_ERROR");
    NormalizedResult {
        status,
        result_code: code.clone(),
        reason_code: code,
        cost_usd: 0.0,
        seedance_profile: seedance_profile.map(str::to_string),
        payload: Value::Null,
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
