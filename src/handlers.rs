use crate::envelope::StageResult;
use crate::error::OrchestrationError;
use crate::normalizer::NormalizedResult;
use crate::schema::{Stage, WorkflowState};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Snapshot of the run handed to a stage handler on every attempt.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub workflow_id: String,
    pub run_date: String,
    pub state: WorkflowState,
    pub workflow_cost_usd: f64,
    pub daily_spend_usd: f64,
    pub stage_results: BTreeMap<Stage, StageResult>,
    /// Normalized output of every stage that has succeeded so far.
    pub stage_outputs: BTreeMap<Stage, NormalizedResult>,
    /// Caller-supplied context passed through untouched.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptMetadata {
    pub workflow_id: String,
    pub stage: Stage,
    pub attempt_number: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub run_date: String,
    pub seedance_profile: Option<String>,
}

/// Loosely-typed response from a stage handler. `status` is a free-text
/// token resolved by the normalizer; `cost_usd` is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    pub status: String,
    #[serde(default)]
    pub result_code: String,
    #[serde(default)]
    pub reason_code: String,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_result_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seedance_profile_used: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl StageResponse {
    pub fn new(status: impl Into<String>, cost_usd: f64) -> Self {
        Self {
            status: status.into(),
            result_code: String::new(),
            reason_code: String::new(),
            cost_usd,
            policy_result_code: None,
            policy_reason_code: None,
            review_status: None,
            seedance_profile_used: None,
            payload: Value::Null,
        }
    }

    pub fn success(cost_usd: f64) -> Self {
        Self::new("success", cost_usd).with_codes("PASS", "PASS")
    }

    pub fn retryable(code: impl Into<String>, cost_usd: f64) -> Self {
        let code = code.into();
        Self::new("retryable_failure", cost_usd).with_codes(code.clone(), code)
    }

    pub fn with_codes(mut self, result_code: impl Into<String>, reason_code: impl Into<String>) -> Self {
        self.result_code = result_code.into();
        self.reason_code = reason_code.into();
        self
    }

    pub fn with_policy(mut self, result_code: impl Into<String>, reason_code: impl Into<String>) -> Self {
        self.policy_result_code = Some(result_code.into());
        self.policy_reason_code = Some(reason_code.into());
        self
    }

    pub fn with_review_status(mut self, review_status: impl Into<String>) -> Self {
        self.review_status = Some(review_status.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    Retryable,
    NonRetryable,
}

/// A handler failure that produced no billable response.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub code: String,
    pub message: String,
}

impl StageError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Retryable,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn non_retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::NonRetryable,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, StageErrorKind::Retryable)
    }
}

/// One implementation per real stage, plus scripted doubles in tests.
pub trait StageHandler {
    fn handle(
        &mut self,
        context: &StageContext,
        attempt: &AttemptMetadata,
    ) -> Result<StageResponse, StageError>;
}

impl<F> StageHandler for F
where
    F: FnMut(&StageContext, &AttemptMetadata) -> Result<StageResponse, StageError>,
{
    fn handle(
        &mut self,
        context: &StageContext,
        attempt: &AttemptMetadata,
    ) -> Result<StageResponse, StageError> {
        self(context, attempt)
    }
}

/// Registry of handlers keyed by stage.
#[derive(Default)]
pub struct StageHandlers {
    handlers: HashMap<Stage, Box<dyn StageHandler>>,
}

impl StageHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: Stage, handler: impl StageHandler + 'static) -> &mut Self {
        self.handlers.insert(stage, Box::new(handler));
        self
    }

    pub fn with(mut self, stage: Stage, handler: impl StageHandler + 'static) -> Self {
        self.insert(stage, handler);
        self
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }

    pub fn get_mut(&mut self, stage: Stage) -> Option<&mut (dyn StageHandler + 'static)> {
        self.handlers.get_mut(&stage).map(|handler| handler.as_mut())
    }

    /// Fails listing every missing stage at once, in pipeline order.
    pub fn ensure_complete(&self) -> Result<(), OrchestrationError> {
        let missing: Vec<String> = Stage::ORDER
            .iter()
            .filter(|stage| !self.contains(**stage))
            .map(|stage| stage.as_str().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::StageHandlerMissing(missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AttemptMetadata, StageContext, StageError, StageHandlers, StageResponse};
    use crate::error::OrchestrationError;
    use crate::schema::Stage;

    fn ok_handler(_: &StageContext, _: &AttemptMetadata) -> Result<StageResponse, StageError> {
        Ok(StageResponse::success(0.1))
    }

    #[test]
    fn reports_all_missing_handlers_in_stage_order() {
        let handlers = StageHandlers::new()
            .with(Stage::Publish, ok_handler)
            .with(Stage::TrendIngestion, ok_handler)
            .with(Stage::SceneGeneration, ok_handler);

        match handlers.ensure_complete() {
            Err(OrchestrationError::StageHandlerMissing(missing)) => assert_eq!(
                missing,
                vec!["script_generation", "localization", "review"]
            ),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn complete_registry_passes() {
        let mut handlers = StageHandlers::new();
        for stage in Stage::ORDER {
            handlers.insert(stage, ok_handler);
        }
        assert!(handlers.ensure_complete().is_ok());
    }

    #[test]
    fn response_deserializes_with_optional_stage_fields_defaulted() {
        let response: StageResponse =
            serde_json::from_str(r#"{"status":"ok","cost_usd":0.4}"#).expect("parse");
        assert_eq!(response.status, "ok");
        assert_eq!(response.result_code, "");
        assert!(response.policy_result_code.is_none());
        assert!(response.payload.is_null());

        let missing_cost = serde_json::from_str::<StageResponse>(r#"{"status":"ok"}"#);
        assert!(missing_cost.is_err());
    }
}
