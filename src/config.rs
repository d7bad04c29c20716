use crate::budget::BudgetGuard;
use crate::error::OrchestrationError;
use crate::retry::{
    RetryPolicy, DEFAULT_RETRY_BACKOFF_BASE_SECONDS, DEFAULT_RETRY_CEILING,
    DEFAULT_SEEDANCE_PROFILE_FALLBACK_ORDER,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PER_VIDEO_BUDGET_CAP_USD: f64 = 20.0;
pub const DEFAULT_DAILY_SPEND_CAP_USD: f64 = 100.0;

/// Engine settings, loadable from TOML. Validation happens in
/// [`EngineConfig::validate`], not at parse time, so bad values surface
/// with the same error codes whichever way the config was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub per_video_budget_cap_usd: f64,
    pub daily_spend_cap_usd: f64,
    pub max_retries_per_stage: i64,
    pub retry_backoff_base_seconds: i64,
    pub seedance_profile_fallback_order: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_video_budget_cap_usd: DEFAULT_PER_VIDEO_BUDGET_CAP_USD,
            daily_spend_cap_usd: DEFAULT_DAILY_SPEND_CAP_USD,
            max_retries_per_stage: DEFAULT_RETRY_CEILING,
            retry_backoff_base_seconds: DEFAULT_RETRY_BACKOFF_BASE_SECONDS,
            seedance_profile_fallback_order: DEFAULT_SEEDANCE_PROFILE_FALLBACK_ORDER
                .iter()
                .map(|profile| profile.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, OrchestrationError> {
        toml::from_str(raw).map_err(|e| OrchestrationError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, OrchestrationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks caps first, then retry settings, matching the order errors
    /// are reported in.
    pub fn validate(&self) -> Result<(BudgetGuard, RetryPolicy), OrchestrationError> {
        let guard = BudgetGuard::new(self.per_video_budget_cap_usd, self.daily_spend_cap_usd)?;
        let retry = RetryPolicy::new(
            self.max_retries_per_stage,
            self.retry_backoff_base_seconds,
            &self.seedance_profile_fallback_order,
        )?;
        Ok((guard, retry))
    }
}
