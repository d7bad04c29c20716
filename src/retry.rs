use crate::error::OrchestrationError;
use serde::Serialize;

pub const DEFAULT_RETRY_CEILING: i64 = 3;
pub const DEFAULT_RETRY_BACKOFF_BASE_SECONDS: i64 = 2;
pub const DEFAULT_SEEDANCE_PROFILE_FALLBACK_ORDER: [&str; 3] = [
    "seedance-quality-v1",
    "seedance-balanced-v1",
    "seedance-speed-v1",
];

/// Per-stage retry ceiling, reported backoff, and the scene-synthesis
/// profile fallback walk.
///
/// The policy never sleeps. Backoff is computed so the caller can honor it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base_seconds: u64,
    profile_fallback_order: Vec<String>,
}

impl RetryPolicy {
    /// Validates raw settings. Profile entries are trimmed and blanks dropped
    /// before the emptiness check.
    pub fn new(
        max_retries: i64,
        backoff_base_seconds: i64,
        profile_fallback_order: &[String],
    ) -> Result<Self, OrchestrationError> {
        let max_retries =
            u32::try_from(max_retries).map_err(|_| OrchestrationError::RetryCeilingInvalid)?;
        if backoff_base_seconds <= 0 {
            return Err(OrchestrationError::BackoffBaseInvalid);
        }

        let profile_fallback_order: Vec<String> = profile_fallback_order
            .iter()
            .map(|profile| profile.trim().to_string())
            .filter(|profile| !profile.is_empty())
            .collect();
        if profile_fallback_order.is_empty() {
            return Err(OrchestrationError::ProfileOrderInvalid);
        }

        Ok(Self {
            max_retries,
            backoff_base_seconds: backoff_base_seconds as u64,
            profile_fallback_order,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_base_seconds(&self) -> u64 {
        self.backoff_base_seconds
    }

    pub fn profile_fallback_order(&self) -> &[String] {
        &self.profile_fallback_order
    }

    /// True once `retry_count` retries have already been spent on a stage.
    pub fn ceiling_reached(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Backoff reported before the k-th retry (k is 1-based).
    /// Formula: BASE * 2^(k-1)
    /// Example with base 2: retry 1 = 2s, 2 = 4s, 3 = 8s
    pub fn backoff_seconds(&self, retry_index: u32) -> u64 {
        self.backoff_base_seconds
            .saturating_mul(2u64.saturating_pow(retry_index.saturating_sub(1)))
    }

    /// Profile for the attempt with 0-based `retry_count`, clamped to the last entry.
    pub fn profile_for_retry(&self, retry_count: u32) -> &str {
        let last = self.profile_fallback_order.len() - 1;
        let index = (retry_count as usize).min(last);
        &self.profile_fallback_order[index]
    }
}
