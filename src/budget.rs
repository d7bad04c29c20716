use crate::error::OrchestrationError;
use crate::schema::Stage;
use crate::util::round_usd;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCap {
    PerVideo,
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltReason {
    /// Pre-stage: the daily ledger already sits at or above the cap.
    DailySpendCapReached,
    /// Post-attempt: the run's own cost overshot the per-video cap.
    PerVideoBudgetExceeded,
    /// Post-attempt: the attempt pushed the daily ledger past the cap.
    DailySpendCapExceeded,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailySpendCapReached => "DAILY_SPEND_CAP_REACHED",
            Self::PerVideoBudgetExceeded => "PER_VIDEO_BUDGET_EXCEEDED",
            Self::DailySpendCapExceeded => "DAILY_SPEND_CAP_EXCEEDED",
        }
    }

    pub fn cap(&self) -> BudgetCap {
        match self {
            Self::PerVideoBudgetExceeded => BudgetCap::PerVideo,
            Self::DailySpendCapReached | Self::DailySpendCapExceeded => BudgetCap::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetHaltEvent {
    pub stage: Stage,
    /// Absent when the halt fired before any attempt on the stage.
    pub attempt_number: Option<u32>,
    pub reason_code: HaltReason,
    pub cap: BudgetCap,
    pub workflow_cost_usd: f64,
    pub per_video_budget_cap_usd: f64,
    pub daily_spend_usd: f64,
    pub daily_spend_cap_usd: f64,
}

pub enum CapDecision {
    Allow,
    Halt(BudgetHaltEvent),
}

/// Circuit breaker over the per-video and daily spend caps.
///
/// The pre-stage check uses `>=` against the daily cap only; the
/// post-attempt checks use `>` against both caps. Keep the two comparisons
/// as separate predicates; merging them shifts when runs halt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetGuard {
    per_video_budget_cap_usd: f64,
    daily_spend_cap_usd: f64,
}

impl BudgetGuard {
    pub fn new(
        per_video_budget_cap_usd: f64,
        daily_spend_cap_usd: f64,
    ) -> Result<Self, OrchestrationError> {
        let per_video = round_usd(per_video_budget_cap_usd);
        if !(per_video > 0.0) {
            return Err(OrchestrationError::PerVideoBudgetInvalid);
        }
        let daily = round_usd(daily_spend_cap_usd);
        if !(daily > 0.0) {
            return Err(OrchestrationError::DailySpendCapInvalid);
        }
        Ok(Self {
            per_video_budget_cap_usd: per_video,
            daily_spend_cap_usd: daily,
        })
    }

    pub fn per_video_budget_cap_usd(&self) -> f64 {
        self.per_video_budget_cap_usd
    }

    pub fn daily_spend_cap_usd(&self) -> f64 {
        self.daily_spend_cap_usd
    }

    pub fn daily_cap_reached(&self, daily_spend_usd: f64) -> bool {
        daily_spend_usd >= self.daily_spend_cap_usd
    }

    pub fn per_video_cap_exceeded(&self, workflow_cost_usd: f64) -> bool {
        workflow_cost_usd > self.per_video_budget_cap_usd
    }

    pub fn daily_cap_exceeded(&self, daily_spend_usd: f64) -> bool {
        daily_spend_usd > self.daily_spend_cap_usd
    }

    /// Evaluated before the first attempt of every stage.
    pub fn pre_stage_check(
        &self,
        stage: Stage,
        workflow_cost_usd: f64,
        daily_spend_usd: f64,
    ) -> CapDecision {
        if self.daily_cap_reached(daily_spend_usd) {
            return CapDecision::Halt(self.halt_event(
                stage,
                None,
                HaltReason::DailySpendCapReached,
                workflow_cost_usd,
                daily_spend_usd,
            ));
        }
        CapDecision::Allow
    }

    /// Evaluated after every attempt, using totals that already include it.
    pub fn post_attempt_check(
        &self,
        stage: Stage,
        attempt_number: u32,
        workflow_cost_usd: f64,
        daily_spend_usd: f64,
    ) -> CapDecision {
        let reason = if self.per_video_cap_exceeded(workflow_cost_usd) {
            HaltReason::PerVideoBudgetExceeded
        } else if self.daily_cap_exceeded(daily_spend_usd) {
            HaltReason::DailySpendCapExceeded
        } else {
            return CapDecision::Allow;
        };
        CapDecision::Halt(self.halt_event(
            stage,
            Some(attempt_number),
            reason,
            workflow_cost_usd,
            daily_spend_usd,
        ))
    }

    fn halt_event(
        &self,
        stage: Stage,
        attempt_number: Option<u32>,
        reason: HaltReason,
        workflow_cost_usd: f64,
        daily_spend_usd: f64,
    ) -> BudgetHaltEvent {
        BudgetHaltEvent {
            stage,
            attempt_number,
            reason_code: reason,
            cap: reason.cap(),
            workflow_cost_usd: round_usd(workflow_cost_usd),
            per_video_budget_cap_usd: self.per_video_budget_cap_usd,
            daily_spend_usd: round_usd(daily_spend_usd),
            daily_spend_cap_usd: self.daily_spend_cap_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BudgetCap, BudgetGuard, CapDecision, HaltReason};
    use crate::schema::Stage;

    fn halt(decision: CapDecision) -> super::BudgetHaltEvent {
        match decision {
            CapDecision::Halt(event) => event,
            CapDecision::Allow => panic!("expected halt"),
        }
    }

    #[test]
    fn pre_check_halts_at_exactly_the_daily_cap() {
        let guard = BudgetGuard::new(20.0, 5.0).expect("valid caps");
        assert!(matches!(
            guard.pre_stage_check(Stage::TrendIngestion, 0.0, 4.9999),
            CapDecision::Allow
        ));
        let event = halt(guard.pre_stage_check(Stage::ScriptGeneration, 0.3, 5.0));
        assert_eq!(event.reason_code, HaltReason::DailySpendCapReached);
        assert_eq!(event.cap, BudgetCap::Daily);
        assert_eq!(event.attempt_number, None);
        assert_eq!(event.stage, Stage::ScriptGeneration);
    }

    #[test]
    fn post_check_allows_landing_exactly_on_a_cap() {
        let guard = BudgetGuard::new(2.0, 5.0).expect("valid caps");
        assert!(matches!(
            guard.post_attempt_check(Stage::SceneGeneration, 1, 2.0, 5.0),
            CapDecision::Allow
        ));
    }

    #[test]
    fn post_check_prefers_per_video_over_daily() {
        let guard = BudgetGuard::new(2.0, 5.0).expect("valid caps");
        let event = halt(guard.post_attempt_check(Stage::SceneGeneration, 2, 2.45, 5.5));
        assert_eq!(event.reason_code, HaltReason::PerVideoBudgetExceeded);
        assert_eq!(event.cap, BudgetCap::PerVideo);
        assert_eq!(event.attempt_number, Some(2));
        assert_eq!(event.workflow_cost_usd, 2.45);

        let event = halt(guard.post_attempt_check(Stage::TrendIngestion, 1, 0.3, 5.1));
        assert_eq!(event.reason_code, HaltReason::DailySpendCapExceeded);
        assert_eq!(event.daily_spend_usd, 5.1);
        assert_eq!(event.daily_spend_cap_usd, 5.0);
    }

    #[test]
    fn rejects_non_positive_caps() {
        assert_eq!(
            BudgetGuard::new(0.0, 5.0).expect_err("zero per video").code(),
            "WORKFLOW_PER_VIDEO_BUDGET_INVALID"
        );
        assert_eq!(
            BudgetGuard::new(1.0, -1.0).expect_err("negative daily").code(),
            "WORKFLOW_DAILY_SPEND_CAP_INVALID"
        );
        assert!(BudgetGuard::new(f64::NAN, 5.0).is_err());
        assert!(BudgetGuard::new(0.00001, 5.0).is_err());
    }

    #[test]
    fn halt_reason_serializes_as_reason_code() {
        assert_eq!(
            serde_json::to_string(&HaltReason::PerVideoBudgetExceeded).expect("serialize"),
            "\"PER_VIDEO_BUDGET_EXCEEDED\""
        );
        assert_eq!(HaltReason::DailySpendCapReached.as_str(), "DAILY_SPEND_CAP_REACHED");
    }
}
