use crate::budget::{BudgetGuard, BudgetHaltEvent, CapDecision};
use crate::config::EngineConfig;
use crate::envelope::{
    AttemptEvent, CostTracking, EnvelopeStatus, ProfileEvent, RetryEvent, StageOutcome,
    StageResult, WorkflowEnvelope,
};
use crate::error::OrchestrationError;
use crate::handlers::{AttemptMetadata, StageContext, StageHandler, StageHandlers};
use crate::ledger::{InMemorySpendLedger, SpendEntry, SpendLedger};
use crate::normalizer::{normalize_stage_result, CanonicalStatus, NormalizedResult, PASS_CODE};
use crate::retry::RetryPolicy;
use crate::schema::{Stage, WorkflowState};
use crate::util::{parse_run_date, round_usd, ISO_DATE};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const HALTED_COST_CAP_CODE: &str = "HALTED_COST_CAP";
pub const FAILED_RETRY_EXHAUSTED_CODE: &str = "FAILED_RETRY_EXHAUSTED";
pub const RETRY_CEILING_REACHED_CODE: &str = "RETRY_CEILING_REACHED";

/// State of one in-flight run. Created and consumed inside a single
/// `run_workflow` call; only the ledger outlives it.
struct WorkflowRun {
    workflow_id: String,
    run_date: NaiveDate,
    run_date_label: String,
    state: WorkflowState,
    workflow_cost_usd: f64,
    daily_spend_before_usd: f64,
    state_trace: Vec<WorkflowState>,
    stage_results: BTreeMap<Stage, StageResult>,
    stage_outputs: BTreeMap<Stage, NormalizedResult>,
    attempt_trace: Vec<AttemptEvent>,
    retry_trace: Vec<RetryEvent>,
    profile_trace: Vec<ProfileEvent>,
    extra: Map<String, Value>,
}

impl WorkflowRun {
    fn context(&self, daily_spend_usd: f64) -> StageContext {
        StageContext {
            workflow_id: self.workflow_id.clone(),
            run_date: self.run_date_label.clone(),
            state: self.state,
            workflow_cost_usd: self.workflow_cost_usd,
            daily_spend_usd,
            stage_results: self.stage_results.clone(),
            stage_outputs: self.stage_outputs.clone(),
            extra: self.extra.clone(),
        }
    }

    fn add_cost(&mut self, cost_usd: f64) {
        self.workflow_cost_usd = round_usd(self.workflow_cost_usd + cost_usd);
    }

    fn advance(&mut self, stage: Stage, result: StageResult, output: NormalizedResult) {
        self.stage_results.insert(stage, result);
        self.stage_outputs.insert(stage, output);
        self.state = stage.success_state();
        self.state_trace.push(self.state);
    }
}

/// Why a run stopped short of `published`.
struct Termination {
    state: WorkflowState,
    status: EnvelopeStatus,
    result_code: String,
    reason_code: String,
    budget_halt_event: Option<BudgetHaltEvent>,
}

impl Termination {
    fn budget(event: BudgetHaltEvent) -> Self {
        Self {
            state: WorkflowState::HaltedCostCap,
            status: EnvelopeStatus::Halted,
            result_code: HALTED_COST_CAP_CODE.to_string(),
            reason_code: event.reason_code.as_str().to_string(),
            budget_halt_event: Some(event),
        }
    }

    fn from_stage(result: &StageResult) -> Self {
        let (state, status) = match result.status {
            StageOutcome::BlockedPolicy => (WorkflowState::BlockedPolicy, EnvelopeStatus::Blocked),
            StageOutcome::BlockedReview => {
                (WorkflowState::BlockedReviewGate, EnvelopeStatus::Blocked)
            }
            StageOutcome::FailedRetryExhausted => {
                (WorkflowState::FailedRetryExhausted, EnvelopeStatus::Failed)
            }
            StageOutcome::HaltedCostCap => (WorkflowState::HaltedCostCap, EnvelopeStatus::Halted),
            StageOutcome::FailedTerminal | StageOutcome::Success => {
                (WorkflowState::FailedTerminal, EnvelopeStatus::Failed)
            }
        };
        Self {
            state,
            status,
            result_code: result.result_code.clone(),
            reason_code: result.reason_code.clone(),
            budget_halt_event: None,
        }
    }
}

enum StageFlow {
    Advanced,
    Terminated(Termination),
}

/// Drives the six-stage pipeline for one work item per call.
///
/// Each stage runs in strict order:
/// 1. Daily-cap pre-check (`>=`); a trip halts before the handler is invoked
/// 2. Attempt loop: invoke handler, normalize, bill the run and the ledger
/// 3. Post-attempt check of both caps (`>`); a trip halts regardless of status
/// 4. Branch on canonical status: advance, stop, or retry with reported backoff
///
/// The engine is synchronous and never sleeps; backoff is only recorded.
pub struct WorkflowEngine<L: SpendLedger = InMemorySpendLedger> {
    budget: BudgetGuard,
    retry: RetryPolicy,
    ledger: L,
}

impl WorkflowEngine<InMemorySpendLedger> {
    pub fn new(config: &EngineConfig) -> Result<Self, OrchestrationError> {
        Self::with_ledger(config, InMemorySpendLedger::new())
    }
}

impl<L: SpendLedger> WorkflowEngine<L> {
    pub fn with_ledger(config: &EngineConfig, ledger: L) -> Result<Self, OrchestrationError> {
        let (budget, retry) = config.validate()?;
        Ok(Self {
            budget,
            retry,
            ledger,
        })
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    pub fn set_daily_spend(&mut self, run_date: &str, spend_usd: f64) -> Result<(), OrchestrationError> {
        let date = validated_run_date(run_date)?;
        self.ledger.set_daily_spend(date, spend_usd)?;
        Ok(())
    }

    pub fn daily_spend(&self, run_date: &str) -> Result<f64, OrchestrationError> {
        let date = validated_run_date(run_date)?;
        Ok(self.ledger.daily_spend(date)?)
    }

    /// Runs one workflow to `published` or to the first terminal condition.
    ///
    /// Configuration problems (blank id, malformed date, missing handlers)
    /// are returned before any stage executes. A negative handler cost is
    /// returned as an error as soon as it is seen.
    pub fn run_workflow(
        &mut self,
        workflow_id: &str,
        run_date: &str,
        handlers: &mut StageHandlers,
        context: Option<Map<String, Value>>,
    ) -> Result<WorkflowEnvelope, OrchestrationError> {
        let workflow_id = workflow_id.trim();
        if workflow_id.is_empty() {
            return Err(OrchestrationError::WorkflowIdRequired);
        }
        let date = validated_run_date(run_date)?;
        handlers.ensure_complete()?;

        let mut run = WorkflowRun {
            workflow_id: workflow_id.to_string(),
            run_date: date,
            run_date_label: date.format(ISO_DATE).to_string(),
            state: WorkflowState::Created,
            workflow_cost_usd: 0.0,
            daily_spend_before_usd: self.ledger.daily_spend(date)?,
            state_trace: vec![WorkflowState::Created],
            stage_results: BTreeMap::new(),
            stage_outputs: BTreeMap::new(),
            attempt_trace: Vec::new(),
            retry_trace: Vec::new(),
            profile_trace: Vec::new(),
            extra: context.unwrap_or_default(),
        };
        info!(
            workflow_id = %run.workflow_id,
            run_date = %run.run_date_label,
            daily_spend_usd = run.daily_spend_before_usd,
            "workflow run started"
        );

        for stage in Stage::ORDER {
            let daily_spend = self.ledger.daily_spend(date)?;
            if let CapDecision::Halt(event) =
                self.budget
                    .pre_stage_check(stage, run.workflow_cost_usd, daily_spend)
            {
                warn!(
                    workflow_id = %run.workflow_id,
                    stage = %stage,
                    daily_spend_usd = daily_spend,
                    "daily spend cap reached before stage start"
                );
                return self.finish(run, Some(Termination::budget(event)));
            }

            let handler = handlers
                .get_mut(stage)
                .ok_or_else(|| OrchestrationError::StageHandlerMissing(vec![stage.to_string()]))?;
            match self.run_stage(&mut run, stage, handler)? {
                StageFlow::Advanced => {}
                StageFlow::Terminated(termination) => return self.finish(run, Some(termination)),
            }
        }

        self.finish(run, None)
    }

    fn run_stage(
        &mut self,
        run: &mut WorkflowRun,
        stage: Stage,
        handler: &mut dyn StageHandler,
    ) -> Result<StageFlow, OrchestrationError> {
        let mut retry_count: u32 = 0;
        let mut stage_cost_usd = 0.0;

        loop {
            let attempt_number = retry_count + 1;
            let profile = stage
                .carries_profile()
                .then(|| self.retry.profile_for_retry(retry_count).to_string());
            if let Some(profile) = &profile {
                run.profile_trace.push(ProfileEvent {
                    stage,
                    attempt_number,
                    seedance_profile: profile.clone(),
                });
            }

            let attempt = AttemptMetadata {
                workflow_id: run.workflow_id.clone(),
                stage,
                attempt_number,
                retry_count,
                max_retries: self.retry.max_retries(),
                run_date: run.run_date_label.clone(),
                seedance_profile: profile.clone(),
            };
            let context = run.context(self.ledger.daily_spend(run.run_date)?);
            let outcome = handler.handle(&context, &attempt);
            let result = normalize_stage_result(stage, outcome, profile.as_deref())?;

            stage_cost_usd = round_usd(stage_cost_usd + result.cost_usd);
            run.add_cost(result.cost_usd);
            let daily_spend_usd = self.ledger.record_spend(
                run.run_date,
                &SpendEntry {
                    workflow_id: &run.workflow_id,
                    stage,
                    attempt_number,
                    amount_usd: result.cost_usd,
                },
            )?;

            debug!(
                workflow_id = %run.workflow_id,
                stage = %stage,
                attempt_number,
                status = result.status.as_str(),
                cost_usd = result.cost_usd,
                workflow_cost_usd = run.workflow_cost_usd,
                daily_spend_usd,
                "stage attempt finished"
            );
            run.attempt_trace.push(AttemptEvent {
                stage,
                attempt_number,
                status: result.status,
                result_code: result.result_code.clone(),
                reason_code: result.reason_code.clone(),
                cost_usd: result.cost_usd,
                workflow_cost_usd: run.workflow_cost_usd,
                daily_spend_usd,
                seedance_profile: profile.clone(),
            });

            if let CapDecision::Halt(event) = self.budget.post_attempt_check(
                stage,
                attempt_number,
                run.workflow_cost_usd,
                daily_spend_usd,
            ) {
                warn!(
                    workflow_id = %run.workflow_id,
                    stage = %stage,
                    attempt_number,
                    reason = event.reason_code.as_str(),
                    workflow_cost_usd = run.workflow_cost_usd,
                    daily_spend_usd,
                    "budget circuit breaker tripped"
                );
                run.stage_results.insert(
                    stage,
                    StageResult {
                        status: StageOutcome::HaltedCostCap,
                        result_code: HALTED_COST_CAP_CODE.to_string(),
                        reason_code: event.reason_code.as_str().to_string(),
                        attempt_count: attempt_number,
                        stage_cost_usd,
                        seedance_profile: None,
                    },
                );
                return Ok(StageFlow::Terminated(Termination::budget(event)));
            }

            let stopped = |outcome: StageOutcome, result: &NormalizedResult| StageResult {
                status: outcome,
                result_code: result.result_code.clone(),
                reason_code: result.reason_code.clone(),
                attempt_count: attempt_number,
                stage_cost_usd,
                seedance_profile: None,
            };

            let stage_result = match result.status {
                CanonicalStatus::Success => {
                    let stage_result = StageResult {
                        seedance_profile: profile,
                        ..stopped(StageOutcome::Success, &result)
                    };
                    run.advance(stage, stage_result, result);
                    info!(
                        workflow_id = %run.workflow_id,
                        stage = %stage,
                        state = %run.state,
                        attempt_number,
                        "stage succeeded"
                    );
                    return Ok(StageFlow::Advanced);
                }
                CanonicalStatus::BlockedPolicy => stopped(StageOutcome::BlockedPolicy, &result),
                CanonicalStatus::BlockedReview => stopped(StageOutcome::BlockedReview, &result),
                CanonicalStatus::TerminalFailure => stopped(StageOutcome::FailedTerminal, &result),
                CanonicalStatus::RetryableFailure if self.retry.ceiling_reached(retry_count) => {
                    StageResult {
                        status: StageOutcome::FailedRetryExhausted,
                        result_code: FAILED_RETRY_EXHAUSTED_CODE.to_string(),
                        reason_code: RETRY_CEILING_REACHED_CODE.to_string(),
                        attempt_count: attempt_number,
                        stage_cost_usd,
                        seedance_profile: None,
                    }
                }
                CanonicalStatus::RetryableFailure => {
                    retry_count += 1;
                    let backoff_seconds = self.retry.backoff_seconds(retry_count);
                    warn!(
                        workflow_id = %run.workflow_id,
                        stage = %stage,
                        retry_index = retry_count,
                        backoff_seconds,
                        reason = %result.reason_code,
                        "retryable stage failure, retry scheduled"
                    );
                    run.retry_trace.push(RetryEvent {
                        stage,
                        retry_index: retry_count,
                        reason_code: result.reason_code,
                        result_code: result.result_code,
                        backoff_seconds,
                        seedance_profile: profile,
                    });
                    continue;
                }
            };

            warn!(
                workflow_id = %run.workflow_id,
                stage = %stage,
                outcome = ?stage_result.status,
                reason = %stage_result.reason_code,
                "workflow stopped at stage"
            );
            let termination = Termination::from_stage(&stage_result);
            run.stage_results.insert(stage, stage_result);
            return Ok(StageFlow::Terminated(termination));
        }
    }

    fn finish(
        &self,
        run: WorkflowRun,
        termination: Option<Termination>,
    ) -> Result<WorkflowEnvelope, OrchestrationError> {
        let daily_spend_after_usd = self.ledger.daily_spend(run.run_date)?;
        let mut state_trace = run.state_trace;

        let (status, state, result_code, reason_code, blocked_from_state, budget_halt_event) =
            match termination {
                Some(termination) => {
                    if state_trace.last() != Some(&termination.state) {
                        state_trace.push(termination.state);
                    }
                    (
                        termination.status,
                        termination.state,
                        termination.result_code,
                        termination.reason_code,
                        Some(run.state),
                        termination.budget_halt_event,
                    )
                }
                None => (
                    EnvelopeStatus::Completed,
                    run.state,
                    PASS_CODE.to_string(),
                    PASS_CODE.to_string(),
                    None,
                    None,
                ),
            };

        info!(
            workflow_id = %run.workflow_id,
            state = %state,
            reason = %reason_code,
            workflow_cost_usd = run.workflow_cost_usd,
            daily_spend_usd = daily_spend_after_usd,
            "workflow run finished"
        );

        Ok(WorkflowEnvelope {
            workflow_id: run.workflow_id,
            status,
            state,
            result_code,
            reason_code,
            blocked_from_state,
            stage_order: Stage::ORDER.to_vec(),
            state_trace,
            stage_results: run.stage_results,
            attempt_trace: run.attempt_trace,
            retry_trace: run.retry_trace,
            seedance_profile_trace: run.profile_trace,
            cost_tracking: CostTracking {
                run_date: run.run_date_label,
                per_video_budget_cap_usd: self.budget.per_video_budget_cap_usd(),
                daily_spend_cap_usd: self.budget.daily_spend_cap_usd(),
                workflow_cost_usd: run.workflow_cost_usd,
                daily_spend_before_usd: run.daily_spend_before_usd,
                daily_spend_after_usd,
                budget_halt_event,
            },
        })
    }
}

fn validated_run_date(raw: &str) -> Result<NaiveDate, OrchestrationError> {
    parse_run_date(raw).ok_or_else(|| OrchestrationError::RunDateInvalid(raw.to_string()))
}
