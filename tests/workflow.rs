use pretty_assertions::assert_eq;
use reelgate::{
    BudgetCap, EngineConfig, EnvelopeStatus, HaltReason, ScriptedStageHandlers, SqliteSpendLedger,
    Stage, StageError, StageOutcome, StageResponse, WorkflowEngine, WorkflowState,
};

const RUN_DATE: &str = "2026-02-16";

fn engine_with(config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::new(&config).expect("valid config")
}

fn capped(per_video: f64, daily: f64) -> EngineConfig {
    EngineConfig {
        per_video_budget_cap_usd: per_video,
        daily_spend_cap_usd: daily,
        ..EngineConfig::default()
    }
}

#[test]
fn success_aliases_publish_with_full_state_trace() {
    let scripted = ScriptedStageHandlers::new()
        .script(Stage::TrendIngestion, [StageResponse::new("ok", 0.25)])
        .script(Stage::ScriptGeneration, [StageResponse::new("Generated", 0.8)])
        .script(Stage::SceneGeneration, [StageResponse::new("ready_for_review", 1.6)])
        .script(Stage::Review, [StageResponse::new("approved", 0.0)])
        .script(Stage::Publish, [StageResponse::new("PUBLISHED", 0.2)]);
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-happy-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::Published);
    assert_eq!(envelope.status, EnvelopeStatus::Completed);
    assert_eq!(
        envelope.state_trace,
        vec![
            WorkflowState::Created,
            WorkflowState::TrendIngested,
            WorkflowState::ScriptGenerated,
            WorkflowState::ScenesGenerated,
            WorkflowState::Localized,
            WorkflowState::Approved,
            WorkflowState::Published,
        ]
    );
    assert_eq!(envelope.stage_order, Stage::ORDER.to_vec());
    assert_eq!(envelope.attempt_trace.len(), 6);
    assert!(envelope.retry_trace.is_empty());
    assert_eq!(envelope.profiles_for(Stage::SceneGeneration), vec!["seedance-quality-v1"]);
    assert_eq!(
        envelope.stage_results[&Stage::SceneGeneration]
            .seedance_profile
            .as_deref(),
        Some("seedance-quality-v1")
    );
    for stage in Stage::ORDER {
        assert_eq!(scripted.call_count(stage), 1);
    }
}

#[test]
fn retry_exhaustion_reports_doubling_backoff_and_clamped_profiles() {
    let scripted = ScriptedStageHandlers::new().script(
        Stage::SceneGeneration,
        (0..4).map(|_| StageResponse::retryable("RENDER_TIMEOUT", 0.0)),
    );
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-retry-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::FailedRetryExhausted);
    assert_eq!(envelope.status, EnvelopeStatus::Failed);
    assert_eq!(envelope.result_code, "FAILED_RETRY_EXHAUSTED");
    assert_eq!(envelope.reason_code, "RETRY_CEILING_REACHED");
    assert_eq!(envelope.blocked_from_state, Some(WorkflowState::ScriptGenerated));
    assert_eq!(envelope.backoff_schedule(), vec![2, 4, 8]);
    assert_eq!(
        envelope.profiles_for(Stage::SceneGeneration),
        vec![
            "seedance-quality-v1",
            "seedance-balanced-v1",
            "seedance-speed-v1",
            "seedance-speed-v1",
        ]
    );
    let scene = &envelope.stage_results[&Stage::SceneGeneration];
    assert_eq!(scene.status, StageOutcome::FailedRetryExhausted);
    assert_eq!(scene.attempt_count, 4);
    assert_eq!(scripted.call_count(Stage::SceneGeneration), 4);
    assert_eq!(scripted.call_count(Stage::Localization), 0);
}

#[test]
fn profile_walk_stops_at_first_success() {
    let scripted = ScriptedStageHandlers::new().script(
        Stage::SceneGeneration,
        [
            StageResponse::retryable("RENDER_TIMEOUT", 0.3),
            StageResponse::new("failed_retryable_upstream", 0.3),
        ],
    );
    let mut handlers = scripted.build_handlers();
    let config = EngineConfig {
        retry_backoff_base_seconds: 5,
        ..EngineConfig::default()
    };
    let envelope = engine_with(config)
        .run_workflow("workflow-profile-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert!(envelope.is_published());
    assert_eq!(envelope.backoff_schedule(), vec![5, 10]);
    assert_eq!(
        envelope.profiles_for(Stage::SceneGeneration),
        vec!["seedance-quality-v1", "seedance-balanced-v1", "seedance-speed-v1"]
    );
    let scene = &envelope.stage_results[&Stage::SceneGeneration];
    assert_eq!(scene.attempt_count, 3);
    assert_eq!(scene.stage_cost_usd, 2.2);
    assert_eq!(scene.seedance_profile.as_deref(), Some("seedance-speed-v1"));
    assert!(envelope.profiles_for(Stage::Localization).is_empty());
}

#[test]
fn per_video_cap_halts_at_overshooting_stage() {
    let scripted = ScriptedStageHandlers::new()
        .script(Stage::TrendIngestion, [StageResponse::success(0.45)])
        .script(Stage::ScriptGeneration, [StageResponse::success(0.8)])
        .script(Stage::SceneGeneration, [StageResponse::success(1.2)]);
    let mut handlers = scripted.build_handlers();
    let mut engine = engine_with(capped(2.0, 100.0));
    let envelope = engine
        .run_workflow("workflow-budget-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::HaltedCostCap);
    assert_eq!(envelope.status, EnvelopeStatus::Halted);
    assert_eq!(envelope.result_code, "HALTED_COST_CAP");
    assert_eq!(envelope.reason_code, "PER_VIDEO_BUDGET_EXCEEDED");
    assert_eq!(envelope.blocked_from_state, Some(WorkflowState::ScriptGenerated));

    let halt = envelope.budget_halt_event().expect("halt event");
    assert_eq!(halt.stage, Stage::SceneGeneration);
    assert_eq!(halt.attempt_number, Some(1));
    assert_eq!(halt.reason_code, HaltReason::PerVideoBudgetExceeded);
    assert_eq!(halt.cap, BudgetCap::PerVideo);
    assert_eq!(halt.workflow_cost_usd, 2.45);
    assert_eq!(envelope.cost_tracking.workflow_cost_usd, 2.45);
    assert_eq!(envelope.cost_tracking.daily_spend_after_usd, 2.45);
    assert_eq!(
        envelope.stage_results[&Stage::SceneGeneration].status,
        StageOutcome::HaltedCostCap
    );

    for stage in [Stage::Localization, Stage::Review, Stage::Publish] {
        assert_eq!(scripted.call_count(stage), 0, "{stage} must not run");
    }
    assert_eq!(engine.daily_spend(RUN_DATE).expect("spend"), 2.45);
}

#[test]
fn budget_halt_preempts_the_retry_loop() {
    let scripted = ScriptedStageHandlers::new()
        .script(Stage::TrendIngestion, [StageResponse::retryable("SOURCE_TIMEOUT", 1.5)]);
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(capped(1.0, 100.0))
        .run_workflow("workflow-budget-002", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.reason_code, "PER_VIDEO_BUDGET_EXCEEDED");
    assert!(envelope.retry_trace.is_empty());
    assert_eq!(scripted.call_count(Stage::TrendIngestion), 1);
}

#[test]
fn daily_cap_overshoot_stops_before_next_stage() {
    let scripted = ScriptedStageHandlers::new()
        .script(Stage::TrendIngestion, [StageResponse::success(0.3)]);
    let mut handlers = scripted.build_handlers();
    let mut engine = engine_with(capped(20.0, 5.0));
    engine.set_daily_spend(RUN_DATE, 4.8).expect("seed");

    let envelope = engine
        .run_workflow("workflow-daily-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::HaltedCostCap);
    assert_eq!(envelope.reason_code, "DAILY_SPEND_CAP_EXCEEDED");
    assert_eq!(envelope.cost_tracking.daily_spend_before_usd, 4.8);
    assert_eq!(envelope.cost_tracking.daily_spend_after_usd, 5.1);
    assert_eq!(scripted.call_count(Stage::TrendIngestion), 1);
    assert_eq!(scripted.call_count(Stage::ScriptGeneration), 0);
    assert_eq!(engine.daily_spend(RUN_DATE).expect("spend"), 5.1);
}

#[test]
fn daily_cap_reached_exactly_is_caught_by_the_next_pre_check() {
    let scripted = ScriptedStageHandlers::new()
        .script(Stage::TrendIngestion, [StageResponse::success(0.3)]);
    let mut handlers = scripted.build_handlers();
    let mut engine = engine_with(capped(20.0, 5.0));
    engine.set_daily_spend(RUN_DATE, 4.7).expect("seed");

    let envelope = engine
        .run_workflow("workflow-daily-002", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.reason_code, "DAILY_SPEND_CAP_REACHED");
    assert_eq!(envelope.blocked_from_state, Some(WorkflowState::TrendIngested));
    let halt = envelope.budget_halt_event().expect("halt event");
    assert_eq!(halt.stage, Stage::ScriptGeneration);
    assert_eq!(halt.attempt_number, None);
    assert_eq!(halt.daily_spend_usd, 5.0);
    assert!(!envelope.stage_results.contains_key(&Stage::ScriptGeneration));
    assert_eq!(scripted.call_count(Stage::ScriptGeneration), 0);
}

#[test]
fn exhausted_day_never_invokes_a_handler() {
    let scripted = ScriptedStageHandlers::new();
    let mut handlers = scripted.build_handlers();
    let mut engine = engine_with(capped(20.0, 5.0));
    engine.set_daily_spend(RUN_DATE, 5.0).expect("seed");

    let envelope = engine
        .run_workflow("workflow-daily-003", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.reason_code, "DAILY_SPEND_CAP_REACHED");
    assert_eq!(
        envelope.state_trace,
        vec![WorkflowState::Created, WorkflowState::HaltedCostCap]
    );
    assert!(envelope.attempt_trace.is_empty());
    assert_eq!(scripted.call_count(Stage::TrendIngestion), 0);

    let next_day = engine
        .run_workflow("workflow-daily-004", "2026-02-17", &mut handlers, None)
        .expect("run");
    assert!(next_day.is_published());
}

#[test]
fn localization_policy_gate_blocks_regardless_of_status() {
    let scripted = ScriptedStageHandlers::new().script(
        Stage::Localization,
        [StageResponse::success(0.55).with_policy("BLOCKED", "BRAND_SAFETY_RISK")],
    );
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-policy-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::BlockedPolicy);
    assert_eq!(envelope.status, EnvelopeStatus::Blocked);
    assert_eq!(envelope.result_code, "BLOCKED_POLICY_GATE");
    assert_eq!(envelope.reason_code, "BRAND_SAFETY_RISK");
    assert_eq!(envelope.blocked_from_state, Some(WorkflowState::ScenesGenerated));
    assert_eq!(scripted.call_count(Stage::Review), 0);
    assert_eq!(scripted.call_count(Stage::Publish), 0);
}

#[test]
fn review_gate_blocks_without_approval() {
    let scripted = ScriptedStageHandlers::new().script(
        Stage::Review,
        [StageResponse::new("success", 0.0).with_review_status("pending")],
    );
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-review-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::BlockedReviewGate);
    assert_eq!(envelope.result_code, "HUMAN_APPROVAL_REQUIRED");
    assert_eq!(envelope.reason_code, "HUMAN_APPROVAL_REQUIRED");
    assert_eq!(envelope.blocked_from_state, Some(WorkflowState::Localized));
    assert_eq!(scripted.call_count(Stage::Publish), 0);
}

#[test]
fn garbage_status_tokens_fail_closed() {
    for token in ["", "maybe", "succes", "SUCCESS!!"] {
        let scripted = ScriptedStageHandlers::new()
            .script(Stage::ScriptGeneration, [StageResponse::new(token, 0.8)]);
        let mut handlers = scripted.build_handlers();
        let envelope = engine_with(EngineConfig::default())
            .run_workflow("workflow-garbage-001", RUN_DATE, &mut handlers, None)
            .expect("run");
        assert_eq!(envelope.state, WorkflowState::FailedTerminal, "token {token:?}");
        assert_eq!(scripted.call_count(Stage::SceneGeneration), 0);
    }
}

#[test]
fn non_retryable_handler_error_is_terminal() {
    let scripted = ScriptedStageHandlers::new().script(
        Stage::Publish,
        [StageError::non_retryable("UPLOAD_REJECTED", "platform rejected upload")],
    );
    let mut handlers = scripted.build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-error-001", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.state, WorkflowState::FailedTerminal);
    assert_eq!(envelope.reason_code, "UPLOAD_REJECTED");
    assert_eq!(scripted.call_count(Stage::Publish), 1);
}

#[test]
fn invalid_configuration_is_rejected_before_any_run() {
    let error = WorkflowEngine::new(&capped(0.0, 5.0)).err().expect("per-video cap");
    assert_eq!(error.code(), "WORKFLOW_PER_VIDEO_BUDGET_INVALID");
    let error = WorkflowEngine::new(&EngineConfig {
        seedance_profile_fallback_order: vec!["  ".to_string()],
        ..EngineConfig::default()
    })
    .err()
    .expect("profiles");
    assert_eq!(error.code(), "WORKFLOW_SEEDANCE_PROFILE_ORDER_INVALID");
}

#[test]
fn envelope_serializes_with_stable_field_names() {
    let mut handlers = ScriptedStageHandlers::new().build_handlers();
    let envelope = engine_with(EngineConfig::default())
        .run_workflow("workflow-json-001", RUN_DATE, &mut handlers, None)
        .expect("run");
    let value = serde_json::to_value(&envelope).expect("serialize");

    assert_eq!(value["state"], "published");
    assert_eq!(value["status"], "completed");
    assert_eq!(value["stage_order"][2], "scene_generation");
    assert_eq!(value["stage_results"]["localization"]["status"], "success");
    assert_eq!(value["attempt_trace"][0]["status"], "success");
    assert_eq!(value["cost_tracking"]["run_date"], RUN_DATE);
    assert!(value["cost_tracking"]["budget_halt_event"].is_null());
    assert!(value.get("blocked_from_state").is_none());
}

#[test]
fn sqlite_ledger_carries_daily_spend_across_engines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ledger.sqlite");
    let config = capped(20.0, 5.0);

    {
        let ledger = SqliteSpendLedger::open(&path).expect("open");
        let mut engine = WorkflowEngine::with_ledger(&config, ledger).expect("engine");
        let mut handlers = ScriptedStageHandlers::new().build_handlers();
        let envelope = engine
            .run_workflow("workflow-persist-001", RUN_DATE, &mut handlers, None)
            .expect("run");
        assert!(envelope.is_published());
        assert_eq!(envelope.cost_tracking.daily_spend_after_usd, 3.4);
    }

    let ledger = SqliteSpendLedger::open(&path).expect("reopen");
    let mut engine = WorkflowEngine::with_ledger(&config, ledger).expect("engine");
    let scripted = ScriptedStageHandlers::new();
    let mut handlers = scripted.build_handlers();
    let envelope = engine
        .run_workflow("workflow-persist-002", RUN_DATE, &mut handlers, None)
        .expect("run");

    assert_eq!(envelope.cost_tracking.daily_spend_before_usd, 3.4);
    assert_eq!(envelope.reason_code, "DAILY_SPEND_CAP_EXCEEDED");
    assert_eq!(
        envelope.budget_halt_event().map(|event| event.stage),
        Some(Stage::SceneGeneration)
    );
    assert_eq!(scripted.call_count(Stage::Localization), 0);

    let date = reelgate::util::parse_run_date(RUN_DATE).expect("date");
    let rows = engine.ledger().entries(date).expect("entries");
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|row| row.amount_usd > 0.0));
}
