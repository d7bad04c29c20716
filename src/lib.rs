//! Staged production workflow for short-form video with budget circuit
//! breakers, bounded retries and a human review gate.

pub mod budget;
pub mod config;
mod db;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod logging;
pub mod normalizer;
pub mod publishing;
pub mod retry;
pub mod review;
pub mod runner;
pub mod schema;
pub mod scripted;
pub mod util;

pub use budget::{BudgetCap, BudgetGuard, BudgetHaltEvent, CapDecision, HaltReason};
pub use config::EngineConfig;
pub use envelope::{EnvelopeStatus, StageOutcome, StageResult, WorkflowEnvelope};
pub use error::OrchestrationError;
pub use handlers::{
    AttemptMetadata, StageContext, StageError, StageErrorKind, StageHandler, StageHandlers,
    StageResponse,
};
pub use ledger::{InMemorySpendLedger, LedgerError, SpendLedger, SqliteSpendLedger};
pub use normalizer::{canonical_status, normalize_stage_result, CanonicalStatus, NormalizedResult};
pub use publishing::{
    DeterministicPublisher, Platform, PlatformPublisher, PublishError, PublishPayload,
    PublishResponse, PublisherService,
};
pub use retry::RetryPolicy;
pub use review::{ReviewError, ReviewQueue};
pub use runner::WorkflowEngine;
pub use schema::{Stage, WorkflowState};
pub use scripted::{ScriptedOutcome, ScriptedStageHandlers};
