use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use reelgate::logging::init_tracing;
use reelgate::scripted::default_stage_cost;
use reelgate::util::parse_run_date;
use reelgate::{
    EngineConfig, InMemorySpendLedger, ScriptedStageHandlers, SpendLedger, SqliteSpendLedger,
    Stage, StageResponse, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "reelgate")]
#[command(author, version, about = "Budget-guarded short-form video workflow engine", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive one workflow through all six stages with scripted handlers
    Run {
        #[arg(long)]
        workflow_id: String,

        /// Run date (YYYY-MM-DD) that daily spend is billed against
        #[arg(long)]
        run_date: String,

        /// TOML engine config
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite spend ledger; in-memory when omitted
        #[arg(long)]
        ledger_db: Option<PathBuf>,

        /// Overwrite the run date's daily spend before the run
        #[arg(long)]
        seed_daily_spend: Option<f64>,

        #[arg(long)]
        per_video_budget_cap_usd: Option<f64>,

        #[arg(long)]
        daily_spend_cap_usd: Option<f64>,

        #[arg(long)]
        max_retries_per_stage: Option<i64>,

        #[arg(long)]
        retry_backoff_base_seconds: Option<i64>,

        /// Scripted stage outcome, `stage=status[:cost[:code]]`; repeatable
        #[arg(long = "outcome", value_name = "SPEC")]
        outcomes: Vec<String>,
    },

    /// Print the recorded daily spend for a run date
    Ledger {
        #[arg(long)]
        ledger_db: PathBuf,

        #[arg(long)]
        run_date: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            workflow_id,
            run_date,
            config,
            ledger_db,
            seed_daily_spend,
            per_video_budget_cap_usd,
            daily_spend_cap_usd,
            max_retries_per_stage,
            retry_backoff_base_seconds,
            outcomes,
        } => {
            let mut engine_config = match config {
                Some(path) => EngineConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            if let Some(value) = per_video_budget_cap_usd {
                engine_config.per_video_budget_cap_usd = value;
            }
            if let Some(value) = daily_spend_cap_usd {
                engine_config.daily_spend_cap_usd = value;
            }
            if let Some(value) = max_retries_per_stage {
                engine_config.max_retries_per_stage = value;
            }
            if let Some(value) = retry_backoff_base_seconds {
                engine_config.retry_backoff_base_seconds = value;
            }

            let mut scripted = ScriptedStageHandlers::new();
            for raw in &outcomes {
                let (stage, response) = parse_scripted_outcome(raw)?;
                scripted = scripted.script(stage, [response]);
            }

            let request = RunRequest {
                workflow_id,
                run_date,
                seed_daily_spend,
                scripted,
            };
            match ledger_db {
                Some(path) => {
                    let ledger = SqliteSpendLedger::open(&path)
                        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
                    execute(WorkflowEngine::with_ledger(&engine_config, ledger)?, request)
                }
                None => execute(
                    WorkflowEngine::with_ledger(&engine_config, InMemorySpendLedger::new())?,
                    request,
                ),
            }
        }
        Commands::Ledger {
            ledger_db,
            run_date,
        } => {
            let date = parse_run_date(&run_date)
                .ok_or_else(|| anyhow!("run_date must use YYYY-MM-DD (got {run_date:?})"))?;
            let ledger = SqliteSpendLedger::open(&ledger_db)
                .with_context(|| format!("Failed to open ledger {}", ledger_db.display()))?;
            let output = json!({
                "run_date": run_date.trim(),
                "daily_spend_usd": ledger.daily_spend(date)?,
                "entries": ledger.entries(date)?,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

struct RunRequest {
    workflow_id: String,
    run_date: String,
    seed_daily_spend: Option<f64>,
    scripted: ScriptedStageHandlers,
}

fn execute<L: SpendLedger>(mut engine: WorkflowEngine<L>, request: RunRequest) -> Result<()> {
    if let Some(seed) = request.seed_daily_spend {
        engine.set_daily_spend(&request.run_date, seed)?;
        info!(run_date = %request.run_date, seed, "seeded daily spend");
    }

    let mut handlers = request.scripted.build_handlers();
    let envelope = engine
        .run_workflow(&request.workflow_id, &request.run_date, &mut handlers, None)
        .map_err(|e| anyhow!("{} ({})", e, e.code()))?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

/// Parses `stage=status[:cost[:code]]`. A missing cost bills the stage's
/// default; a code sets both result and reason codes.
fn parse_scripted_outcome(raw: &str) -> Result<(Stage, StageResponse)> {
    let (stage, rest) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("outcome {raw:?} must look like stage=status[:cost[:code]]"))?;
    let stage: Stage = stage.trim().parse()?;

    let mut parts = rest.splitn(3, ':');
    let status = parts.next().unwrap_or_default().trim();
    if status.is_empty() {
        bail!("outcome {raw:?} is missing a status");
    }
    let cost_usd = match parts.next().map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse::<f64>()
            .with_context(|| format!("outcome {raw:?} has an invalid cost"))?,
        None => default_stage_cost(stage),
    };

    let mut response = StageResponse::new(status, cost_usd);
    if let Some(code) = parts.next().map(str::trim).filter(|value| !value.is_empty()) {
        response = response.with_codes(code, code);
    }
    Ok((stage, response))
}
