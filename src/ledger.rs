use crate::db;
use crate::schema::Stage;
use crate::util::{round_usd, ISO_DATE};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(String),
    #[error("spend amount must be a finite number, got {0}")]
    InvalidAmount(f64),
}

/// One billable attempt as seen by the ledger.
#[derive(Debug, Clone, Copy)]
pub struct SpendEntry<'a> {
    pub workflow_id: &'a str,
    pub stage: Stage,
    pub attempt_number: u32,
    pub amount_usd: f64,
}

/// Accumulated spend per run date, shared by every run on that date.
///
/// Spend is never rolled back, including for halted runs. Implementations
/// are not synchronized: callers that run workflows concurrently must hold
/// one lock per run date across the read-check-write of a budget check.
pub trait SpendLedger {
    fn daily_spend(&self, run_date: NaiveDate) -> Result<f64, LedgerError>;

    /// Overwrites the total for a date (seeding or operator correction).
    fn set_daily_spend(&mut self, run_date: NaiveDate, spend_usd: f64) -> Result<(), LedgerError>;

    /// Adds an attempt's cost and returns the new daily total.
    fn record_spend(
        &mut self,
        run_date: NaiveDate,
        entry: &SpendEntry<'_>,
    ) -> Result<f64, LedgerError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySpendLedger {
    spend_by_date: HashMap<NaiveDate, f64>,
}

impl InMemorySpendLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpendLedger for InMemorySpendLedger {
    fn daily_spend(&self, run_date: NaiveDate) -> Result<f64, LedgerError> {
        Ok(round_usd(self.spend_by_date.get(&run_date).copied().unwrap_or(0.0)))
    }

    fn set_daily_spend(&mut self, run_date: NaiveDate, spend_usd: f64) -> Result<(), LedgerError> {
        ensure_finite(spend_usd)?;
        self.spend_by_date.insert(run_date, round_usd(spend_usd));
        Ok(())
    }

    fn record_spend(
        &mut self,
        run_date: NaiveDate,
        entry: &SpendEntry<'_>,
    ) -> Result<f64, LedgerError> {
        ensure_finite(entry.amount_usd)?;
        let total = self.spend_by_date.entry(run_date).or_insert(0.0);
        *total = round_usd(*total + entry.amount_usd);
        Ok(*total)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpendRecord {
    pub id: String,
    pub workflow_id: String,
    pub stage: String,
    pub attempt_number: i64,
    pub amount_usd: f64,
    pub day_bucket: String,
    pub created_at_ms: i64,
}

/// SQLite-backed ledger so daily spend survives process restarts.
pub struct SqliteSpendLedger {
    connection: Connection,
}

impl SqliteSpendLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let connection = db::open_ledger_db(path).map_err(LedgerError::Db)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let mut connection =
            Connection::open_in_memory().map_err(|e| LedgerError::Db(e.to_string()))?;
        db::bootstrap_schema(&mut connection).map_err(LedgerError::Db)?;
        Ok(Self { connection })
    }

    /// Attempts billed against a date, oldest first.
    pub fn entries(&self, run_date: NaiveDate) -> Result<Vec<SpendRecord>, LedgerError> {
        let mut stmt = self
            .connection
            .prepare(
                "SELECT id, workflow_id, stage, attempt_number, amount_usd, day_bucket, created_at
                 FROM spend_ledger WHERE day_bucket = ?1 ORDER BY seq ASC",
            )
            .map_err(|e| LedgerError::Db(e.to_string()))?;
        let rows = stmt
            .query_map(params![day_bucket(run_date)], |row| {
                Ok(SpendRecord {
                    id: row.get(0)?,
                    workflow_id: row.get(1)?,
                    stage: row.get(2)?,
                    attempt_number: row.get(3)?,
                    amount_usd: row.get(4)?,
                    day_bucket: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })
            .map_err(|e| LedgerError::Db(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| LedgerError::Db(e.to_string()))?);
        }
        Ok(out)
    }
}

impl SpendLedger for SqliteSpendLedger {
    fn daily_spend(&self, run_date: NaiveDate) -> Result<f64, LedgerError> {
        daily_spend_in(&self.connection, &day_bucket(run_date))
    }

    fn set_daily_spend(&mut self, run_date: NaiveDate, spend_usd: f64) -> Result<(), LedgerError> {
        ensure_finite(spend_usd)?;
        self.connection
            .execute(
                "
                INSERT INTO daily_spend_baselines (day_bucket, amount_usd, ledger_seq, updated_at)
                VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) FROM spend_ledger), ?3)
                ON CONFLICT(day_bucket) DO UPDATE SET
                  amount_usd = excluded.amount_usd,
                  ledger_seq = excluded.ledger_seq,
                  updated_at = excluded.updated_at
                ",
                params![day_bucket(run_date), round_usd(spend_usd), now_ms()],
            )
            .map_err(|e| LedgerError::Db(e.to_string()))?;
        Ok(())
    }

    fn record_spend(
        &mut self,
        run_date: NaiveDate,
        entry: &SpendEntry<'_>,
    ) -> Result<f64, LedgerError> {
        ensure_finite(entry.amount_usd)?;
        let bucket = day_bucket(run_date);
        let tx = self
            .connection
            .transaction()
            .map_err(|e| LedgerError::Db(e.to_string()))?;

        if entry.amount_usd > 0.0 {
            tx.execute(
                "
                INSERT INTO spend_ledger (id, workflow_id, stage, attempt_number, amount_usd, day_bucket, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    make_id("spend"),
                    entry.workflow_id,
                    entry.stage.as_str(),
                    entry.attempt_number,
                    round_usd(entry.amount_usd),
                    bucket,
                    now_ms()
                ],
            )
            .map_err(|e| LedgerError::Db(e.to_string()))?;
        }

        let total = daily_spend_in(&tx, &bucket)?;
        tx.commit().map_err(|e| LedgerError::Db(e.to_string()))?;
        Ok(total)
    }
}

fn daily_spend_in(connection: &Connection, bucket: &str) -> Result<f64, LedgerError> {
    let baseline: Option<(f64, i64)> = connection
        .query_row(
            "SELECT amount_usd, ledger_seq FROM daily_spend_baselines WHERE day_bucket = ?1",
            params![bucket],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| LedgerError::Db(e.to_string()))?;
    let (baseline_usd, after_seq) = baseline.unwrap_or((0.0, 0));

    let appended: f64 = connection
        .query_row(
            "SELECT COALESCE(SUM(amount_usd), 0.0) FROM spend_ledger WHERE day_bucket = ?1 AND seq > ?2",
            params![bucket, after_seq],
            |row| row.get(0),
        )
        .map_err(|e| LedgerError::Db(e.to_string()))?;

    Ok(round_usd(baseline_usd + appended))
}

fn ensure_finite(amount: f64) -> Result<(), LedgerError> {
    if amount.is_finite() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(amount))
    }
}

fn day_bucket(run_date: NaiveDate) -> String {
    run_date.format(ISO_DATE).to_string()
}

fn make_id(prefix: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", prefix, now_ms(), counter)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
