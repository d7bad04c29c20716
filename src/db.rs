use rusqlite::Connection;
use std::path::Path;

pub fn open_ledger_db(path: &Path) -> Result<Connection, String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create ledger directory: {e}"))?;
        }
    }
    let mut connection =
        Connection::open(path).map_err(|e| format!("Failed to open sqlite db: {e}"))?;
    bootstrap_schema(&mut connection)?;
    Ok(connection)
}

/// Creates the spend ledger tables. Safe to run on every open.
///
/// `spend_ledger` is append-only: one row per billable attempt.
/// `daily_spend_baselines` holds an operator-set total for a day together
/// with the ledger sequence it was taken at; daily spend is the baseline
/// plus every row appended after that sequence.
pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), String> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS spend_ledger (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              workflow_id TEXT NOT NULL,
              stage TEXT NOT NULL,
              attempt_number INTEGER NOT NULL,
              amount_usd REAL NOT NULL,
              day_bucket TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_spend_ledger_day
              ON spend_ledger(day_bucket, seq);

            CREATE TABLE IF NOT EXISTS daily_spend_baselines (
              day_bucket TEXT PRIMARY KEY,
              amount_usd REAL NOT NULL,
              ledger_seq INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| format!("Failed to bootstrap ledger schema: {e}"))
}
