use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const ISO_DATE: &str = "%Y-%m-%d";
pub const ISO_8601_UTC_Z: &str = "%Y-%m-%dT%H:%M:%SZ";
const ISO_8601_UTC_Z_FRACTIONAL: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Rounds a USD amount to four decimal places.
///
/// Every accumulation in the engine goes through this so that repeated
/// float additions (0.45 + 0.8 + 1.2) compare cleanly against caps.
pub fn round_usd(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Deterministic short identifier: `<prefix>-<first 12 hex chars of sha256(parts joined by '|')>`.
pub fn stable_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    format!("{}-{}", prefix, &hex[..12])
}

pub fn parse_run_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), ISO_DATE).ok()
}

/// Parses `YYYY-MM-DDTHH:MM:SSZ`, with or without fractional seconds.
pub fn parse_utc_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    [ISO_8601_UTC_Z, ISO_8601_UTC_Z_FRACTIONAL]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_utc_timestamp(value: DateTime<Utc>) -> String {
    value.format(ISO_8601_UTC_Z).to_string()
}

/// Injectable source of "now" for SLA and publish-window checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
