// =============================================================================
// Canonical cache keys and the TTL matrix
// =============================================================================
//
// Keys are structured, never free-form:
//
//   cache:fo:v2:latest:{symbol}:{tf}:{indicator}:{expiry-hash}
//   cache:fo:v2:series:{symbol}:{tf}:{indicator}:{side}:{expiry-hash}:{time-hash}
//   cache:fo:v2:history:{symbol}:{tf}:{expiry}:{strike}:{time-hash}
//   cache:fo:v2:static:expiries:{symbol}
//
// Invalidation is by structured prefix, so a flush for (symbol, timeframe)
// clears every dependent read in one pass. Hashes are SHA-256 truncations so
// the same request maps to the same key across processes sharing L2.

use std::time::Duration;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::runtime_config::CacheTtlConfig;
use crate::types::{format_expiry, Indicator, OptionSide, Timeframe};

const NAMESPACE: &str = "cache:fo:v2";

/// Short stable digest for key components that would otherwise be unbounded.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..6])
}

fn expiry_hash(expiries: &[NaiveDate]) -> String {
    let mut sorted: Vec<String> = expiries.iter().map(|e| format_expiry(*e)).collect();
    sorted.sort();
    short_hash(&sorted.join(","))
}

/// Round a timestamp to the nearest 5 minutes for cache-key stability.
pub fn round_to_5min(ts_ms: i64) -> i64 {
    const STEP: i64 = 300_000;
    ((ts_ms + STEP / 2).div_euclid(STEP)) * STEP
}

pub fn latest_key(
    symbol: &str,
    tf: Timeframe,
    indicator: Indicator,
    expiries: &[NaiveDate],
) -> String {
    format!(
        "{NAMESPACE}:latest:{symbol}:{tf}:{indicator}:{}",
        expiry_hash(expiries)
    )
}

pub fn series_key(
    symbol: &str,
    tf: Timeframe,
    indicator: Indicator,
    side: OptionSide,
    expiries: &[NaiveDate],
    from_ms: i64,
    to_ms: i64,
) -> String {
    let time_hash = short_hash(&format!(
        "{}-{}",
        round_to_5min(from_ms),
        round_to_5min(to_ms)
    ));
    format!(
        "{NAMESPACE}:series:{symbol}:{tf}:{indicator}:{side}:{}:{time_hash}",
        expiry_hash(expiries)
    )
}

pub fn history_key(
    symbol: &str,
    tf: Timeframe,
    expiry: NaiveDate,
    strike: f64,
    from_ms: i64,
    to_ms: i64,
) -> String {
    let time_hash = short_hash(&format!(
        "{}-{}",
        round_to_5min(from_ms),
        round_to_5min(to_ms)
    ));
    format!(
        "{NAMESPACE}:history:{symbol}:{tf}:{}:{strike}:{time_hash}",
        format_expiry(expiry)
    )
}

pub fn static_expiries_key(symbol: &str) -> String {
    format!("{NAMESPACE}:static:expiries:{symbol}")
}

/// Prefixes cleared after a successful flush of (symbol, timeframe, expiry).
pub fn flush_invalidation_prefixes(
    symbol: &str,
    tf: Timeframe,
    expiry: NaiveDate,
) -> [String; 3] {
    [
        format!("{NAMESPACE}:latest:{symbol}:{tf}:"),
        format!("{NAMESPACE}:series:{symbol}:{tf}:"),
        format!(
            "{NAMESPACE}:history:{symbol}:{tf}:{}:",
            format_expiry(expiry)
        ),
    ]
}

/// TTL for a series query: recent windows decay fast, historical ones slowly.
pub fn series_ttl(cfg: &CacheTtlConfig, to_ms: i64, now_ms: i64) -> Duration {
    if to_ms > now_ms - 3_600_000 {
        Duration::from_secs(cfg.series_recent)
    } else {
        Duration::from_secs(cfg.series_historical)
    }
}
