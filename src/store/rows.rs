// =============================================================================
// Persisted row types — strike bars, expiry metrics, ancillary bars
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

/// Per-bucket liquidity summary derived from L2 depth snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySummary {
    pub liquidity_score_avg: f64,
    pub liquidity_score_min: f64,
    pub liquidity_tier: String,
    pub spread_abs_avg: f64,
    pub spread_pct_avg: f64,
    pub spread_pct_max: f64,
    pub depth_imbalance_pct_avg: f64,
    pub book_pressure_avg: f64,
    pub total_bid_qty_avg: f64,
    pub total_ask_qty_avg: f64,
    pub is_illiquid: bool,
    pub illiquid_tick_count: u64,
    pub total_tick_count: u64,
}

/// One flushed strike bar. Primary key is
/// `(symbol, expiry, timeframe, bucket_time, strike)`.
///
/// OI columns are native in every timeframe; greek averages are null when no
/// contributing tick carried the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeBarRow {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub timeframe: Timeframe,
    /// Bucket start, epoch milliseconds.
    pub bucket_time: i64,
    pub strike: f64,
    pub underlying_close: Option<f64>,

    pub call_iv_avg: Option<f64>,
    pub put_iv_avg: Option<f64>,
    pub call_delta_avg: Option<f64>,
    pub put_delta_avg: Option<f64>,
    pub call_gamma_avg: Option<f64>,
    pub put_gamma_avg: Option<f64>,
    pub call_theta_avg: Option<f64>,
    pub put_theta_avg: Option<f64>,
    pub call_vega_avg: Option<f64>,
    pub put_vega_avg: Option<f64>,

    pub call_volume: f64,
    pub put_volume: f64,
    pub call_count: u64,
    pub put_count: u64,

    pub call_oi_sum: Option<f64>,
    pub put_oi_sum: Option<f64>,

    pub moneyness_bucket: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidity: Option<LiquiditySummary>,
}

impl StrikeBarRow {
    /// An all-empty row for the given key; aggregation fills it in.
    pub fn empty(
        symbol: String,
        expiry: NaiveDate,
        timeframe: Timeframe,
        bucket_time: i64,
        strike: f64,
    ) -> Self {
        Self {
            symbol,
            expiry,
            timeframe,
            bucket_time,
            strike,
            underlying_close: None,
            call_iv_avg: None,
            put_iv_avg: None,
            call_delta_avg: None,
            put_delta_avg: None,
            call_gamma_avg: None,
            put_gamma_avg: None,
            call_theta_avg: None,
            put_theta_avg: None,
            call_vega_avg: None,
            put_vega_avg: None,
            call_volume: 0.0,
            put_volume: 0.0,
            call_count: 0,
            put_count: 0,
            call_oi_sum: None,
            put_oi_sum: None,
            moneyness_bucket: None,
            liquidity: None,
        }
    }
}

/// One flushed expiry-metrics row. Keyed like a strike bar minus the strike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpiryMetricsRow {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub timeframe: Timeframe,
    pub bucket_time: i64,
    pub total_call_volume: f64,
    pub total_put_volume: f64,
    /// Null when total call volume is zero.
    pub pcr: Option<f64>,
    /// Null when the bucket had no strikes.
    pub max_pain_strike: Option<f64>,
}

/// Backfilled futures minute bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureBarRow {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub bucket_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub oi: Option<f64>,
}

/// One point of a moneyness-grouped time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub bucket_time: i64,
    pub expiry: NaiveDate,
    pub moneyness_bucket: String,
    pub value: Option<f64>,
}
