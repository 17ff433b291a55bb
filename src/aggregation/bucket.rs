// =============================================================================
// Strike bucket — per-(symbol, expiry, timeframe, bucket_start) state machine
// =============================================================================
//
// A bucket is created lazily by the first in-window tick, mutated in place by
// later ticks, materialised into persisted rows at flush, and then discarded.
// While in memory it is owned exclusively by one aggregation worker.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::aggregation::liquidity::{BucketLiquidity, TickLiquidity};
use crate::aggregation::moneyness;
use crate::aggregation::side_stats::SideStats;
use crate::market_data::tick::OptionTick;
use crate::store::rows::StrikeBarRow;
use crate::types::{OptionSide, Timeframe};

/// Identity of one in-memory bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub timeframe: Timeframe,
    /// Bucket start, epoch milliseconds.
    pub bucket_start: i64,
}

impl BucketKey {
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start + self.timeframe.duration_ms()
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.symbol, self.expiry, self.timeframe, self.bucket_start
        )
    }
}

/// Strikes are keyed by price in hundredths so the map stays ordered without
/// relying on float ordering.
fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

/// Call/put aggregates plus liquidity for a single strike.
#[derive(Debug, Clone, Default)]
pub struct StrikeEntry {
    pub strike: f64,
    pub call: SideStats,
    pub put: SideStats,
    pub liquidity: BucketLiquidity,
}

/// All strikes of one bucket.
#[derive(Debug, Clone)]
pub struct StrikeBucket {
    entries: BTreeMap<i64, StrikeEntry>,
    /// Spot at the latest contributing tick.
    pub underlying_close: Option<f64>,
    /// Wall-clock of the last mutation, for observability.
    pub last_touch_ms: i64,
}

impl StrikeBucket {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            underlying_close: None,
            last_touch_ms: 0,
        }
    }

    /// Fold a live tick in. `volume_delta` is the traded volume this tick
    /// contributes (cumulative volume deltas are resolved by the worker);
    /// `underlying_close` is the spot at tick time when known.
    pub fn ingest_tick(
        &mut self,
        tick: &OptionTick,
        volume_delta: f64,
        underlying_close: Option<f64>,
        now_ms: i64,
    ) {
        let entry = self
            .entries
            .entry(strike_key(tick.strike))
            .or_insert_with(|| StrikeEntry {
                strike: tick.strike,
                ..StrikeEntry::default()
            });

        let side = match tick.option_side {
            OptionSide::Call => &mut entry.call,
            OptionSide::Put => &mut entry.put,
        };
        side.ingest(
            1,
            volume_delta,
            tick.oi,
            tick.iv,
            tick.delta,
            tick.gamma,
            tick.theta,
            tick.vega,
        );

        if let Some(depth) = &tick.depth {
            if let Some(m) = TickLiquidity::from_depth(depth) {
                entry.liquidity.fold(&m, 1);
            }
        }

        if underlying_close.is_some() {
            self.underlying_close = underlying_close;
        }
        self.last_touch_ms = now_ms;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn strike_count(&self) -> usize {
        self.entries.len()
    }

    /// Materialise per-strike persisted rows. Weighted averages resolve here;
    /// moneyness is classified against the captured spot with the symbol's
    /// strike step.
    pub fn materialize(&self, key: &BucketKey, strike_gap: f64) -> Vec<StrikeBarRow> {
        self.entries
            .values()
            .map(|entry| {
                let mut row = StrikeBarRow::empty(
                    key.symbol.clone(),
                    key.expiry,
                    key.timeframe,
                    key.bucket_start,
                    entry.strike,
                );
                row.underlying_close = self.underlying_close;

                row.call_iv_avg = entry.call.iv.average();
                row.call_delta_avg = entry.call.delta.average();
                row.call_gamma_avg = entry.call.gamma.average();
                row.call_theta_avg = entry.call.theta.average();
                row.call_vega_avg = entry.call.vega.average();
                row.put_iv_avg = entry.put.iv.average();
                row.put_delta_avg = entry.put.delta.average();
                row.put_gamma_avg = entry.put.gamma.average();
                row.put_theta_avg = entry.put.theta.average();
                row.put_vega_avg = entry.put.vega.average();

                row.call_volume = entry.call.sum_volume;
                row.put_volume = entry.put.sum_volume;
                row.call_count = entry.call.count;
                row.put_count = entry.put.count;
                row.call_oi_sum = entry.call.last_oi;
                row.put_oi_sum = entry.put.last_oi;

                row.moneyness_bucket = self
                    .underlying_close
                    .and_then(|spot| moneyness::classify(entry.strike, spot, strike_gap));
                row.liquidity = entry.liquidity.summary();
                row
            })
            .collect()
    }
}

impl Default for StrikeBucket {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BucketKey {
        BucketKey {
            symbol: "NIFTY".into(),
            expiry: NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            timeframe: Timeframe::Min1,
            bucket_start: 36_000_000, // 10:00 into the day
        }
    }

    fn tick(side: OptionSide, strike: f64, iv: Option<f64>, ts: i64) -> OptionTick {
        OptionTick {
            symbol: "NIFTY".into(),
            expiry: NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            strike,
            option_side: side,
            last_price: 180.0,
            volume: 0.0,
            oi: Some(1_000_000.0),
            iv,
            delta: None,
            gamma: None,
            theta: None,
            vega: None,
            ts,
            depth: None,
            is_mock: false,
        }
    }

    #[test]
    fn lazy_strike_creation_and_side_routing() {
        let mut bucket = StrikeBucket::new();
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, Some(0.2), 1), 100.0, None, 1);
        bucket.ingest_tick(&tick(OptionSide::Put, 25_000.0, Some(0.3), 2), 50.0, None, 2);
        bucket.ingest_tick(&tick(OptionSide::Call, 25_050.0, None, 3), 25.0, None, 3);

        assert_eq!(bucket.strike_count(), 2);
        let rows = bucket.materialize(&key(), 50.0);
        assert_eq!(rows.len(), 2);
        let atm = &rows[0];
        assert_eq!(atm.strike, 25_000.0);
        assert_eq!(atm.call_count, 1);
        assert_eq!(atm.put_count, 1);
        assert_eq!(atm.call_volume, 100.0);
        assert_eq!(atm.put_volume, 50.0);
    }

    #[test]
    fn underlying_close_is_latest_contribution() {
        let mut bucket = StrikeBucket::new();
        bucket.ingest_tick(
            &tick(OptionSide::Call, 25_000.0, None, 1),
            0.0,
            Some(24_700.0),
            1,
        );
        bucket.ingest_tick(
            &tick(OptionSide::Call, 25_000.0, None, 2),
            0.0,
            Some(24_710.0),
            2,
        );
        // A tick without a known spot leaves the captured value alone.
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, None, 3), 0.0, None, 3);
        assert_eq!(bucket.underlying_close, Some(24_710.0));
    }

    #[test]
    fn materialize_classifies_moneyness_from_spot() {
        let mut bucket = StrikeBucket::new();
        for strike in [24_600.0, 24_650.0, 24_700.0, 26_000.0] {
            bucket.ingest_tick(
                &tick(OptionSide::Call, strike, None, 1),
                0.0,
                Some(24_650.0),
                1,
            );
        }
        let rows = bucket.materialize(&key(), 50.0);
        let labels: Vec<_> = rows
            .iter()
            .map(|r| r.moneyness_bucket.clone().unwrap())
            .collect();
        assert_eq!(labels, vec!["ITM1", "ATM", "OTM1", "OTM10"]);
    }

    #[test]
    fn no_spot_means_no_moneyness() {
        let mut bucket = StrikeBucket::new();
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, None, 1), 0.0, None, 1);
        let rows = bucket.materialize(&key(), 50.0);
        assert_eq!(rows[0].moneyness_bucket, None);
        assert_eq!(rows[0].underlying_close, None);
    }

    #[test]
    fn weighted_iv_resolves_at_materialize() {
        let mut bucket = StrikeBucket::new();
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, Some(0.20), 1), 0.0, None, 1);
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, Some(0.22), 2), 0.0, None, 2);
        bucket.ingest_tick(&tick(OptionSide::Call, 25_000.0, None, 3), 0.0, None, 3);

        let rows = bucket.materialize(&key(), 50.0);
        let iv = rows[0].call_iv_avg.unwrap();
        assert!((iv - 0.21).abs() < 1e-12);
        assert_eq!(rows[0].call_count, 3);
    }

    #[test]
    fn oi_is_level_latest_wins() {
        let mut bucket = StrikeBucket::new();
        let mut t1 = tick(OptionSide::Put, 25_000.0, None, 1);
        t1.oi = Some(2_000_000.0);
        let mut t2 = tick(OptionSide::Put, 25_000.0, None, 2);
        t2.oi = Some(2_100_000.0);
        bucket.ingest_tick(&t1, 0.0, None, 1);
        bucket.ingest_tick(&t2, 0.0, None, 2);

        let rows = bucket.materialize(&key(), 50.0);
        assert_eq!(rows[0].put_oi_sum, Some(2_100_000.0));
        assert_eq!(rows[0].call_oi_sum, None);
    }

    #[test]
    fn bucket_end_is_start_plus_duration() {
        let k = key();
        assert_eq!(k.bucket_end(), k.bucket_start + 60_000);
    }
}
