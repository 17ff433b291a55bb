// =============================================================================
// Rollup scheduler — derive 5min/15min bars from the 1-minute base
// =============================================================================
//
// The aggregated timeframes are maintained by re-aggregation through the same
// weighted math as live ingestion, with the source row's count as the weight:
// counts and volumes are sums, IV/Greeks count-weighted averages over non-null
// sources, OI the latest value in the window, underlying_close the average of
// samples. Rows land through the shared upsert path, so re-running a window
// is idempotent. OI stays native in every table; nothing joins at read time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::aggregation::expiry_metrics;
use crate::aggregation::liquidity::BucketLiquidity;
use crate::aggregation::moneyness;
use crate::aggregation::side_stats::SideStats;
use crate::app_state::HealthCounters;
use crate::store::bars::OptionStore;
use crate::store::rows::StrikeBarRow;
use crate::types::Timeframe;

/// Cadence of the rollup scan.
const ROLLUP_INTERVAL_SECS: u64 = 60;
/// Overlap margin so a scan never misses rows committed while it ran.
const SCAN_MARGIN_MS: i64 = 120_000;

/// Merge the 1-minute rows of one (symbol, expiry, target bucket, strike)
/// group into a single aggregated row.
///
/// All rows must share symbol, expiry and strike; `bucket_start` is the
/// target bucket and `strike_gap` the symbol's strike step for re-labelling
/// moneyness against the averaged spot.
pub fn merge_rows(
    rows: &[StrikeBarRow],
    timeframe: Timeframe,
    bucket_start: i64,
    strike_gap: f64,
) -> Option<StrikeBarRow> {
    let first = rows.first()?;

    let mut call = SideStats::default();
    let mut put = SideStats::default();
    let mut liquidity = BucketLiquidity::default();
    let mut spot_sum = 0.0;
    let mut spot_n = 0u64;

    // Ascending bucket_time so "latest OI wins" holds.
    let mut ordered: Vec<&StrikeBarRow> = rows.iter().collect();
    ordered.sort_by_key(|r| r.bucket_time);

    for row in &ordered {
        call.ingest(
            row.call_count,
            row.call_volume,
            row.call_oi_sum,
            row.call_iv_avg,
            row.call_delta_avg,
            row.call_gamma_avg,
            row.call_theta_avg,
            row.call_vega_avg,
        );
        put.ingest(
            row.put_count,
            row.put_volume,
            row.put_oi_sum,
            row.put_iv_avg,
            row.put_delta_avg,
            row.put_gamma_avg,
            row.put_theta_avg,
            row.put_vega_avg,
        );
        if let Some(spot) = row.underlying_close {
            spot_sum += spot;
            spot_n += 1;
        }
        if let Some(liq) = &row.liquidity {
            liquidity.fold_summary(liq);
        }
    }

    let underlying_close = if spot_n > 0 {
        Some(spot_sum / spot_n as f64)
    } else {
        None
    };

    let mut out = StrikeBarRow::empty(
        first.symbol.clone(),
        first.expiry,
        timeframe,
        bucket_start,
        first.strike,
    );
    out.underlying_close = underlying_close;
    out.call_iv_avg = call.iv.average();
    out.call_delta_avg = call.delta.average();
    out.call_gamma_avg = call.gamma.average();
    out.call_theta_avg = call.theta.average();
    out.call_vega_avg = call.vega.average();
    out.put_iv_avg = put.iv.average();
    out.put_delta_avg = put.delta.average();
    out.put_gamma_avg = put.gamma.average();
    out.put_theta_avg = put.theta.average();
    out.put_vega_avg = put.vega.average();
    out.call_volume = call.sum_volume;
    out.put_volume = put.sum_volume;
    out.call_count = call.count;
    out.put_count = put.count;
    out.call_oi_sum = call.last_oi;
    out.put_oi_sum = put.last_oi;
    out.moneyness_bucket =
        underlying_close.and_then(|spot| moneyness::classify(first.strike, spot, strike_gap));
    out.liquidity = liquidity.summary();
    Some(out)
}

/// Periodic scan: find 1-minute rows touched since the previous pass and
/// rebuild every affected 5min/15min bucket.
pub async fn run_rollup_scheduler(
    store: Arc<OptionStore>,
    strike_gaps: HashMap<String, f64>,
    counters: Arc<HealthCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(ROLLUP_INTERVAL_SECS));
    // First pass covers the last 15-minute window twice over.
    let mut last_scan_ms = Utc::now().timestamp_millis() - 2 * Timeframe::Min15.duration_ms();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!("rollup scheduler stopping");
                return;
            }
        }

        let scan_from = last_scan_ms - SCAN_MARGIN_MS;
        last_scan_ms = Utc::now().timestamp_millis();

        match run_rollup_pass(&store, &strike_gaps, scan_from).await {
            Ok(buckets) => {
                if buckets > 0 {
                    debug!(buckets, "rollup pass complete");
                }
                counters.rollup_runs_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(error = %e, "rollup pass failed — will retry next tick");
            }
        }
    }
}

/// One pass. Returns the number of target buckets rebuilt.
pub async fn run_rollup_pass(
    store: &OptionStore,
    strike_gaps: &HashMap<String, f64>,
    updated_since_ms: i64,
) -> anyhow::Result<usize> {
    let touched = store.fetch_1min_rows_updated_since(updated_since_ms)?;
    if touched.is_empty() {
        return Ok(0);
    }

    // Affected target buckets, deduplicated.
    let mut targets: BTreeMap<(String, NaiveDate, Timeframe, i64), ()> = BTreeMap::new();
    for row in &touched {
        for tf in Timeframe::rollup_targets() {
            targets.insert(
                (
                    row.symbol.clone(),
                    row.expiry,
                    tf,
                    tf.bucket_start(row.bucket_time),
                ),
                (),
            );
        }
    }

    let rebuilt = targets.len();
    for (symbol, expiry, tf, bucket_start) in targets.into_keys() {
        let gap = strike_gaps.get(&symbol).copied().unwrap_or(50.0);
        let window = store.fetch_1min_rows_window(
            &symbol,
            expiry,
            bucket_start,
            bucket_start + tf.duration_ms(),
        )?;
        if window.is_empty() {
            continue;
        }

        // Group the window rows by strike and merge each group.
        let mut by_strike: BTreeMap<i64, Vec<StrikeBarRow>> = BTreeMap::new();
        for row in window {
            by_strike
                .entry((row.strike * 100.0).round() as i64)
                .or_default()
                .push(row);
        }
        let rows: Vec<StrikeBarRow> = by_strike
            .values()
            .filter_map(|group| merge_rows(group, tf, bucket_start, gap))
            .collect();

        let metrics = expiry_metrics::compute(&rows);
        store.upsert_strike_bars(&rows).await?;
        if let Some(m) = metrics {
            store.upsert_expiry_metrics(std::slice::from_ref(&m)).await?;
        }
    }

    Ok(rebuilt)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 6).unwrap()
    }

    fn min1_row(bucket_time: i64, iv: Option<f64>, count: u64, volume: f64) -> StrikeBarRow {
        let mut r = StrikeBarRow::empty(
            "NIFTY".into(),
            expiry(),
            Timeframe::Min1,
            bucket_time,
            25_000.0,
        );
        r.call_iv_avg = iv;
        r.call_count = count;
        r.call_volume = volume;
        r.underlying_close = Some(24_650.0);
        r
    }

    #[test]
    fn merge_weights_by_source_count() {
        // iv 0.20 weight 3, iv 0.22 weight 2, null weight 1 → 0.2080, count 6.
        let rows = vec![
            min1_row(0, Some(0.20), 3, 300.0),
            min1_row(60_000, Some(0.22), 2, 200.0),
            min1_row(120_000, None, 1, 100.0),
        ];
        let merged = merge_rows(&rows, Timeframe::Min5, 0, 50.0).unwrap();
        assert!((merged.call_iv_avg.unwrap() - 0.208).abs() < 1e-12);
        assert_eq!(merged.call_count, 6);
        assert_eq!(merged.call_volume, 600.0);
        assert_eq!(merged.timeframe, Timeframe::Min5);
    }

    #[test]
    fn merge_takes_latest_oi() {
        let mut a = min1_row(0, None, 1, 0.0);
        a.call_oi_sum = Some(1_000.0);
        let mut b = min1_row(60_000, None, 1, 0.0);
        b.call_oi_sum = Some(1_500.0);
        // Deliberately pass out of order; merge sorts by bucket_time.
        let merged = merge_rows(&[b, a], Timeframe::Min5, 0, 50.0).unwrap();
        assert_eq!(merged.call_oi_sum, Some(1_500.0));
    }

    #[test]
    fn merge_averages_underlying_samples() {
        let mut a = min1_row(0, None, 1, 0.0);
        a.underlying_close = Some(24_600.0);
        let mut b = min1_row(60_000, None, 1, 0.0);
        b.underlying_close = Some(24_700.0);
        let merged = merge_rows(&[a, b], Timeframe::Min5, 0, 50.0).unwrap();
        assert_eq!(merged.underlying_close, Some(24_650.0));
        assert_eq!(merged.moneyness_bucket.as_deref(), Some("OTM7"));
    }

    #[test]
    fn merge_of_nothing_is_none() {
        assert!(merge_rows(&[], Timeframe::Min5, 0, 50.0).is_none());
    }

    #[tokio::test]
    async fn rollup_pass_builds_consistent_5min_bars() {
        let store = OptionStore::open_in_memory().unwrap();
        // Three 1-minute bars inside the same 5-minute bucket.
        store
            .upsert_strike_bars(&[
                min1_row(0, Some(0.20), 3, 300.0),
                min1_row(60_000, Some(0.22), 2, 200.0),
                min1_row(120_000, None, 1, 100.0),
            ])
            .await
            .unwrap();

        let gaps = HashMap::from([("NIFTY".to_string(), 50.0)]);
        let rebuilt = run_rollup_pass(&store, &gaps, 0).await.unwrap();
        assert!(rebuilt >= 1);

        let rows = store
            .fetch_latest_strikes("NIFTY", Timeframe::Min5, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        let bar = &rows[0];
        assert_eq!(bar.bucket_time, 0);
        // Counts/volumes are sums of the source bars.
        assert_eq!(bar.call_count, 6);
        assert_eq!(bar.call_volume, 600.0);
        // IV is the count-weighted average over non-null sources.
        assert!((bar.call_iv_avg.unwrap() - 0.208).abs() < 1e-12);

        // Expiry metrics exist at the rolled-up timeframe too.
        let metrics = store
            .fetch_latest_expiry_metrics("NIFTY", Timeframe::Min5, &[expiry()])
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total_call_volume, 600.0);
    }

    #[tokio::test]
    async fn rollup_pass_is_idempotent() {
        let store = OptionStore::open_in_memory().unwrap();
        store
            .upsert_strike_bars(&[min1_row(0, Some(0.20), 3, 300.0)])
            .await
            .unwrap();

        let gaps = HashMap::new();
        run_rollup_pass(&store, &gaps, 0).await.unwrap();
        run_rollup_pass(&store, &gaps, 0).await.unwrap();

        let rows = store
            .fetch_latest_strikes("NIFTY", Timeframe::Min5, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call_volume, 300.0);
    }
}
