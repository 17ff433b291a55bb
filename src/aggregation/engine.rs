// =============================================================================
// Aggregation engine — sharded single-writer workers with flush scheduling
// =============================================================================
//
// Ticks are partitioned across N workers by hash(symbol, expiry, strike), so
// every tick for a given bucket key lands on the same worker and each bucket
// has exactly one writer for its whole life. A worker owns its partition's
// buckets outright; no locks are involved on the ingest path.
//
// Flush: a bucket becomes due once its close time has elapsed by the grace
// margin, or as soon as a newer bucket for the same (symbol, expiry) starts
// accumulating. Transient store failures keep the bucket in memory and retry
// with exponential backoff on the 1-second scan; rejected writes drop the
// bucket and count an abandonment. Cache invalidation runs after the store
// commit and before the hub broadcast.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::aggregation::bucket::{BucketKey, StrikeBucket};
use crate::aggregation::expiry_metrics;
use crate::app_state::HealthCounters;
use crate::cache::tier::CacheTier;
use crate::errors::StoreError;
use crate::hub::{BroadcastHub, HubMessage};
use crate::market_data::tick::OptionTick;
use crate::market_data::underlying::UnderlyingTracker;
use crate::store::bars::OptionStore;
use crate::types::{OptionSide, Timeframe};

/// Cap on the per-bucket retry backoff. This outer loop re-attempts whole
/// flushes across scan ticks; the store adapter separately retries each
/// individual write in-call before its error ever reaches us.
const MAX_RETRY_BACKOFF_MS: i64 = 60_000;

/// Stable shard assignment for a tick's instrument.
pub fn shard_for(symbol: &str, expiry: NaiveDate, strike: f64, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    expiry.hash(&mut hasher);
    strike.to_bits().hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Backoff for the n-th retry (1-based): 1s, 2s, 4s … capped at 60s.
fn retry_backoff_ms(attempts: u32) -> i64 {
    (1_000_i64 << attempts.min(16).saturating_sub(1)).min(MAX_RETRY_BACKOFF_MS)
}

/// Shared dependencies handed to every worker.
pub struct AggregationContext {
    pub store: Arc<OptionStore>,
    pub cache: Arc<CacheTier>,
    pub hub: Arc<BroadcastHub>,
    pub tracker: Arc<UnderlyingTracker>,
    pub counters: Arc<HealthCounters>,
    /// Late-tick tolerance after bucket close.
    pub grace_ms: i64,
    /// Per-symbol strike step for moneyness labelling.
    pub strike_gaps: HashMap<String, f64>,
}

impl AggregationContext {
    fn strike_gap_for(&self, symbol: &str) -> f64 {
        self.strike_gaps.get(symbol).copied().unwrap_or(50.0)
    }
}

/// A bucket awaiting flush, with its retry state.
struct PendingBucket {
    bucket: StrikeBucket,
    attempts: u32,
    /// Earliest wall-clock ms the next flush attempt may run; None = no
    /// failed attempt yet.
    next_attempt_ms: Option<i64>,
}

/// Per-instrument-side cumulative-volume baseline. The bus carries session
/// cumulative volume; buckets store the traded delta.
type VolumeKey = (String, NaiveDate, i64, OptionSide);

/// One shard of the aggregation engine. Single-threaded over its partition.
pub struct AggregationWorker {
    id: usize,
    ctx: Arc<AggregationContext>,
    buckets: HashMap<BucketKey, PendingBucket>,
    cum_volume: HashMap<VolumeKey, f64>,
}

impl AggregationWorker {
    pub fn new(id: usize, ctx: Arc<AggregationContext>) -> Self {
        Self {
            id,
            ctx,
            buckets: HashMap::new(),
            cum_volume: HashMap::new(),
        }
    }

    /// Number of live buckets (observability).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Fold one tick into its 1-minute bucket.
    pub fn ingest(&mut self, tick: &OptionTick) {
        // The dispatcher already filters generator output; this guard keeps
        // the invariant local to the writer as well.
        if tick.is_mock {
            self.ctx
                .counters
                .mock_dropped_total
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let volume_delta = self.volume_delta(tick);
        let key = BucketKey {
            symbol: tick.symbol.clone(),
            expiry: tick.expiry,
            timeframe: Timeframe::Min1,
            bucket_start: Timeframe::Min1.bucket_start(tick.ts),
        };
        let spot = self.ctx.tracker.close(&tick.symbol);
        let now = Utc::now().timestamp_millis();

        let pending = self.buckets.entry(key).or_insert_with(|| PendingBucket {
            bucket: StrikeBucket::new(),
            attempts: 0,
            next_attempt_ms: None,
        });
        pending.bucket.ingest_tick(tick, volume_delta, spot, now);
    }

    /// Traded volume this tick contributes, from the cumulative baseline.
    /// The first sighting of an instrument establishes the baseline and
    /// contributes nothing; a cumulative reset (new session) re-baselines.
    fn volume_delta(&mut self, tick: &OptionTick) -> f64 {
        let key = (
            tick.symbol.clone(),
            tick.expiry,
            (tick.strike * 100.0).round() as i64,
            tick.option_side,
        );
        match self.cum_volume.insert(key, tick.volume) {
            Some(prev) if tick.volume >= prev => tick.volume - prev,
            _ => 0.0,
        }
    }

    /// Buckets due for flush at `now`: rolled past close+grace, superseded by
    /// a newer bucket of the same (symbol, expiry), and retry-due buckets.
    fn due_keys(&self, now_ms: i64) -> Vec<BucketKey> {
        // Newest bucket_start per (symbol, expiry), for the supersession rule.
        let mut newest: HashMap<(&str, NaiveDate), i64> = HashMap::new();
        for key in self.buckets.keys() {
            let e = newest.entry((key.symbol.as_str(), key.expiry)).or_insert(0);
            *e = (*e).max(key.bucket_start);
        }

        self.buckets
            .iter()
            .filter(|(key, pending)| {
                if let Some(next) = pending.next_attempt_ms {
                    return next <= now_ms;
                }
                let rolled = now_ms > key.bucket_end() + self.ctx.grace_ms;
                let superseded = newest
                    .get(&(key.symbol.as_str(), key.expiry))
                    .is_some_and(|newest_start| *newest_start > key.bucket_start);
                rolled || superseded
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Flush every due bucket.
    pub async fn scan_and_flush(&mut self, now_ms: i64) {
        for key in self.due_keys(now_ms) {
            self.flush(&key, now_ms).await;
        }
    }

    /// Flush one bucket: materialise, persist, invalidate, broadcast.
    async fn flush(&mut self, key: &BucketKey, now_ms: i64) {
        let Some(pending) = self.buckets.remove(key) else {
            return;
        };
        if pending.bucket.is_empty() {
            return;
        }

        let gap = self.ctx.strike_gap_for(&key.symbol);
        let rows = pending.bucket.materialize(key, gap);
        let metrics = expiry_metrics::compute(&rows);

        let write_result = async {
            self.ctx.store.upsert_strike_bars(&rows).await?;
            if let Some(m) = &metrics {
                self.ctx
                    .store
                    .upsert_expiry_metrics(std::slice::from_ref(m))
                    .await?;
            }
            Ok::<(), StoreError>(())
        }
        .await;

        match write_result {
            Ok(()) => {
                self.ctx
                    .counters
                    .buckets_flushed_total
                    .fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .counters
                    .store_writes_total
                    .fetch_add(1, Ordering::Relaxed);

                // Invalidate after commit, broadcast after invalidation.
                self.ctx
                    .cache
                    .invalidate_on_flush(&key.symbol, key.timeframe, key.expiry)
                    .await;
                self.ctx
                    .hub
                    .broadcast(HubMessage::bucket(key, &rows, metrics.as_ref()));

                debug!(
                    worker = self.id,
                    bucket = %key,
                    strikes = rows.len(),
                    "bucket flushed"
                );
            }
            Err(e) if e.is_transient() => {
                let attempts = pending.attempts + 1;
                let backoff = retry_backoff_ms(attempts);
                warn!(
                    worker = self.id,
                    bucket = %key,
                    attempts,
                    backoff_ms = backoff,
                    error = %e,
                    "flush failed transiently — holding bucket"
                );
                self.ctx
                    .counters
                    .flush_retries_total
                    .fetch_add(1, Ordering::Relaxed);
                self.buckets.insert(
                    key.clone(),
                    PendingBucket {
                        bucket: pending.bucket,
                        attempts,
                        next_attempt_ms: Some(now_ms + backoff),
                    },
                );
            }
            Err(e) => {
                error!(
                    worker = self.id,
                    bucket = %key,
                    strikes = rows.len(),
                    error = %e,
                    "flush rejected — dropping bucket"
                );
                self.ctx
                    .counters
                    .buckets_abandoned_total
                    .fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .counters
                    .store_errors_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Best-effort flush of completed buckets on shutdown. Buckets still
    /// inside their window are dropped.
    pub async fn drain(&mut self) {
        let now = Utc::now().timestamp_millis();
        let completed: Vec<BucketKey> = self
            .buckets
            .keys()
            .filter(|k| k.bucket_end() <= now)
            .cloned()
            .collect();
        let dropped = self.buckets.len() - completed.len();
        for key in completed {
            self.flush(&key, now).await;
        }
        if dropped > 0 {
            info!(worker = self.id, dropped, "incomplete buckets dropped at shutdown");
        }
    }
}

/// Worker task: receive ticks, scan for due flushes every second, drain on
/// shutdown.
pub async fn run_aggregation_worker(
    id: usize,
    mut rx: mpsc::Receiver<OptionTick>,
    ctx: Arc<AggregationContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut worker = AggregationWorker::new(id, ctx);
    let mut scan = tokio::time::interval(tokio::time::Duration::from_secs(1));
    info!(worker = id, "aggregation worker started");

    loop {
        tokio::select! {
            tick = rx.recv() => {
                match tick {
                    Some(tick) => worker.ingest(&tick),
                    None => {
                        info!(worker = id, "tick channel closed — draining");
                        worker.drain().await;
                        return;
                    }
                }
            }
            _ = scan.tick() => {
                worker.scan_and_flush(Utc::now().timestamp_millis()).await;
            }
            _ = shutdown.changed() => {
                info!(worker = id, "shutdown — draining completed buckets");
                worker.drain().await;
                return;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SlowPolicy;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 6).unwrap()
    }

    fn test_ctx() -> Arc<AggregationContext> {
        Arc::new(AggregationContext {
            store: Arc::new(OptionStore::open_in_memory().unwrap()),
            cache: Arc::new(CacheTier::disabled()),
            hub: Arc::new(BroadcastHub::new(16, SlowPolicy::DropSubscriber)),
            tracker: Arc::new(UnderlyingTracker::new()),
            counters: Arc::new(HealthCounters::new()),
            grace_ms: 15_000,
            strike_gaps: HashMap::from([("NIFTY".to_string(), 50.0)]),
        })
    }

    fn tick(side: OptionSide, strike: f64, iv: Option<f64>, ts: i64, volume: f64) -> OptionTick {
        OptionTick {
            symbol: "NIFTY".into(),
            expiry: expiry(),
            strike,
            option_side: side,
            last_price: 180.0,
            volume,
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
    fn sharding_is_stable_and_in_range(){
        let a = shard_for("NIFTY", expiry(), 25_000.0, 8);
        let b = shard_for("NIFTY", expiry(), 25_000.0, 8);
        assert_eq!(a, b);
        assert!(a < 8);
        // Both sides of a strike land on the same shard by construction
        // (side is not part of the hash input).
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        assert_eq!(retry_backoff_ms(1), 1_000);
        assert_eq!(retry_backoff_ms(2), 2_000);
        assert_eq!(retry_backoff_ms(3), 4_000);
        assert_eq!(retry_backoff_ms(30), 60_000);
    }

    #[tokio::test]
    async fn mock_ticks_never_reach_the_store() {
        let ctx = test_ctx();
        let mut worker = AggregationWorker::new(0, ctx.clone());

        let mut mock = tick(OptionSide::Call, 25_000.0, Some(0.2), 60_500, 100.0);
        mock.is_mock = true;
        worker.ingest(&mock);
        assert_eq!(worker.bucket_count(), 0);

        worker.ingest(&tick(OptionSide::Call, 25_000.0, Some(0.2), 60_500, 100.0));
        assert_eq!(worker.bucket_count(), 1);

        // Flush far past close+grace.
        worker.scan_and_flush(10_000_000).await;
        let rows = ctx
            .store
            .fetch_latest_strikes("NIFTY", Timeframe::Min1, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        // Only the real tick contributed.
        assert_eq!(rows[0].call_count, 1);
        assert_eq!(ctx.counters.mock_dropped_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bucket_flushes_after_grace_with_weighted_averages() {
        let ctx = test_ctx();
        let mut worker = AggregationWorker::new(0, ctx.clone());

        // Three CE ticks inside [60s, 120s).
        worker.ingest(&tick(OptionSide::Call, 25_000.0, Some(0.20), 60_100, 0.0));
        worker.ingest(&tick(OptionSide::Call, 25_000.0, Some(0.22), 60_200, 0.0));
        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 60_300, 0.0));

        // Not yet due inside the grace window.
        worker.scan_and_flush(120_000 + 5_000).await;
        assert_eq!(worker.bucket_count(), 1);

        // Due once close + grace has elapsed.
        worker.scan_and_flush(120_000 + 16_000).await;
        assert_eq!(worker.bucket_count(), 0);

        let rows = ctx
            .store
            .fetch_latest_strikes("NIFTY", Timeframe::Min1, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call_count, 3);
        assert!((rows[0].call_iv_avg.unwrap() - 0.21).abs() < 1e-12);
        assert_eq!(ctx.counters.buckets_flushed_total.load(Ordering::Relaxed), 1);

        // Expiry metrics were written for the bucket as well.
        let metrics = ctx
            .store
            .fetch_latest_expiry_metrics("NIFTY", Timeframe::Min1, &[expiry()])
            .unwrap();
        assert_eq!(metrics.len(), 1);
    }

    #[tokio::test]
    async fn newer_bucket_supersedes_older_one() {
        let ctx = test_ctx();
        let mut worker = AggregationWorker::new(0, ctx.clone());

        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 60_100, 0.0));
        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 120_100, 0.0));
        assert_eq!(worker.bucket_count(), 2);

        // Well before close+grace of either bucket, the older one is still
        // flushed because a newer one is accumulating.
        worker.scan_and_flush(120_200).await;
        assert_eq!(worker.bucket_count(), 1);
    }

    #[tokio::test]
    async fn cumulative_volume_becomes_per_bucket_delta() {
        let ctx = test_ctx();
        let mut worker = AggregationWorker::new(0, ctx.clone());

        // Baseline sighting contributes nothing; the next two add deltas.
        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 60_100, 1_000.0));
        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 60_200, 1_250.0));
        worker.ingest(&tick(OptionSide::Call, 25_000.0, None, 60_300, 1_400.0));

        worker.scan_and_flush(10_000_000).await;
        let rows = ctx
            .store
            .fetch_latest_strikes("NIFTY", Timeframe::Min1, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows[0].call_volume, 400.0);
    }

    #[tokio::test]
    async fn underlying_close_captured_from_tracker() {
        let ctx = test_ctx();
        ctx.tracker.update(&crate::market_data::tick::UnderlyingBar {
            symbol: "NIFTY".into(),
            open: 24_650.0,
            high: 24_650.0,
            low: 24_650.0,
            close: 24_650.0,
            volume: 0.0,
            ts: 60_000,
            is_mock: false,
        });
        let mut worker = AggregationWorker::new(0, ctx.clone());
        worker.ingest(&tick(OptionSide::Call, 24_700.0, None, 60_100, 0.0));
        worker.scan_and_flush(10_000_000).await;

        let rows = ctx
            .store
            .fetch_latest_strikes("NIFTY", Timeframe::Min1, &[expiry()], None, None)
            .unwrap();
        assert_eq!(rows[0].underlying_close, Some(24_650.0));
        assert_eq!(rows[0].moneyness_bucket.as_deref(), Some("OTM1"));
    }
}
