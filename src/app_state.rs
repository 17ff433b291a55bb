// =============================================================================
// Central Application State — Meridian F&O Engine
// =============================================================================
//
// Ties the subsystems together for the composition root and the API layer.
// Components receive their dependencies explicitly at construction; AppState
// exists so the query surface and health endpoint can reach them, not as a
// process-wide singleton.
//
// Thread safety:
//   - Atomic counters for lock-free health tracking.
//   - parking_lot::RwLock around the runtime config.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::CacheTier;
use crate::hub::BroadcastHub;
use crate::market_data::underlying::UnderlyingTracker;
use crate::runtime_config::RuntimeConfig;
use crate::store::OptionStore;

// =============================================================================
// Health counters
// =============================================================================

/// Per-component operational counters. The ingestion path has no user
/// surface; this is where its state shows up.
#[derive(Default)]
pub struct HealthCounters {
    // -- Bus / consumer -------------------------------------------------------
    pub bus_messages_total: AtomicU64,
    pub decode_errors_total: AtomicU64,
    pub validation_errors_total: AtomicU64,
    pub mock_dropped_total: AtomicU64,
    pub channel_dropped_total: AtomicU64,
    pub ticks_ingested_total: AtomicU64,
    pub events_total: AtomicU64,

    // -- Aggregation / flush --------------------------------------------------
    pub buckets_flushed_total: AtomicU64,
    pub flush_retries_total: AtomicU64,
    pub buckets_abandoned_total: AtomicU64,
    pub rollup_runs_total: AtomicU64,

    // -- Store ----------------------------------------------------------------
    pub store_writes_total: AtomicU64,
    pub store_errors_total: AtomicU64,

    // -- Cache ----------------------------------------------------------------
    pub cache_hits_total: AtomicU64,
    pub cache_misses_total: AtomicU64,
    pub cache_errors_total: AtomicU64,

    // -- Backfill -------------------------------------------------------------
    pub backfill_runs_total: AtomicU64,
    pub backfill_errors_total: AtomicU64,
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthCountersSnapshot {
        HealthCountersSnapshot {
            bus_messages_total: self.bus_messages_total.load(Ordering::Relaxed),
            decode_errors_total: self.decode_errors_total.load(Ordering::Relaxed),
            validation_errors_total: self.validation_errors_total.load(Ordering::Relaxed),
            mock_dropped_total: self.mock_dropped_total.load(Ordering::Relaxed),
            channel_dropped_total: self.channel_dropped_total.load(Ordering::Relaxed),
            ticks_ingested_total: self.ticks_ingested_total.load(Ordering::Relaxed),
            events_total: self.events_total.load(Ordering::Relaxed),
            buckets_flushed_total: self.buckets_flushed_total.load(Ordering::Relaxed),
            flush_retries_total: self.flush_retries_total.load(Ordering::Relaxed),
            buckets_abandoned_total: self.buckets_abandoned_total.load(Ordering::Relaxed),
            rollup_runs_total: self.rollup_runs_total.load(Ordering::Relaxed),
            store_writes_total: self.store_writes_total.load(Ordering::Relaxed),
            store_errors_total: self.store_errors_total.load(Ordering::Relaxed),
            cache_hits_total: self.cache_hits_total.load(Ordering::Relaxed),
            cache_misses_total: self.cache_misses_total.load(Ordering::Relaxed),
            cache_errors_total: self.cache_errors_total.load(Ordering::Relaxed),
            backfill_runs_total: self.backfill_runs_total.load(Ordering::Relaxed),
            backfill_errors_total: self.backfill_errors_total.load(Ordering::Relaxed),
        }
    }
}

/// Serialisable view of the counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCountersSnapshot {
    pub bus_messages_total: u64,
    pub decode_errors_total: u64,
    pub validation_errors_total: u64,
    pub mock_dropped_total: u64,
    pub channel_dropped_total: u64,
    pub ticks_ingested_total: u64,
    pub events_total: u64,
    pub buckets_flushed_total: u64,
    pub flush_retries_total: u64,
    pub buckets_abandoned_total: u64,
    pub rollup_runs_total: u64,
    pub store_writes_total: u64,
    pub store_errors_total: u64,
    pub cache_hits_total: u64,
    pub cache_misses_total: u64,
    pub cache_errors_total: u64,
    pub backfill_runs_total: u64,
    pub backfill_errors_total: u64,
}

// =============================================================================
// AppState
// =============================================================================

/// Shared state for the API layer, held behind `Arc`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub store: Arc<OptionStore>,
    pub cache: Arc<CacheTier>,
    pub hub: Arc<BroadcastHub>,
    pub tracker: Arc<UnderlyingTracker>,
    pub counters: Arc<HealthCounters>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<OptionStore>,
        cache: Arc<CacheTier>,
        hub: Arc<BroadcastHub>,
        tracker: Arc<UnderlyingTracker>,
        counters: Arc<HealthCounters>,
    ) -> Self {
        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            cache,
            hub,
            tracker,
            counters,
            start_time: std::time::Instant::now(),
        }
    }

    /// Health payload: liveness plus the per-component counters.
    pub fn build_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: chrono::Utc::now().timestamp_millis(),
            hub_subscribers: self.hub.subscriber_count(),
            broadcast_dropped_total: self.hub.broadcast_dropped_total(),
            subscribers_dropped_total: self.hub.subscribers_dropped_total(),
            counters: self.counters.snapshot(),
        }
    }
}

/// Health endpoint payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub server_time: i64,
    pub hub_subscribers: usize,
    pub broadcast_dropped_total: u64,
    pub subscribers_dropped_total: u64,
    pub counters: HealthCountersSnapshot,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::SlowPolicy;

    fn state() -> AppState {
        AppState::new(
            RuntimeConfig::default(),
            Arc::new(OptionStore::open_in_memory().unwrap()),
            Arc::new(CacheTier::disabled()),
            Arc::new(BroadcastHub::new(16, SlowPolicy::DropSubscriber)),
            Arc::new(UnderlyingTracker::new()),
            Arc::new(HealthCounters::new()),
        )
    }

    #[test]
    fn health_snapshot_reflects_counters() {
        let s = state();
        s.counters.ticks_ingested_total.fetch_add(7, Ordering::Relaxed);
        s.counters.cache_hits_total.fetch_add(3, Ordering::Relaxed);

        let health = s.build_health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.counters.ticks_ingested_total, 7);
        assert_eq!(health.counters.cache_hits_total, 3);
        assert_eq!(health.hub_subscribers, 0);
    }

    #[test]
    fn health_snapshot_serialises() {
        let json = serde_json::to_value(state().build_health()).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["counters"]["buckets_flushed_total"].is_u64());
    }
}
