// =============================================================================
// Meridian F&O Engine — Main Entry Point
// =============================================================================
//
// Real-time option-chain aggregation pipeline: consumes option ticks,
// underlying bars, and subscription events from the ticker bus, rolls them
// into per-strike buckets with derived expiry metrics, persists through the
// time-series store, and fans flushed buckets out to API and WebSocket
// consumers. Subscription events trigger bounded historical backfill.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregation;
mod api;
mod app_state;
mod backfill;
mod cache;
mod errors;
mod hub;
mod market_data;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregation::engine::{run_aggregation_worker, AggregationContext};
use crate::aggregation::rollup::run_rollup_scheduler;
use crate::app_state::{AppState, HealthCounters};
use crate::backfill::{BackfillEngine, HistoryClient};
use crate::cache::CacheTier;
use crate::hub::BroadcastHub;
use crate::market_data::consumer::{
    run_events_dispatcher, run_options_dispatcher, run_underlying_dispatcher, BusConsumer,
};
use crate::market_data::underlying::UnderlyingTracker;
use crate::runtime_config::RuntimeConfig;
use crate::store::OptionStore;

/// Startup budget for reaching the store before giving up.
const STORE_STARTUP_DEADLINE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian F&O Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "runtime_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for containerised deployments.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(url) = std::env::var("MERIDIAN_BUS_URL") {
        config.bus_url = url;
    }
    if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("MERIDIAN_DB_PATH") {
        config.db_path = path;
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis_url = Some(url);
    }

    info!(
        symbols = ?config.symbols,
        aggregators = config.pool.aggregators,
        bus = %config.bus_url,
        "configuration resolved"
    );

    // ── 2. Shutdown signal ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 3. Store (bounded startup retry) ─────────────────────────────────
    let store = open_store_with_deadline(&config.db_path).await?;
    info!(path = %config.db_path, "time-series store ready");

    // ── 4. Shared subsystems ─────────────────────────────────────────────
    let counters = Arc::new(HealthCounters::new());
    let tracker = Arc::new(UnderlyingTracker::new());
    let cache = Arc::new(
        CacheTier::connect(
            config.redis_url.as_deref(),
            config.l1.max_entries,
            config.l1.max_bytes,
            counters.clone(),
        )
        .await,
    );
    let hub = Arc::new(BroadcastHub::new(
        config.buffers.subscriber,
        config.slow_consumer_policy.into(),
    ));

    // ── 5. Aggregation workers (sharded, one writer per bucket) ──────────
    let agg_ctx = Arc::new(AggregationContext {
        store: store.clone(),
        cache: cache.clone(),
        hub: hub.clone(),
        tracker: tracker.clone(),
        counters: counters.clone(),
        grace_ms: config.grace_ms as i64,
        strike_gaps: config.strike_gap.clone(),
    });
    let aggregators = config.pool.aggregators.max(1);
    let mut shard_txs = Vec::with_capacity(aggregators);
    for id in 0..aggregators {
        let (tx, rx) = mpsc::channel(1_024);
        shard_txs.push(tx);
        tokio::spawn(run_aggregation_worker(
            id,
            rx,
            agg_ctx.clone(),
            shutdown_rx.clone(),
        ));
    }
    info!(workers = aggregators, "aggregation workers launched");

    // ── 6. Rollup scheduler (5min/15min from the 1min base) ──────────────
    tokio::spawn(run_rollup_scheduler(
        store.clone(),
        config.strike_gap.clone(),
        counters.clone(),
        shutdown_rx.clone(),
    ));

    // ── 7. Backfill engine ───────────────────────────────────────────────
    let history_api_key = std::env::var("MERIDIAN_HISTORY_API_KEY").unwrap_or_default();
    let history_secret = std::env::var("MERIDIAN_HISTORY_SECRET").unwrap_or_default();
    let history_client = Arc::new(HistoryClient::new(
        config.history_base_url.clone(),
        history_api_key,
        history_secret,
        Duration::from_millis(config.timeouts.history_ms),
    ));
    let backfill = Arc::new(BackfillEngine::new(
        history_client,
        store.clone(),
        counters.clone(),
        config.pool.backfillers,
        config.backfill_window_hours,
        config.backfill_gap_threshold_sec,
        config.backfill_cadence_sec,
    ));
    let (backfill_tx, backfill_rx) = mpsc::channel(256);
    tokio::spawn(backfill.clone().run_dispatcher(backfill_rx, shutdown_rx.clone()));
    tokio::spawn(backfill.clone().run_scheduler(shutdown_rx.clone()));

    // ── 8. Bus consumer + channel dispatchers ────────────────────────────
    let consumer = Arc::new(BusConsumer::new(
        config.bus_url.clone(),
        config.channel("options"),
        config.channel("underlying"),
        config.channel("events"),
        config.buffers.channel,
        counters.clone(),
    ));
    tokio::spawn(consumer.clone().run(shutdown_rx.clone()));
    tokio::spawn(run_options_dispatcher(
        consumer.options_buf.clone(),
        shard_txs,
        counters.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_underlying_dispatcher(
        consumer.underlying_buf.clone(),
        tracker.clone(),
        store.clone(),
        counters.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_events_dispatcher(
        consumer.events_buf.clone(),
        backfill_tx,
        hub.clone(),
        config.enable_subscription_events,
        counters.clone(),
        shutdown_rx.clone(),
    ));
    info!("bus consumer and dispatchers launched");

    // ── 9. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(
        config,
        store,
        cache,
        hub,
        tracker,
        counters,
    ));
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    let mut server_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    // Give consumers time to stop, aggregators to flush completed buckets,
    // and in-flight writes to land.
    tokio::time::sleep(Duration::from_secs(5)).await;

    info!("Meridian F&O Engine shut down complete.");
    Ok(())
}

/// Open the store, retrying for up to the startup deadline. An unreachable
/// store past the deadline is the one unrecoverable initialisation error.
async fn open_store_with_deadline(path: &str) -> anyhow::Result<Arc<OptionStore>> {
    let started = std::time::Instant::now();
    loop {
        match OptionStore::open(path) {
            Ok(store) => return Ok(Arc::new(store)),
            Err(e) if started.elapsed() < STORE_STARTUP_DEADLINE => {
                warn!(error = %e, "store open failed — retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                anyhow::bail!("store unreachable after {STORE_STARTUP_DEADLINE:?}: {e}");
            }
        }
    }
}
