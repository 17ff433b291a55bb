// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian F&O engine.  Every tunable
// parameter lives here so the service can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "NIFTY".to_string(),
        "BANKNIFTY".to_string(),
        "FINNIFTY".to_string(),
    ]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::Min1, Timeframe::Min5, Timeframe::Min15]
}

fn default_strike_gap() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("NIFTY".to_string(), 50.0);
    m.insert("BANKNIFTY".to_string(), 100.0);
    m.insert("FINNIFTY".to_string(), 50.0);
    m.insert("SENSEX".to_string(), 100.0);
    m
}

fn default_grace_ms() -> u64 {
    15_000
}

fn default_backfill_window_hours() -> u32 {
    2
}

fn default_backfill_gap_threshold_sec() -> u64 {
    120
}

fn default_backfill_cadence_sec() -> u64 {
    300
}

fn default_ttl_latest() -> u64 {
    5
}

fn default_ttl_series_recent() -> u64 {
    5
}

fn default_ttl_series_historical() -> u64 {
    60
}

fn default_ttl_static() -> u64 {
    60
}

fn default_pool_consumers() -> usize {
    1
}

fn default_pool_aggregators() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().max(4))
        .unwrap_or(4)
}

fn default_pool_backfillers() -> usize {
    4
}

fn default_buffer_channel() -> usize {
    10_000
}

fn default_buffer_subscriber() -> usize {
    256
}

fn default_timeout_read_ms() -> u64 {
    5_000
}

fn default_timeout_write_ms() -> u64 {
    10_000
}

fn default_timeout_history_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_bus_url() -> String {
    "ws://127.0.0.1:6380/bus".to_string()
}

fn default_channel_prefix() -> String {
    "ticker".to_string()
}

fn default_channel_scope() -> String {
    "fo".to_string()
}

fn default_db_path() -> String {
    "meridian_fo.db".to_string()
}

fn default_history_base_url() -> String {
    "https://history.ticker.local".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3002".to_string()
}

fn default_l1_max_entries() -> usize {
    10_000
}

fn default_l1_max_bytes() -> usize {
    64 * 1024 * 1024
}

// =============================================================================
// Nested config sections
// =============================================================================

/// Cache TTLs in seconds for each read-path kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_ttl_latest")]
    pub latest: u64,
    #[serde(default = "default_ttl_series_recent")]
    pub series_recent: u64,
    #[serde(default = "default_ttl_series_historical")]
    pub series_historical: u64,
    #[serde(default = "default_ttl_static", rename = "static")]
    pub static_lookup: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            latest: default_ttl_latest(),
            series_recent: default_ttl_series_recent(),
            series_historical: default_ttl_series_historical(),
            static_lookup: default_ttl_static(),
        }
    }
}

/// Worker-pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_consumers")]
    pub consumers: usize,
    #[serde(default = "default_pool_aggregators")]
    pub aggregators: usize,
    #[serde(default = "default_pool_backfillers")]
    pub backfillers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            consumers: default_pool_consumers(),
            aggregators: default_pool_aggregators(),
            backfillers: default_pool_backfillers(),
        }
    }
}

/// Bounded buffer lengths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Per-channel inbound message buffer on the bus consumer.
    #[serde(default = "default_buffer_channel")]
    pub channel: usize,
    /// Per-subscriber queue depth on the broadcast hub.
    #[serde(default = "default_buffer_subscriber")]
    pub subscriber: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            channel: default_buffer_channel(),
            subscriber: default_buffer_subscriber(),
        }
    }
}

/// Per-call I/O timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_read_ms")]
    pub read_ms: u64,
    #[serde(default = "default_timeout_write_ms")]
    pub write_ms: u64,
    #[serde(default = "default_timeout_history_ms")]
    pub history_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_ms: default_timeout_read_ms(),
            write_ms: default_timeout_write_ms(),
            history_ms: default_timeout_history_ms(),
        }
    }
}

/// In-process cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1Config {
    #[serde(default = "default_l1_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_l1_max_bytes")]
    pub max_bytes: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: default_l1_max_entries(),
            max_bytes: default_l1_max_bytes(),
        }
    }
}

/// What to do with a subscriber whose queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Close the subscriber's handle (default).
    DropSubscriber,
    /// Evict the subscriber's oldest queued message.
    DropOldest,
}

impl Default for SlowConsumerPolicy {
    fn default() -> Self {
        Self::DropSubscriber
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instruments ---------------------------------------------------------
    /// Underlying index symbols the pipeline aggregates.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Timeframes materialised in the store. 1min is the live base; the rest
    /// are rolled up from it.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// Per-symbol strike step used for moneyness classification.
    #[serde(default = "default_strike_gap")]
    pub strike_gap: HashMap<String, f64>,

    // --- Aggregation ---------------------------------------------------------
    /// Late-tick tolerance after bucket close before flush.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    // --- Backfill ------------------------------------------------------------
    /// Window fetched on a subscription_created event.
    #[serde(default = "default_backfill_window_hours")]
    pub backfill_window_hours: u32,

    /// Gap size that triggers a scheduled backfill.
    #[serde(default = "default_backfill_gap_threshold_sec")]
    pub backfill_gap_threshold_sec: u64,

    /// Cadence of the scheduled gap scan.
    #[serde(default = "default_backfill_cadence_sec")]
    pub backfill_cadence_sec: u64,

    // --- Cache ---------------------------------------------------------------
    #[serde(default)]
    pub cache_ttl: CacheTtlConfig,

    #[serde(default)]
    pub l1: L1Config,

    /// Distributed L2 cache endpoint; L2 is disabled when absent.
    #[serde(default)]
    pub redis_url: Option<String>,

    // --- Pools, buffers, timeouts -------------------------------------------
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub buffers: BufferConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    // --- Fan-out -------------------------------------------------------------
    #[serde(default)]
    pub slow_consumer_policy: SlowConsumerPolicy,

    // --- Subscription lifecycle ---------------------------------------------
    /// Listen for subscription events and trigger immediate backfill.
    #[serde(default = "default_true")]
    pub enable_subscription_events: bool,

    // --- Endpoints -----------------------------------------------------------
    /// WebSocket URL of the ticker pub/sub bus.
    #[serde(default = "default_bus_url")]
    pub bus_url: String,

    /// Channel namespace prefix; channels are `{prefix}:{scope}:{channel}`.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    #[serde(default = "default_channel_scope")]
    pub channel_scope: String,

    /// Path of the embedded time-series store.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Base URL of the upstream history API.
    #[serde(default = "default_history_base_url")]
    pub history_base_url: String,

    /// REST/WS bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            strike_gap: default_strike_gap(),
            grace_ms: default_grace_ms(),
            backfill_window_hours: default_backfill_window_hours(),
            backfill_gap_threshold_sec: default_backfill_gap_threshold_sec(),
            backfill_cadence_sec: default_backfill_cadence_sec(),
            cache_ttl: CacheTtlConfig::default(),
            l1: L1Config::default(),
            redis_url: None,
            pool: PoolConfig::default(),
            buffers: BufferConfig::default(),
            timeouts: TimeoutConfig::default(),
            slow_consumer_policy: SlowConsumerPolicy::default(),
            enable_subscription_events: true,
            bus_url: default_bus_url(),
            channel_prefix: default_channel_prefix(),
            channel_scope: default_channel_scope(),
            db_path: default_db_path(),
            history_base_url: default_history_base_url(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Strike step for `symbol`, falling back to 50 for unlisted indices.
    pub fn strike_gap_for(&self, symbol: &str) -> f64 {
        self.strike_gap.get(symbol).copied().unwrap_or(50.0)
    }

    /// Fully-qualified channel name, e.g. `ticker:fo:options`.
    pub fn channel(&self, name: &str) -> String {
        format!("{}:{}:{}", self.channel_prefix, self.channel_scope, name)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            aggregators = config.pool.aggregators,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["NIFTY", "BANKNIFTY", "FINNIFTY"]);
        assert_eq!(cfg.timeframes.len(), 3);
        assert_eq!(cfg.grace_ms, 15_000);
        assert_eq!(cfg.backfill_window_hours, 2);
        assert_eq!(cfg.backfill_gap_threshold_sec, 120);
        assert_eq!(cfg.cache_ttl.latest, 5);
        assert_eq!(cfg.cache_ttl.series_historical, 60);
        assert_eq!(cfg.buffers.channel, 10_000);
        assert_eq!(cfg.buffers.subscriber, 256);
        assert_eq!(cfg.pool.backfillers, 4);
        assert!(cfg.pool.aggregators >= 4);
        assert_eq!(cfg.slow_consumer_policy, SlowConsumerPolicy::DropSubscriber);
        assert!(cfg.enable_subscription_events);
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn strike_gap_lookup_with_fallback() {
        let cfg = RuntimeConfig::default();
        assert!((cfg.strike_gap_for("NIFTY") - 50.0).abs() < f64::EPSILON);
        assert!((cfg.strike_gap_for("BANKNIFTY") - 100.0).abs() < f64::EPSILON);
        assert!((cfg.strike_gap_for("MIDCPNIFTY") - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn channel_names_are_namespaced() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.channel("options"), "ticker:fo:options");
        assert_eq!(cfg.channel("events"), "ticker:fo:events");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 3);
        assert_eq!(cfg.grace_ms, 15_000);
        assert_eq!(cfg.timeouts.history_ms, 30_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["NIFTY"],
            "slow_consumer_policy": "drop_oldest",
            "cache_ttl": { "latest": 2 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["NIFTY"]);
        assert_eq!(cfg.slow_consumer_policy, SlowConsumerPolicy::DropOldest);
        assert_eq!(cfg.cache_ttl.latest, 2);
        assert_eq!(cfg.cache_ttl.series_historical, 60);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.grace_ms, cfg2.grace_ms);
        assert_eq!(cfg.slow_consumer_policy, cfg2.slow_consumer_policy);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["NIFTY".to_string()];
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["NIFTY"]);
    }
}
