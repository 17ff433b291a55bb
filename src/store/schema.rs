// =============================================================================
// Time-series schema — strike bars, expiry metrics, underlying/future bars
// =============================================================================
//
// One strike-bar table and one expiry-metrics table per aggregated timeframe.
// OI columns are materialised natively in every timeframe so read paths never
// JOIN the 1-minute base; 5min/15min rows are maintained by the rollup
// scheduler through the same upsert path as live aggregation.
//
// WAL mode keeps reads concurrent with the aggregation writers. Retention and
// compression are operational concerns handled outside the service.

use rusqlite::Connection;

use crate::errors::StoreError;
use crate::types::Timeframe;

/// Pragmas applied once per connection.
const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
"#;

/// Strike-bar DDL for one timeframe table.
fn strike_bars_ddl(tf: Timeframe) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    bucket_time INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    symbol TEXT NOT NULL,
    expiry TEXT NOT NULL,
    strike REAL NOT NULL,
    underlying_close REAL,
    call_iv_avg REAL, put_iv_avg REAL,
    call_delta_avg REAL, put_delta_avg REAL,
    call_gamma_avg REAL, put_gamma_avg REAL,
    call_theta_avg REAL, put_theta_avg REAL,
    call_vega_avg REAL, put_vega_avg REAL,
    call_volume REAL NOT NULL DEFAULT 0,
    put_volume REAL NOT NULL DEFAULT 0,
    call_count INTEGER NOT NULL DEFAULT 0,
    put_count INTEGER NOT NULL DEFAULT 0,
    call_oi_sum REAL,
    put_oi_sum REAL,
    moneyness_bucket TEXT,
    liquidity_score_avg REAL,
    liquidity_score_min REAL,
    liquidity_tier TEXT,
    spread_abs_avg REAL,
    spread_pct_avg REAL,
    spread_pct_max REAL,
    depth_imbalance_pct_avg REAL,
    book_pressure_avg REAL,
    total_bid_qty_avg REAL,
    total_ask_qty_avg REAL,
    is_illiquid INTEGER,
    illiquid_tick_count INTEGER NOT NULL DEFAULT 0,
    total_tick_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, expiry, timeframe, bucket_time, strike)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_{table}_latest
    ON {table} (symbol, timeframe, expiry, bucket_time DESC);

CREATE INDEX IF NOT EXISTS idx_{table}_updated
    ON {table} (updated_at);
"#,
        table = strike_bars_table(tf)
    )
}

/// Expiry-metrics DDL for one timeframe table.
fn expiry_metrics_ddl(tf: Timeframe) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    bucket_time INTEGER NOT NULL,
    timeframe TEXT NOT NULL,
    symbol TEXT NOT NULL,
    expiry TEXT NOT NULL,
    total_call_volume REAL NOT NULL DEFAULT 0,
    total_put_volume REAL NOT NULL DEFAULT 0,
    pcr REAL,
    max_pain_strike REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, expiry, timeframe, bucket_time)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_{table}_latest
    ON {table} (symbol, timeframe, expiry, bucket_time DESC);
"#,
        table = expiry_metrics_table(tf)
    )
}

/// Underlying and futures minute-bar tables (backfill targets).
const ANCILLARY_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS fo_underlying_bars_1min (
    symbol TEXT NOT NULL,
    bucket_time INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, bucket_time)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS fo_future_bars_1min (
    symbol TEXT NOT NULL,
    expiry TEXT NOT NULL,
    bucket_time INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL DEFAULT 0,
    oi REAL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (symbol, expiry, bucket_time)
) WITHOUT ROWID;
"#;

/// Table name for the strike bars of a timeframe.
pub fn strike_bars_table(tf: Timeframe) -> String {
    format!("fo_option_strike_bars_{}", tf.as_str())
}

/// Table name for the expiry metrics of a timeframe.
pub fn expiry_metrics_table(tf: Timeframe) -> String {
    format!("fo_expiry_metrics_{}", tf.as_str())
}

/// Apply pragmas and create every table and index.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(PRAGMA_SQL)?;
    for tf in Timeframe::all() {
        conn.execute_batch(&strike_bars_ddl(tf))?;
        conn.execute_batch(&expiry_metrics_ddl(tf))?;
    }
    conn.execute_batch(ANCILLARY_DDL)?;
    Ok(())
}
