// =============================================================================
// Time-Series Store Adapter — typed upsert/select over the bar tables
// =============================================================================
//
// Narrow surface over embedded SQLite (WAL). All statements are parameterized;
// the only dynamic SQL fragments are table names and aggregation expressions,
// both derived from closed enums. Reads hit the per-timeframe tables directly
// and never JOIN the 1-minute base.
//
// Write semantics: bulk idempotent upsert keyed by the bar primary key;
// conflicting rows are overwritten column-for-column with `updated_at = now`
// while `created_at` keeps its first value. Transient failures (locked/busy)
// are retried with bounded exponential backoff before surfacing
// `StoreError::Unavailable`; schema/constraint failures surface
// `StoreError::Rejected` immediately.
// =============================================================================

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::market_data::tick::UnderlyingBar;
use crate::store::rows::{
    ExpiryMetricsRow, FutureBarRow, LiquiditySummary, SeriesPoint, StrikeBarRow,
};
use crate::store::schema::{expiry_metrics_table, init_schema, strike_bars_table};
use crate::types::{format_expiry, parse_expiry, Indicator, OptionSide, StrikeRange, Timeframe};

/// Backoff schedule for transient write failures (3 attempts total,
/// 400 ms then 1.6 s). This bounds only the synchronous in-call retry inside
/// a single `upsert_*`; once it is exhausted the error surfaces to the
/// flusher, whose own slower retry loop (`aggregation::engine`, 1 s doubling
/// to a 60 s cap) keeps the bucket in memory between attempts.
const RETRY_DELAYS_MS: [u64; 2] = [400, 1_600];

/// Bound on concurrent in-flight write batches.
const MAX_INFLIGHT_WRITES: usize = 32;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The C1 adapter. Cheap to share via `Arc`.
pub struct OptionStore {
    conn: Mutex<Connection>,
    write_sem: Semaphore,
}

impl OptionStore {
    /// Open (or create) the store at `path` and initialise the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(StoreError::from)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            write_sem: Semaphore::new(MAX_INFLIGHT_WRITES),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::from)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            write_sem: Semaphore::new(MAX_INFLIGHT_WRITES),
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Bulk idempotent upsert of strike bars.
    pub async fn upsert_strike_bars(&self, bars: &[StrikeBarRow]) -> Result<(), StoreError> {
        if bars.is_empty() {
            return Ok(());
        }
        let _permit = self.write_sem.acquire().await.expect("semaphore closed");
        self.with_write_retries(|| self.upsert_strike_bars_once(bars))
            .await
    }

    fn upsert_strike_bars_once(&self, bars: &[StrikeBarRow]) -> Result<(), StoreError> {
        let now = now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        {
            for bar in bars {
                let sql = format!(
                    r#"INSERT INTO {table} (
                        bucket_time, timeframe, symbol, expiry, strike, underlying_close,
                        call_iv_avg, put_iv_avg, call_delta_avg, put_delta_avg,
                        call_gamma_avg, put_gamma_avg, call_theta_avg, put_theta_avg,
                        call_vega_avg, put_vega_avg,
                        call_volume, put_volume, call_count, put_count,
                        call_oi_sum, put_oi_sum, moneyness_bucket,
                        liquidity_score_avg, liquidity_score_min, liquidity_tier,
                        spread_abs_avg, spread_pct_avg, spread_pct_max,
                        depth_imbalance_pct_avg, book_pressure_avg,
                        total_bid_qty_avg, total_ask_qty_avg,
                        is_illiquid, illiquid_tick_count, total_tick_count,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                              ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                              ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35,
                              ?36, ?37, ?38)
                    ON CONFLICT (symbol, expiry, timeframe, bucket_time, strike) DO UPDATE SET
                        underlying_close = excluded.underlying_close,
                        call_iv_avg = excluded.call_iv_avg,
                        put_iv_avg = excluded.put_iv_avg,
                        call_delta_avg = excluded.call_delta_avg,
                        put_delta_avg = excluded.put_delta_avg,
                        call_gamma_avg = excluded.call_gamma_avg,
                        put_gamma_avg = excluded.put_gamma_avg,
                        call_theta_avg = excluded.call_theta_avg,
                        put_theta_avg = excluded.put_theta_avg,
                        call_vega_avg = excluded.call_vega_avg,
                        put_vega_avg = excluded.put_vega_avg,
                        call_volume = excluded.call_volume,
                        put_volume = excluded.put_volume,
                        call_count = excluded.call_count,
                        put_count = excluded.put_count,
                        call_oi_sum = excluded.call_oi_sum,
                        put_oi_sum = excluded.put_oi_sum,
                        moneyness_bucket = excluded.moneyness_bucket,
                        liquidity_score_avg = excluded.liquidity_score_avg,
                        liquidity_score_min = excluded.liquidity_score_min,
                        liquidity_tier = excluded.liquidity_tier,
                        spread_abs_avg = excluded.spread_abs_avg,
                        spread_pct_avg = excluded.spread_pct_avg,
                        spread_pct_max = excluded.spread_pct_max,
                        depth_imbalance_pct_avg = excluded.depth_imbalance_pct_avg,
                        book_pressure_avg = excluded.book_pressure_avg,
                        total_bid_qty_avg = excluded.total_bid_qty_avg,
                        total_ask_qty_avg = excluded.total_ask_qty_avg,
                        is_illiquid = excluded.is_illiquid,
                        illiquid_tick_count = excluded.illiquid_tick_count,
                        total_tick_count = excluded.total_tick_count,
                        updated_at = excluded.updated_at"#,
                    table = strike_bars_table(bar.timeframe)
                );
                let mut stmt = tx.prepare_cached(&sql).map_err(StoreError::from)?;
                let liq = bar.liquidity.as_ref();
                stmt.execute(params![
                    bar.bucket_time,
                    bar.timeframe.as_str(),
                    bar.symbol,
                    format_expiry(bar.expiry),
                    bar.strike,
                    bar.underlying_close,
                    bar.call_iv_avg,
                    bar.put_iv_avg,
                    bar.call_delta_avg,
                    bar.put_delta_avg,
                    bar.call_gamma_avg,
                    bar.put_gamma_avg,
                    bar.call_theta_avg,
                    bar.put_theta_avg,
                    bar.call_vega_avg,
                    bar.put_vega_avg,
                    bar.call_volume,
                    bar.put_volume,
                    bar.call_count as i64,
                    bar.put_count as i64,
                    bar.call_oi_sum,
                    bar.put_oi_sum,
                    bar.moneyness_bucket,
                    liq.map(|l| l.liquidity_score_avg),
                    liq.map(|l| l.liquidity_score_min),
                    liq.map(|l| l.liquidity_tier.clone()),
                    liq.map(|l| l.spread_abs_avg),
                    liq.map(|l| l.spread_pct_avg),
                    liq.map(|l| l.spread_pct_max),
                    liq.map(|l| l.depth_imbalance_pct_avg),
                    liq.map(|l| l.book_pressure_avg),
                    liq.map(|l| l.total_bid_qty_avg),
                    liq.map(|l| l.total_ask_qty_avg),
                    liq.map(|l| l.is_illiquid),
                    liq.map(|l| l.illiquid_tick_count as i64).unwrap_or(0),
                    liq.map(|l| l.total_tick_count as i64).unwrap_or(0),
                    now,
                    now,
                ])
                .map_err(StoreError::from)?;
            }
        }
        tx.commit().map_err(StoreError::from)?;
        debug!(rows = bars.len(), "strike bars upserted");
        Ok(())
    }

    /// Bulk idempotent upsert of expiry metrics.
    pub async fn upsert_expiry_metrics(
        &self,
        rows: &[ExpiryMetricsRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let _permit = self.write_sem.acquire().await.expect("semaphore closed");
        self.with_write_retries(|| self.upsert_expiry_metrics_once(rows))
            .await
    }

    fn upsert_expiry_metrics_once(&self, rows: &[ExpiryMetricsRow]) -> Result<(), StoreError> {
        let now = now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        {
            for row in rows {
                let sql = format!(
                    r#"INSERT INTO {table} (
                        bucket_time, timeframe, symbol, expiry,
                        total_call_volume, total_put_volume, pcr, max_pain_strike,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT (symbol, expiry, timeframe, bucket_time) DO UPDATE SET
                        total_call_volume = excluded.total_call_volume,
                        total_put_volume = excluded.total_put_volume,
                        pcr = excluded.pcr,
                        max_pain_strike = excluded.max_pain_strike,
                        updated_at = excluded.updated_at"#,
                    table = expiry_metrics_table(row.timeframe)
                );
                let mut stmt = tx.prepare_cached(&sql).map_err(StoreError::from)?;
                stmt.execute(params![
                    row.bucket_time,
                    row.timeframe.as_str(),
                    row.symbol,
                    format_expiry(row.expiry),
                    row.total_call_volume,
                    row.total_put_volume,
                    row.pcr,
                    row.max_pain_strike,
                    now,
                    now,
                ])
                .map_err(StoreError::from)?;
            }
        }
        tx.commit().map_err(StoreError::from)?;
        Ok(())
    }

    /// Upsert backfilled or live underlying minute bars.
    pub async fn upsert_underlying_bars(&self, bars: &[UnderlyingBar]) -> Result<(), StoreError> {
        if bars.is_empty() {
            return Ok(());
        }
        let _permit = self.write_sem.acquire().await.expect("semaphore closed");
        self.with_write_retries(|| {
            let now = now_ms();
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(StoreError::from)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        r#"INSERT INTO fo_underlying_bars_1min
                           (symbol, bucket_time, open, high, low, close, volume,
                            created_at, updated_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                           ON CONFLICT (symbol, bucket_time) DO UPDATE SET
                               open = excluded.open, high = excluded.high,
                               low = excluded.low, close = excluded.close,
                               volume = excluded.volume,
                               updated_at = excluded.updated_at"#,
                    )
                    .map_err(StoreError::from)?;
                for bar in bars {
                    let bucket = Timeframe::Min1.bucket_start(bar.ts);
                    stmt.execute(params![
                        bar.symbol, bucket, bar.open, bar.high, bar.low, bar.close,
                        bar.volume, now, now,
                    ])
                    .map_err(StoreError::from)?;
                }
            }
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    /// Upsert backfilled futures minute bars.
    pub async fn upsert_future_bars(&self, bars: &[FutureBarRow]) -> Result<(), StoreError> {
        if bars.is_empty() {
            return Ok(());
        }
        let _permit = self.write_sem.acquire().await.expect("semaphore closed");
        self.with_write_retries(|| {
            let now = now_ms();
            let mut conn = self.conn.lock();
            let tx = conn.transaction().map_err(StoreError::from)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        r#"INSERT INTO fo_future_bars_1min
                           (symbol, expiry, bucket_time, open, high, low, close, volume, oi,
                            created_at, updated_at)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                           ON CONFLICT (symbol, expiry, bucket_time) DO UPDATE SET
                               open = excluded.open, high = excluded.high,
                               low = excluded.low, close = excluded.close,
                               volume = excluded.volume, oi = excluded.oi,
                               updated_at = excluded.updated_at"#,
                    )
                    .map_err(StoreError::from)?;
                for bar in bars {
                    stmt.execute(params![
                        bar.symbol,
                        format_expiry(bar.expiry),
                        bar.bucket_time,
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.oi,
                        now,
                        now,
                    ])
                    .map_err(StoreError::from)?;
                }
            }
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
    }

    /// Retry transient failures with bounded exponential backoff.
    async fn with_write_retries<F>(&self, mut op: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Result<(), StoreError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < RETRY_DELAYS_MS.len() => {
                    let delay = RETRY_DELAYS_MS[attempt];
                    attempt += 1;
                    warn!(attempt, delay_ms = delay, error = %e, "transient store error — retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Latest-available strike rows per expiry (or rows at a specific bucket).
    pub fn fetch_latest_strikes(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        expiries: &[NaiveDate],
        strike_range: Option<StrikeRange>,
        at_bucket: Option<i64>,
    ) -> Result<Vec<StrikeBarRow>, StoreError> {
        let table = strike_bars_table(timeframe);
        let conn = self.conn.lock();
        let mut out = Vec::new();

        for expiry in expiries {
            let expiry_s = format_expiry(*expiry);
            let bucket = match at_bucket {
                Some(b) => Some(b),
                None => {
                    let sql = format!(
                        "SELECT MAX(bucket_time) FROM {table} \
                         WHERE symbol = ?1 AND expiry = ?2 AND timeframe = ?3"
                    );
                    let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
                    stmt.query_row(params![symbol, expiry_s, timeframe.as_str()], |r| {
                        r.get::<_, Option<i64>>(0)
                    })
                    .map_err(StoreError::from)?
                }
            };
            let Some(bucket) = bucket else {
                continue; // unknown expiry → empty, not an error
            };

            let (range_clause, low, high) = match strike_range {
                Some(r) => (" AND strike BETWEEN ?5 AND ?6", r.low, r.high),
                None => ("", f64::MIN, f64::MAX),
            };
            let sql = format!(
                "SELECT * FROM {table} \
                 WHERE symbol = ?1 AND expiry = ?2 AND timeframe = ?3 AND bucket_time = ?4\
                 {range_clause} ORDER BY strike"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
            let mapped = if strike_range.is_some() {
                stmt.query_map(
                    params![symbol, expiry_s, timeframe.as_str(), bucket, low, high],
                    row_to_strike_bar,
                )
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
            } else {
                stmt.query_map(
                    params![symbol, expiry_s, timeframe.as_str(), bucket],
                    row_to_strike_bar,
                )
                .map_err(StoreError::from)?
                .collect::<Result<Vec<_>, _>>()
            };
            out.extend(mapped.map_err(StoreError::from)?);
        }

        Ok(out)
    }

    /// Time-bucketed series grouped by the stored moneyness label and expiry.
    ///
    /// The aggregation expression is selected from the closed
    /// indicator × side matrix; greeks aggregate as count-weighted averages,
    /// volume and OI as sums.
    pub fn fetch_strike_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        expiries: &[NaiveDate],
        indicator: Indicator,
        option_side: OptionSide,
        from: i64,
        to: i64,
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        if expiries.is_empty() {
            return Ok(Vec::new());
        }
        let table = strike_bars_table(timeframe);
        let expr = series_aggregation_expr(indicator, option_side);

        let placeholders: Vec<String> = (0..expiries.len()).map(|i| format!("?{}", i + 5)).collect();
        let sql = format!(
            "SELECT bucket_time, expiry, moneyness_bucket, {expr} AS value \
             FROM {table} \
             WHERE symbol = ?1 AND timeframe = ?2 \
               AND bucket_time BETWEEN ?3 AND ?4 \
               AND moneyness_bucket IS NOT NULL \
               AND expiry IN ({in_list}) \
             GROUP BY bucket_time, expiry, moneyness_bucket \
             ORDER BY bucket_time, expiry, moneyness_bucket",
            in_list = placeholders.join(", ")
        );

        let mut values: Vec<Value> = vec![
            Value::Text(symbol.to_string()),
            Value::Text(timeframe.as_str().to_string()),
            Value::Integer(from),
            Value::Integer(to),
        ];
        values.extend(expiries.iter().map(|e| Value::Text(format_expiry(*e))));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        let points = stmt
            .query_map(params_from_iter(values), |r| {
                let expiry_s: String = r.get(1)?;
                Ok(SeriesPoint {
                    bucket_time: r.get(0)?,
                    expiry: parse_expiry(&expiry_s).unwrap_or_default(),
                    moneyness_bucket: r.get(2)?,
                    value: r.get(3)?,
                })
            })
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(points)
    }

    /// Candle-like per-strike rows over a window.
    pub fn fetch_strike_history(
        &self,
        symbol: &str,
        strike: f64,
        expiry: NaiveDate,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    ) -> Result<Vec<StrikeBarRow>, StoreError> {
        let table = strike_bars_table(timeframe);
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE symbol = ?1 AND expiry = ?2 AND timeframe = ?3 \
               AND strike BETWEEN ?4 - 0.001 AND ?4 + 0.001 \
               AND bucket_time BETWEEN ?5 AND ?6 \
             ORDER BY bucket_time"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(
                params![symbol, format_expiry(expiry), timeframe.as_str(), strike, from, to],
                row_to_strike_bar,
            )
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    /// Latest bucket_time across all expiries, used by the gap detector.
    pub fn latest_bucket(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>, StoreError> {
        let table = strike_bars_table(timeframe);
        let sql =
            format!("SELECT MAX(bucket_time) FROM {table} WHERE symbol = ?1 AND timeframe = ?2");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        stmt.query_row(params![symbol, timeframe.as_str()], |r| {
            r.get::<_, Option<i64>>(0)
        })
        .map_err(StoreError::from)
    }

    /// Latest expiry-metrics row per expiry.
    pub fn fetch_latest_expiry_metrics(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        expiries: &[NaiveDate],
    ) -> Result<Vec<ExpiryMetricsRow>, StoreError> {
        let table = expiry_metrics_table(timeframe);
        let conn = self.conn.lock();
        let mut out = Vec::new();
        for expiry in expiries {
            let sql = format!(
                "SELECT bucket_time, symbol, expiry, total_call_volume, total_put_volume, \
                        pcr, max_pain_strike \
                 FROM {table} \
                 WHERE symbol = ?1 AND expiry = ?2 AND timeframe = ?3 \
                 ORDER BY bucket_time DESC LIMIT 1"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
            let row = stmt
                .query_row(
                    params![symbol, format_expiry(*expiry), timeframe.as_str()],
                    |r| {
                        let expiry_s: String = r.get(2)?;
                        Ok(ExpiryMetricsRow {
                            bucket_time: r.get(0)?,
                            symbol: r.get(1)?,
                            expiry: parse_expiry(&expiry_s).unwrap_or_default(),
                            timeframe,
                            total_call_volume: r.get(3)?,
                            total_put_volume: r.get(4)?,
                            pcr: r.get(5)?,
                            max_pain_strike: r.get(6)?,
                        })
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StoreError::from(other)),
                })?;
            out.extend(row);
        }
        Ok(out)
    }

    /// 1-minute rows touched since `since_ms`, feeding the rollup scheduler.
    pub fn fetch_1min_rows_updated_since(
        &self,
        since_ms: i64,
    ) -> Result<Vec<StrikeBarRow>, StoreError> {
        let table = strike_bars_table(Timeframe::Min1);
        let sql = format!(
            "SELECT * FROM {table} WHERE updated_at >= ?1 \
             ORDER BY symbol, expiry, strike, bucket_time"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![since_ms], row_to_strike_bar)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    /// All 1-minute rows of one (symbol, expiry) inside a window, feeding a
    /// single target-bucket re-aggregation.
    pub fn fetch_1min_rows_window(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        from: i64,
        to: i64,
    ) -> Result<Vec<StrikeBarRow>, StoreError> {
        let table = strike_bars_table(Timeframe::Min1);
        let sql = format!(
            "SELECT * FROM {table} \
             WHERE symbol = ?1 AND expiry = ?2 AND bucket_time >= ?3 AND bucket_time < ?4 \
             ORDER BY strike, bucket_time"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        let rows = stmt
            .query_map(
                params![symbol, format_expiry(expiry), from, to],
                row_to_strike_bar,
            )
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    /// Distinct expiries present for a symbol (static-lookup endpoint).
    pub fn list_expiries(&self, symbol: &str) -> Result<Vec<NaiveDate>, StoreError> {
        let table = strike_bars_table(Timeframe::Min1);
        let sql = format!(
            "SELECT DISTINCT expiry FROM {table} WHERE symbol = ?1 ORDER BY expiry"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(StoreError::from)?;
        let expiries = stmt
            .query_map(params![symbol], |r| r.get::<_, String>(0))
            .map_err(StoreError::from)?
            .filter_map(|s| s.ok().and_then(|s| parse_expiry(&s)))
            .collect();
        Ok(expiries)
    }
}

/// Aggregation expression for the series read path. Column names come from
/// the closed indicator/side enums, never from request strings.
fn series_aggregation_expr(indicator: Indicator, side: OptionSide) -> String {
    let prefix = match side {
        OptionSide::Call => "call",
        OptionSide::Put => "put",
    };
    match indicator {
        Indicator::Volume => format!("SUM({prefix}_volume)"),
        Indicator::Oi => format!("SUM({prefix}_oi_sum)"),
        greek => {
            let col = format!("{prefix}_{}_avg", greek.as_str());
            format!(
                "SUM(CASE WHEN {col} IS NOT NULL THEN {col} * {prefix}_count END) * 1.0 \
                 / NULLIF(SUM(CASE WHEN {col} IS NOT NULL THEN {prefix}_count END), 0)"
            )
        }
    }
}

/// Map a full `SELECT *` strike-bar row.
fn row_to_strike_bar(r: &Row<'_>) -> rusqlite::Result<StrikeBarRow> {
    let expiry_s: String = r.get("expiry")?;
    let tf_s: String = r.get("timeframe")?;
    let score_avg: Option<f64> = r.get("liquidity_score_avg")?;

    let liquidity = match score_avg {
        Some(liquidity_score_avg) => Some(LiquiditySummary {
            liquidity_score_avg,
            liquidity_score_min: r.get::<_, Option<f64>>("liquidity_score_min")?.unwrap_or(0.0),
            liquidity_tier: r
                .get::<_, Option<String>>("liquidity_tier")?
                .unwrap_or_default(),
            spread_abs_avg: r.get::<_, Option<f64>>("spread_abs_avg")?.unwrap_or(0.0),
            spread_pct_avg: r.get::<_, Option<f64>>("spread_pct_avg")?.unwrap_or(0.0),
            spread_pct_max: r.get::<_, Option<f64>>("spread_pct_max")?.unwrap_or(0.0),
            depth_imbalance_pct_avg: r
                .get::<_, Option<f64>>("depth_imbalance_pct_avg")?
                .unwrap_or(0.0),
            book_pressure_avg: r.get::<_, Option<f64>>("book_pressure_avg")?.unwrap_or(0.0),
            total_bid_qty_avg: r.get::<_, Option<f64>>("total_bid_qty_avg")?.unwrap_or(0.0),
            total_ask_qty_avg: r.get::<_, Option<f64>>("total_ask_qty_avg")?.unwrap_or(0.0),
            is_illiquid: r.get::<_, Option<bool>>("is_illiquid")?.unwrap_or(false),
            illiquid_tick_count: r.get::<_, i64>("illiquid_tick_count")? as u64,
            total_tick_count: r.get::<_, i64>("total_tick_count")? as u64,
        }),
        None => None,
    };

    Ok(StrikeBarRow {
        symbol: r.get("symbol")?,
        expiry: parse_expiry(&expiry_s).unwrap_or_default(),
        timeframe: Timeframe::parse(&tf_s).unwrap_or(Timeframe::Min1),
        bucket_time: r.get("bucket_time")?,
        strike: r.get("strike")?,
        underlying_close: r.get("underlying_close")?,
        call_iv_avg: r.get("call_iv_avg")?,
        put_iv_avg: r.get("put_iv_avg")?,
        call_delta_avg: r.get("call_delta_avg")?,
        put_delta_avg: r.get("put_delta_avg")?,
        call_gamma_avg: r.get("call_gamma_avg")?,
        put_gamma_avg: r.get("put_gamma_avg")?,
        call_theta_avg: r.get("call_theta_avg")?,
        put_theta_avg: r.get("put_theta_avg")?,
        call_vega_avg: r.get("call_vega_avg")?,
        put_vega_avg: r.get("put_vega_avg")?,
        call_volume: r.get("call_volume")?,
        put_volume: r.get("put_volume")?,
        call_count: r.get::<_, i64>("call_count")? as u64,
        put_count: r.get::<_, i64>("put_count")? as u64,
        call_oi_sum: r.get("call_oi_sum")?,
        put_oi_sum: r.get("put_oi_sum")?,
        moneyness_bucket: r.get("moneyness_bucket")?,
        liquidity,
    })
}
