// =============================================================================
// Backfill Engine — gap-driven and subscription-triggered history loading
// =============================================================================
//
// Two modes share one write path:
//
//   Immediate — a subscription_created event triggers a bounded-window fetch
//   (default 2 h) for the subject instrument, fire-and-forget.
//
//   Scheduled — a periodic scan measures the gap between the newest stored
//   bucket and now for every registered instrument and fills anything past
//   the threshold.
//
// All writes go through the store's idempotent upserts, so overlapping or
// repeated windows coalesce on the primary key. A failed window is abandoned
// after the client's retries; the next scheduled scan picks it up.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::app_state::HealthCounters;
use crate::backfill::history::{HistoryBar, HistoryClient};
use crate::market_data::events::{SubscriptionEvent, SubscriptionEventType};
use crate::market_data::tick::UnderlyingBar;
use crate::store::bars::OptionStore;
use crate::store::rows::{FutureBarRow, StrikeBarRow};
use crate::types::{OptionSide, Segment, Timeframe};

/// A unit of backfill work derived from a subscription event.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillRequest {
    pub event_type: SubscriptionEventType,
    pub instrument_token: u64,
    pub segment: Segment,
    /// Underlying index symbol (derived from the trading symbol).
    pub symbol: String,
    pub expiry: Option<NaiveDate>,
    pub strike: Option<f64>,
    pub option_side: Option<OptionSide>,
    pub tradingsymbol: String,
}

impl BackfillRequest {
    /// Build a request from a subscription event. Events with unclassifiable
    /// segments are skipped.
    pub fn from_event(event: &SubscriptionEvent) -> Option<Self> {
        let segment = Segment::classify(&event.metadata.segment)?;
        Some(Self {
            event_type: event.event_type,
            instrument_token: event.instrument_token,
            segment,
            symbol: event.underlying_symbol(),
            expiry: event.metadata.expiry,
            strike: event.metadata.strike,
            option_side: event.metadata.option_side,
            tradingsymbol: event.metadata.tradingsymbol.clone(),
        })
    }
}

/// Shared state of the backfill engine.
pub struct BackfillEngine {
    client: Arc<HistoryClient>,
    store: Arc<OptionStore>,
    counters: Arc<HealthCounters>,
    /// Instruments seen via subscription_created and not yet removed.
    registry: Mutex<HashMap<u64, BackfillRequest>>,
    /// Bounded pool for concurrent window fetches.
    workers: Arc<Semaphore>,
    window_ms: i64,
    gap_threshold_ms: i64,
    cadence_secs: u64,
}

impl BackfillEngine {
    pub fn new(
        client: Arc<HistoryClient>,
        store: Arc<OptionStore>,
        counters: Arc<HealthCounters>,
        pool_size: usize,
        window_hours: u32,
        gap_threshold_sec: u64,
        cadence_secs: u64,
    ) -> Self {
        Self {
            client,
            store,
            counters,
            registry: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
            window_ms: window_hours as i64 * 3_600_000,
            gap_threshold_ms: gap_threshold_sec as i64 * 1_000,
            cadence_secs: cadence_secs.max(1),
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Dispatcher task: consume requests from the events path. Created
    /// instruments are registered and immediately backfilled; removed ones
    /// only leave the registry.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BackfillRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let req = tokio::select! {
                r = rx.recv() => match r {
                    Some(r) => r,
                    None => {
                        info!("backfill request channel closed");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    info!("backfill dispatcher stopping");
                    return;
                }
            };

            match req.event_type {
                SubscriptionEventType::Created => {
                    self.registry.lock().insert(req.instrument_token, req.clone());
                    let engine = self.clone();
                    // Fire-and-forget: the event listener is never blocked on
                    // history I/O.
                    tokio::spawn(async move {
                        let now = Utc::now().timestamp_millis();
                        engine.backfill_window(&req, now - engine.window_ms, now).await;
                    });
                }
                SubscriptionEventType::Removed => {
                    if self.registry.lock().remove(&req.instrument_token).is_some() {
                        debug!(token = req.instrument_token, "instrument deregistered");
                    }
                }
            }
        }
    }

    /// Scheduled task: every cadence, fill gaps for registered instruments.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(self.cadence_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("backfill scheduler stopping");
                    return;
                }
            }

            let instruments: Vec<BackfillRequest> =
                self.registry.lock().values().cloned().collect();
            if instruments.is_empty() {
                continue;
            }

            let now = Utc::now().timestamp_millis();
            for req in instruments {
                match self.detect_gap(&req, now) {
                    Ok(Some((from, to))) => {
                        debug!(
                            token = req.instrument_token,
                            gap_ms = to - from,
                            "gap detected — backfilling"
                        );
                        self.backfill_window(&req, from, to).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(token = req.instrument_token, error = %e, "gap detection failed");
                    }
                }
            }
        }
    }

    /// Gap since `max(latest stored bucket, start of day)`. Returns the
    /// window to fill when the gap exceeds the threshold.
    fn detect_gap(
        &self,
        req: &BackfillRequest,
        now_ms: i64,
    ) -> Result<Option<(i64, i64)>, crate::errors::StoreError> {
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(now_ms - self.window_ms);

        let latest = self.store.latest_bucket(&req.symbol, Timeframe::Min1)?;
        let floor = latest.unwrap_or(start_of_day).max(start_of_day);
        if now_ms - floor > self.gap_threshold_ms {
            Ok(Some((floor, now_ms)))
        } else {
            Ok(None)
        }
    }

    /// Fetch one window and persist it through the shared upsert path.
    pub async fn backfill_window(&self, req: &BackfillRequest, from_ms: i64, to_ms: i64) {
        let _permit = self.workers.acquire().await.expect("semaphore closed");
        self.counters.backfill_runs_total.fetch_add(1, Ordering::Relaxed);

        let bars = match self
            .client
            .fetch_bars(req.instrument_token, from_ms, to_ms, "1min")
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                self.counters.backfill_errors_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    token = req.instrument_token,
                    tradingsymbol = %req.tradingsymbol,
                    error = %e,
                    "history fetch exhausted — next scheduled scan will retry"
                );
                return;
            }
        };
        if bars.is_empty() {
            return;
        }

        if let Err(e) = persist_bars(&self.store, req, &bars).await {
            self.counters.backfill_errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                token = req.instrument_token,
                error = %e,
                "backfill persist failed"
            );
        } else {
            info!(
                token = req.instrument_token,
                tradingsymbol = %req.tradingsymbol,
                bars = bars.len(),
                "backfill window persisted"
            );
        }
    }
}

/// Convert and upsert fetched bars by instrument segment. Idempotent: the
/// rows land on their primary keys, so re-running a window changes nothing.
pub async fn persist_bars(
    store: &OptionStore,
    req: &BackfillRequest,
    bars: &[HistoryBar],
) -> Result<(), crate::errors::StoreError> {
    match req.segment {
        Segment::Index => {
            let rows: Vec<UnderlyingBar> = bars
                .iter()
                .map(|b| UnderlyingBar {
                    symbol: req.symbol.clone(),
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                    volume: b.volume,
                    ts: b.ts,
                    is_mock: false,
                })
                .collect();
            store.upsert_underlying_bars(&rows).await
        }
        Segment::Future => {
            let Some(expiry) = req.expiry else {
                warn!(tradingsymbol = %req.tradingsymbol, "future backfill without expiry — skipped");
                return Ok(());
            };
            let rows: Vec<FutureBarRow> = bars
                .iter()
                .map(|b| FutureBarRow {
                    symbol: req.symbol.clone(),
                    expiry,
                    bucket_time: Timeframe::Min1.bucket_start(b.ts),
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                    volume: b.volume,
                    oi: b.oi,
                })
                .collect();
            store.upsert_future_bars(&rows).await
        }
        Segment::Option => {
            let (Some(expiry), Some(strike), Some(side)) =
                (req.expiry, req.strike, req.option_side)
            else {
                warn!(
                    tradingsymbol = %req.tradingsymbol,
                    "option backfill without expiry/strike/side — skipped"
                );
                return Ok(());
            };
            // One historical bar becomes one single-contribution strike row
            // for the referenced side; the full chain is covered by the
            // scheduled cycle as other strikes register.
            let rows: Vec<StrikeBarRow> = bars
                .iter()
                .map(|b| {
                    let mut row = StrikeBarRow::empty(
                        req.symbol.clone(),
                        expiry,
                        Timeframe::Min1,
                        Timeframe::Min1.bucket_start(b.ts),
                        strike,
                    );
                    match side {
                        OptionSide::Call => {
                            row.call_volume = b.volume;
                            row.call_count = 1;
                            row.call_oi_sum = b.oi;
                        }
                        OptionSide::Put => {
                            row.put_volume = b.volume;
                            row.put_count = 1;
                            row.put_oi_sum = b.oi;
                        }
                    }
                    row
                })
                .collect();
            store.upsert_strike_bars(&rows).await
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::events::EventMetadata;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 28).unwrap()
    }

    fn created_event() -> SubscriptionEvent {
        SubscriptionEvent {
            event_type: SubscriptionEventType::Created,
            instrument_token: 13_660_418,
            metadata: EventMetadata {
                tradingsymbol: "NIFTY25NOV24500CE".into(),
                segment: "NFO-OPT".into(),
                expiry: Some(expiry()),
                strike: Some(24_500.0),
                option_side: Some(OptionSide::Call),
            },
            timestamp: 1_730_887_200_000,
        }
    }

    fn bars() -> Vec<HistoryBar> {
        vec![
            HistoryBar {
                ts: 60_500,
                open: 180.0,
                high: 184.0,
                low: 179.0,
                close: 183.0,
                volume: 1_200.0,
                oi: Some(3_400_000.0),
            },
            HistoryBar {
                ts: 120_500,
                open: 183.0,
                high: 185.0,
                low: 182.0,
                close: 184.5,
                volume: 900.0,
                oi: Some(3_410_000.0),
            },
        ]
    }

    #[test]
    fn request_from_event_classifies_segment() {
        let req = BackfillRequest::from_event(&created_event()).unwrap();
        assert_eq!(req.segment, Segment::Option);
        assert_eq!(req.symbol, "NIFTY");
        assert_eq!(req.strike, Some(24_500.0));
        assert_eq!(req.event_type, SubscriptionEventType::Created);

        let mut unknown = created_event();
        unknown.metadata.segment = "???".into();
        assert!(BackfillRequest::from_event(&unknown).is_none());
    }

    #[tokio::test]
    async fn option_bars_land_as_strike_rows() {
        let store = OptionStore::open_in_memory().unwrap();
        let req = BackfillRequest::from_event(&created_event()).unwrap();

        persist_bars(&store, &req, &bars()).await.unwrap();

        let rows = store
            .fetch_strike_history("NIFTY", 24_500.0, expiry(), Timeframe::Min1, 0, 300_000)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bucket_time, 60_000);
        assert_eq!(rows[0].call_volume, 1_200.0);
        assert_eq!(rows[0].call_oi_sum, Some(3_400_000.0));
        assert_eq!(rows[0].put_count, 0);
    }

    #[tokio::test]
    async fn repeated_backfill_is_idempotent() {
        let store = OptionStore::open_in_memory().unwrap();
        let req = BackfillRequest::from_event(&created_event()).unwrap();

        persist_bars(&store, &req, &bars()).await.unwrap();
        persist_bars(&store, &req, &bars()).await.unwrap();

        let rows = store
            .fetch_strike_history("NIFTY", 24_500.0, expiry(), Timeframe::Min1, 0, 300_000)
            .unwrap();
        assert_eq!(rows.len(), 2, "duplicate windows must coalesce");
    }

    #[tokio::test]
    async fn index_bars_land_in_the_underlying_table() {
        let store = OptionStore::open_in_memory().unwrap();
        let req = BackfillRequest {
            event_type: SubscriptionEventType::Created,
            instrument_token: 256_265,
            segment: Segment::Index,
            symbol: "NIFTY".into(),
            expiry: None,
            strike: None,
            option_side: None,
            tradingsymbol: "NIFTY".into(),
        };
        persist_bars(&store, &req, &bars()).await.unwrap();
        // No strike rows were produced.
        assert_eq!(store.latest_bucket("NIFTY", Timeframe::Min1).unwrap(), None);
    }

    #[tokio::test]
    async fn future_backfill_without_expiry_is_skipped() {
        let store = OptionStore::open_in_memory().unwrap();
        let req = BackfillRequest {
            event_type: SubscriptionEventType::Created,
            instrument_token: 1,
            segment: Segment::Future,
            symbol: "NIFTY".into(),
            expiry: None,
            strike: None,
            option_side: None,
            tradingsymbol: "NIFTY25NOVFUT".into(),
        };
        // Skipping is not an error.
        persist_bars(&store, &req, &bars()).await.unwrap();
    }

    #[test]
    fn registry_tracks_created_and_removed() {
        let engine = BackfillEngine::new(
            Arc::new(HistoryClient::new(
                "http://127.0.0.1:1",
                "k",
                "s",
                std::time::Duration::from_secs(1),
            )),
            Arc::new(OptionStore::open_in_memory().unwrap()),
            Arc::new(HealthCounters::new()),
            4,
            2,
            120,
            300,
        );
        let req = BackfillRequest::from_event(&created_event()).unwrap();
        engine.registry.lock().insert(req.instrument_token, req.clone());
        assert_eq!(engine.registered_count(), 1);
        engine.registry.lock().remove(&req.instrument_token);
        assert_eq!(engine.registered_count(), 0);
    }

    #[tokio::test]
    async fn gap_detection_triggers_past_threshold() {
        let store = Arc::new(OptionStore::open_in_memory().unwrap());
        let engine = BackfillEngine::new(
            Arc::new(HistoryClient::new(
                "http://127.0.0.1:1",
                "k",
                "s",
                std::time::Duration::from_secs(1),
            )),
            store.clone(),
            Arc::new(HealthCounters::new()),
            4,
            2,
            120,
            300,
        );
        let req = BackfillRequest::from_event(&created_event()).unwrap();

        // Fresh store: the gap floor falls back to start-of-day, which is
        // more than two minutes ago except in the first seconds of a day.
        let now = Utc::now().timestamp_millis();
        let gap = engine.detect_gap(&req, now).unwrap();
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis();
        if now - start_of_day > engine.gap_threshold_ms {
            let (from, to) = gap.expect("gap expected");
            assert_eq!(from, start_of_day);
            assert_eq!(to, now);
        }

        // A store current through `now` has no gap.
        let mut bar = StrikeBarRow::empty(
            "NIFTY".into(),
            expiry(),
            Timeframe::Min1,
            Timeframe::Min1.bucket_start(now),
            24_500.0,
        );
        bar.call_count = 1;
        store.upsert_strike_bars(&[bar]).await.unwrap();
        assert!(engine.detect_gap(&req, now).unwrap().is_none());
    }
}
