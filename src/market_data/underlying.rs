// =============================================================================
// Underlying spot tracker — latest close per index symbol
// =============================================================================
//
// Option buckets capture `underlying_close` from the most recent spot sample
// at tick-ingest time; moneyness classification at flush reads the same value.
// Writers are the underlying-channel dispatcher; readers are the aggregation
// workers and the query path.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::tick::UnderlyingBar;

/// Thread-safe map of `symbol → (close, ts_ms)`.
#[derive(Default)]
pub struct UnderlyingTracker {
    latest: RwLock<HashMap<String, (f64, i64)>>,
}

impl UnderlyingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spot sample. Stale bars (older than the stored sample) are
    /// ignored so late replays cannot roll the spot backwards.
    pub fn update(&self, bar: &UnderlyingBar) {
        let mut map = self.latest.write();
        match map.get(&bar.symbol) {
            Some((_, ts)) if *ts > bar.ts => {}
            _ => {
                map.insert(bar.symbol.clone(), (bar.close, bar.ts));
            }
        }
    }

    /// Latest close for `symbol`, if any sample has been seen.
    pub fn close(&self, symbol: &str) -> Option<f64> {
        self.latest.read().get(symbol).map(|(c, _)| *c)
    }

    /// Latest close plus its timestamp.
    pub fn close_with_ts(&self, symbol: &str) -> Option<(f64, i64)> {
        self.latest.read().get(symbol).copied()
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        self.latest.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, close: f64, ts: i64) -> UnderlyingBar {
        UnderlyingBar {
            symbol: symbol.into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            ts,
            is_mock: false,
        }
    }

    #[test]
    fn tracks_latest_close() {
        let tracker = UnderlyingTracker::new();
        assert_eq!(tracker.close("NIFTY"), None);

        tracker.update(&bar("NIFTY", 24_700.0, 1_000));
        tracker.update(&bar("NIFTY", 24_710.0, 2_000));
        assert_eq!(tracker.close("NIFTY"), Some(24_710.0));
    }

    #[test]
    fn stale_samples_are_ignored() {
        let tracker = UnderlyingTracker::new();
        tracker.update(&bar("NIFTY", 24_710.0, 2_000));
        tracker.update(&bar("NIFTY", 24_650.0, 1_000));
        assert_eq!(tracker.close_with_ts("NIFTY"), Some((24_710.0, 2_000)));
    }

    #[test]
    fn symbols_are_independent() {
        let tracker = UnderlyingTracker::new();
        tracker.update(&bar("NIFTY", 24_700.0, 1_000));
        tracker.update(&bar("BANKNIFTY", 51_300.0, 1_000));
        assert_eq!(tracker.close("NIFTY"), Some(24_700.0));
        assert_eq!(tracker.close("BANKNIFTY"), Some(51_300.0));
        assert_eq!(tracker.tracked_symbols().len(), 2);
    }
}
