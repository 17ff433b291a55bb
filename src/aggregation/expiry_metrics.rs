// =============================================================================
// Derived expiry metrics — PCR and max-pain from a completed bucket
// =============================================================================

use crate::store::rows::{ExpiryMetricsRow, StrikeBarRow};

/// Compute the expiry-metrics row for one completed bucket's strike rows.
///
/// All rows must share (symbol, expiry, timeframe, bucket_time); the caller
/// guarantees this by construction. Returns `None` for an empty bucket.
pub fn compute(rows: &[StrikeBarRow]) -> Option<ExpiryMetricsRow> {
    let first = rows.first()?;

    let total_call_volume: f64 = rows.iter().map(|r| r.call_volume).sum();
    let total_put_volume: f64 = rows.iter().map(|r| r.put_volume).sum();

    let pcr = if total_call_volume > 0.0 {
        Some(total_put_volume / total_call_volume)
    } else {
        None
    };

    Some(ExpiryMetricsRow {
        symbol: first.symbol.clone(),
        expiry: first.expiry,
        timeframe: first.timeframe,
        bucket_time: first.bucket_time,
        total_call_volume,
        total_put_volume,
        pcr,
        max_pain_strike: max_pain(rows),
    })
}

/// The strike minimising the pain function over the observed strike set.
///
/// `pain(c) = Σ_j max(0, s_j − c)·call_vol_j + max(0, c − s_j)·put_vol_j`
///
/// Ties break toward the lowest strike; an empty strike set yields `None`.
pub fn max_pain(rows: &[StrikeBarRow]) -> Option<f64> {
    let mut candidates: Vec<f64> = rows.iter().map(|r| r.strike).collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).expect("finite strikes"));
    candidates.dedup();

    let mut best: Option<(f64, f64)> = None;
    for &c in &candidates {
        let pain: f64 = rows
            .iter()
            .map(|r| {
                (r.strike - c).max(0.0) * r.call_volume + (c - r.strike).max(0.0) * r.put_volume
            })
            .sum();
        match best {
            // Strictly-less keeps the lowest strike on ties (candidates are
            // visited in ascending order).
            Some((_, best_pain)) if pain >= best_pain => {}
            _ => best = Some((c, pain)),
        }
    }
    best.map(|(strike, _)| strike)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeframe;
    use chrono::NaiveDate;

    fn row(strike: f64, call_volume: f64, put_volume: f64) -> StrikeBarRow {
        let mut r = StrikeBarRow::empty(
            "NIFTY".into(),
            NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            Timeframe::Min1,
            60_000,
            strike,
        );
        r.call_volume = call_volume;
        r.put_volume = put_volume;
        r
    }

    // Strikes [24900, 25000, 25100], call vols [100, 50, 10],
    // put vols [10, 50, 100] → pain 7000 / 2000 / 7000, argmin 25000.
    #[test]
    fn max_pain_fixture() {
        let rows = vec![
            row(24_900.0, 100.0, 10.0),
            row(25_000.0, 50.0, 50.0),
            row(25_100.0, 10.0, 100.0),
        ];
        assert_eq!(max_pain(&rows), Some(25_000.0));
    }

    #[test]
    fn max_pain_tie_breaks_to_lowest_strike() {
        // Symmetric distribution: every candidate scores equally at the two
        // outer strikes; the middle wins, but make a genuinely tied case.
        let rows = vec![row(24_900.0, 10.0, 10.0), row(25_000.0, 10.0, 10.0)];
        // pain(24900) = max(0,100)*10 (call at 25000) = 1000
        // pain(25000) = max(0,100)*10 (put at 24900)  = 1000 → tie → 24900.
        assert_eq!(max_pain(&rows), Some(24_900.0));
    }

    #[test]
    fn max_pain_is_optimal_over_candidates() {
        // P4: exhaustively verify the chosen strike minimises the pain
        // function over the candidate set.
        let rows = vec![
            row(24_800.0, 120.0, 30.0),
            row(24_900.0, 80.0, 70.0),
            row(25_000.0, 40.0, 90.0),
            row(25_100.0, 10.0, 140.0),
        ];
        let chosen = max_pain(&rows).unwrap();
        let pain_at = |c: f64| -> f64 {
            rows.iter()
                .map(|r| {
                    (r.strike - c).max(0.0) * r.call_volume
                        + (c - r.strike).max(0.0) * r.put_volume
                })
                .sum()
        };
        for r in &rows {
            assert!(pain_at(chosen) <= pain_at(r.strike));
        }
    }

    #[test]
    fn empty_bucket_yields_none() {
        assert_eq!(max_pain(&[]), None);
        assert!(compute(&[]).is_none());
    }

    #[test]
    fn pcr_from_totals() {
        let rows = vec![row(25_000.0, 100.0, 150.0), row(25_100.0, 100.0, 50.0)];
        let m = compute(&rows).unwrap();
        assert_eq!(m.total_call_volume, 200.0);
        assert_eq!(m.total_put_volume, 200.0);
        assert_eq!(m.pcr, Some(1.0));
    }

    #[test]
    fn pcr_is_null_when_no_call_volume() {
        let rows = vec![row(25_000.0, 0.0, 150.0)];
        let m = compute(&rows).unwrap();
        assert_eq!(m.pcr, None);
        assert_eq!(m.total_put_volume, 150.0);
    }
}
