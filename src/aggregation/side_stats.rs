// =============================================================================
// Per-side accumulators — count-weighted greek/IV aggregation
// =============================================================================

use serde::{Deserialize, Serialize};

/// One count-weighted running sum. Only non-null contributions enter the
/// weight, so a zero weight materialises as null, never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightedSum {
    sum: f64,
    weight: f64,
}

impl WeightedSum {
    /// Fold in one contribution of weight `w`; `None` values are skipped
    /// entirely (they contribute neither sum nor weight).
    pub fn add(&mut self, value: Option<f64>, w: u64) {
        if let Some(v) = value {
            self.sum += v * w as f64;
            self.weight += w as f64;
        }
    }

    /// The weighted average, or `None` if nothing contributed.
    pub fn average(&self) -> Option<f64> {
        if self.weight > 0.0 {
            Some(self.sum / self.weight)
        } else {
            None
        }
    }
}

/// Running aggregates for one side (call or put) of a strike within a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    pub count: u64,
    pub sum_volume: f64,
    pub last_oi: Option<f64>,
    pub iv: WeightedSum,
    pub delta: WeightedSum,
    pub gamma: WeightedSum,
    pub theta: WeightedSum,
    pub vega: WeightedSum,
}

impl SideStats {
    /// Fold in one contribution.
    ///
    /// `weight` is 1 for a live tick and the source row's `count` when
    /// re-aggregating 1-minute bars into a larger timeframe. `oi` replaces the
    /// running value when present — OI is a level, not a flow.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        &mut self,
        weight: u64,
        volume: f64,
        oi: Option<f64>,
        iv: Option<f64>,
        delta: Option<f64>,
        gamma: Option<f64>,
        theta: Option<f64>,
        vega: Option<f64>,
    ) {
        self.count += weight;
        self.sum_volume += volume;
        if oi.is_some() {
            self.last_oi = oi;
        }
        self.iv.add(iv, weight);
        self.delta.add(delta, weight);
        self.gamma.add(gamma, weight);
        self.theta.add(theta, weight);
        self.vega.add(vega, weight);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_average_skips_null_contributions() {
        // iv 0.20 (count 3), 0.22 (count 2), null (count 1) → 0.2080.
        let mut side = SideStats::default();
        side.ingest(3, 0.0, None, Some(0.20), None, None, None, None);
        side.ingest(2, 0.0, None, Some(0.22), None, None, None, None);
        side.ingest(1, 0.0, None, None, None, None, None, None);

        let avg = side.iv.average().unwrap();
        assert!((avg - 0.208).abs() < 1e-12, "expected 0.2080, got {avg}");
        // Null-IV contribution is excluded from the average but not the count.
        assert_eq!(side.count, 6);
    }

    #[test]
    fn all_null_yields_none_not_zero() {
        let mut side = SideStats::default();
        side.ingest(5, 100.0, None, None, None, None, None, None);
        assert_eq!(side.iv.average(), None);
        assert_eq!(side.delta.average(), None);
        assert_eq!(side.count, 5);
        assert_eq!(side.sum_volume, 100.0);
    }

    #[test]
    fn oi_is_last_value_not_a_sum() {
        let mut side = SideStats::default();
        side.ingest(1, 10.0, Some(1_000.0), None, None, None, None, None);
        side.ingest(1, 10.0, Some(1_200.0), None, None, None, None, None);
        side.ingest(1, 10.0, None, None, None, None, None, None);
        assert_eq!(side.last_oi, Some(1_200.0));
        assert_eq!(side.sum_volume, 30.0);
    }

    #[test]
    fn averages_match_manual_formula() {
        // P3: x_avg = Σ(x_i · w_i) / Σ w_i over non-null contributions.
        let contributions = [(Some(0.5), 2_u64), (Some(0.7), 3), (None, 4), (Some(0.4), 1)];
        let mut side = SideStats::default();
        for (v, w) in contributions {
            side.ingest(w, 0.0, None, None, v, None, None, None);
        }
        let expected = (0.5 * 2.0 + 0.7 * 3.0 + 0.4 * 1.0) / 6.0;
        assert!((side.delta.average().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_side_reports_empty() {
        let side = SideStats::default();
        assert!(side.is_empty());
        assert_eq!(side.iv.average(), None);
    }
}
