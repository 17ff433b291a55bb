// =============================================================================
// Liquidity metrics — per-tick scoring folded into per-bucket summaries
// =============================================================================
//
// Tick-level values never persist; only the bucket-level aggregation does.
// A bucket is flagged illiquid when more than half of its depth-carrying
// ticks scored illiquid.

use crate::market_data::tick::DepthSnapshot;
use crate::store::rows::LiquiditySummary;

/// Spread above this fraction of mid marks a tick illiquid outright.
const ILLIQUID_SPREAD_PCT: f64 = 2.0;
/// Composite score below this marks a tick illiquid.
const ILLIQUID_SCORE: f64 = 25.0;
/// Combined book depth below this quantity is considered thin.
const THIN_DEPTH_QTY: f64 = 600.0;

/// Metrics computed from a single tick's depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickLiquidity {
    pub spread_abs: f64,
    pub spread_pct: f64,
    /// (bid − ask) / (bid + ask) in percent.
    pub depth_imbalance_pct: f64,
    /// bid / (bid + ask), in [0, 1].
    pub book_pressure: f64,
    pub total_bid_qty: f64,
    pub total_ask_qty: f64,
    /// Composite score in [0, 100]; higher is more liquid.
    pub score: f64,
    pub is_illiquid: bool,
}

impl TickLiquidity {
    /// Compute tick metrics from a depth snapshot. Returns `None` when either
    /// side of the book is empty or crossed.
    pub fn from_depth(depth: &DepthSnapshot) -> Option<Self> {
        let bid = depth.best_bid()?;
        let ask = depth.best_ask()?;
        if bid.price <= 0.0 || ask.price < bid.price {
            return None;
        }

        let mid = (bid.price + ask.price) / 2.0;
        let spread_abs = ask.price - bid.price;
        let spread_pct = if mid > 0.0 { spread_abs / mid * 100.0 } else { 0.0 };

        let total_bid_qty = depth.total_bid_qty();
        let total_ask_qty = depth.total_ask_qty();
        let total_qty = total_bid_qty + total_ask_qty;
        let (depth_imbalance_pct, book_pressure) = if total_qty > 0.0 {
            (
                (total_bid_qty - total_ask_qty) / total_qty * 100.0,
                total_bid_qty / total_qty,
            )
        } else {
            (0.0, 0.5)
        };

        // Score: start at 100, penalise wide spreads and thin books.
        let spread_penalty = (spread_pct * 25.0).min(70.0);
        let depth_penalty = if total_qty < THIN_DEPTH_QTY {
            30.0 * (1.0 - total_qty / THIN_DEPTH_QTY)
        } else {
            0.0
        };
        let score = (100.0 - spread_penalty - depth_penalty).max(0.0);

        let is_illiquid = score < ILLIQUID_SCORE || spread_pct > ILLIQUID_SPREAD_PCT;

        Some(Self {
            spread_abs,
            spread_pct,
            depth_imbalance_pct,
            book_pressure,
            total_bid_qty,
            total_ask_qty,
            score,
            is_illiquid,
        })
    }

    /// Tier label from the composite score.
    pub fn tier(score: f64) -> &'static str {
        if score >= 75.0 {
            "deep"
        } else if score >= 50.0 {
            "moderate"
        } else if score >= 25.0 {
            "thin"
        } else {
            "illiquid"
        }
    }
}

/// Per-bucket liquidity accumulator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketLiquidity {
    total: u64,
    illiquid: u64,
    spread_abs_sum: f64,
    spread_pct_sum: f64,
    spread_pct_max: f64,
    imbalance_sum: f64,
    pressure_sum: f64,
    bid_qty_sum: f64,
    ask_qty_sum: f64,
    score_sum: f64,
    score_min: f64,
    tier_counts: [u64; 4],
}

impl BucketLiquidity {
    /// Fold one tick's metrics in, weighted by `weight` contributions
    /// (1 for live ticks, the source tick count for re-aggregation).
    pub fn fold(&mut self, m: &TickLiquidity, weight: u64) {
        let w = weight as f64;
        if self.total == 0 {
            self.score_min = m.score;
        } else {
            self.score_min = self.score_min.min(m.score);
        }
        self.total += weight;
        if m.is_illiquid {
            self.illiquid += weight;
        }
        self.spread_abs_sum += m.spread_abs * w;
        self.spread_pct_sum += m.spread_pct * w;
        self.spread_pct_max = self.spread_pct_max.max(m.spread_pct);
        self.imbalance_sum += m.depth_imbalance_pct * w;
        self.pressure_sum += m.book_pressure * w;
        self.bid_qty_sum += m.total_bid_qty * w;
        self.ask_qty_sum += m.total_ask_qty * w;
        self.score_sum += m.score * w;

        let tier_idx = match TickLiquidity::tier(m.score) {
            "deep" => 0,
            "moderate" => 1,
            "thin" => 2,
            _ => 3,
        };
        self.tier_counts[tier_idx] += weight;
    }

    /// Re-fold a previously materialised summary (rollup path).
    pub fn fold_summary(&mut self, s: &LiquiditySummary) {
        if s.total_tick_count == 0 {
            return;
        }
        let w = s.total_tick_count as f64;
        if self.total == 0 {
            self.score_min = s.liquidity_score_min;
        } else {
            self.score_min = self.score_min.min(s.liquidity_score_min);
        }
        self.total += s.total_tick_count;
        self.illiquid += s.illiquid_tick_count;
        self.spread_abs_sum += s.spread_abs_avg * w;
        self.spread_pct_sum += s.spread_pct_avg * w;
        self.spread_pct_max = self.spread_pct_max.max(s.spread_pct_max);
        self.imbalance_sum += s.depth_imbalance_pct_avg * w;
        self.pressure_sum += s.book_pressure_avg * w;
        self.bid_qty_sum += s.total_bid_qty_avg * w;
        self.ask_qty_sum += s.total_ask_qty_avg * w;
        self.score_sum += s.liquidity_score_avg * w;

        let tier_idx = match s.liquidity_tier.as_str() {
            "deep" => 0,
            "moderate" => 1,
            "thin" => 2,
            _ => 3,
        };
        self.tier_counts[tier_idx] += s.total_tick_count;
    }

    /// Materialise the bucket summary, or `None` if no depth was seen.
    pub fn summary(&self) -> Option<LiquiditySummary> {
        if self.total == 0 {
            return None;
        }
        let n = self.total as f64;
        let tier_mode = match self
            .tier_counts
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| **c)
            .map(|(i, _)| i)
            .unwrap_or(3)
        {
            0 => "deep",
            1 => "moderate",
            2 => "thin",
            _ => "illiquid",
        };
        Some(LiquiditySummary {
            liquidity_score_avg: self.score_sum / n,
            liquidity_score_min: self.score_min,
            liquidity_tier: tier_mode.to_string(),
            spread_abs_avg: self.spread_abs_sum / n,
            spread_pct_avg: self.spread_pct_sum / n,
            spread_pct_max: self.spread_pct_max,
            depth_imbalance_pct_avg: self.imbalance_sum / n,
            book_pressure_avg: self.pressure_sum / n,
            total_bid_qty_avg: self.bid_qty_sum / n,
            total_ask_qty_avg: self.ask_qty_sum / n,
            is_illiquid: self.illiquid as f64 / self.total as f64 > 0.5,
            illiquid_tick_count: self.illiquid,
            total_tick_count: self.total,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tick::DepthLevel;

    fn depth(bid: f64, ask: f64, bid_qty: f64, ask_qty: f64) -> DepthSnapshot {
        DepthSnapshot {
            bid: vec![DepthLevel { price: bid, quantity: bid_qty, orders: 5 }],
            ask: vec![DepthLevel { price: ask, quantity: ask_qty, orders: 5 }],
        }
    }

    #[test]
    fn tight_deep_book_scores_high() {
        let m = TickLiquidity::from_depth(&depth(182.0, 182.1, 2_000.0, 2_000.0)).unwrap();
        assert!(m.score > 75.0, "score {}", m.score);
        assert!(!m.is_illiquid);
        assert_eq!(TickLiquidity::tier(m.score), "deep");
        assert!((m.book_pressure - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wide_spread_marks_illiquid() {
        // 10 vs 10.5: ~4.9% spread, far past the 2% cutoff.
        let m = TickLiquidity::from_depth(&depth(10.0, 10.5, 5_000.0, 5_000.0)).unwrap();
        assert!(m.is_illiquid);
    }

    #[test]
    fn empty_or_crossed_book_yields_none() {
        let empty = DepthSnapshot { bid: vec![], ask: vec![] };
        assert!(TickLiquidity::from_depth(&empty).is_none());

        let crossed = depth(183.0, 182.0, 100.0, 100.0);
        assert!(TickLiquidity::from_depth(&crossed).is_none());
    }

    #[test]
    fn imbalance_sign_follows_bid_dominance() {
        let m = TickLiquidity::from_depth(&depth(182.0, 182.2, 3_000.0, 1_000.0)).unwrap();
        assert!(m.depth_imbalance_pct > 0.0);
        assert!(m.book_pressure > 0.5);
    }

    #[test]
    fn bucket_is_illiquid_only_past_half() {
        let good = TickLiquidity::from_depth(&depth(182.0, 182.1, 2_000.0, 2_000.0)).unwrap();
        let bad = TickLiquidity::from_depth(&depth(10.0, 10.5, 50.0, 50.0)).unwrap();

        // 2 of 4 illiquid: not past half.
        let mut bucket = BucketLiquidity::default();
        bucket.fold(&good, 1);
        bucket.fold(&good, 1);
        bucket.fold(&bad, 1);
        bucket.fold(&bad, 1);
        let s = bucket.summary().unwrap();
        assert!(!s.is_illiquid);
        assert_eq!(s.total_tick_count, 4);
        assert_eq!(s.illiquid_tick_count, 2);

        // 3 of 4: past half.
        let mut bucket = BucketLiquidity::default();
        bucket.fold(&good, 1);
        bucket.fold(&bad, 1);
        bucket.fold(&bad, 1);
        bucket.fold(&bad, 1);
        assert!(bucket.summary().unwrap().is_illiquid);
    }

    #[test]
    fn summary_averages_and_min() {
        let a = TickLiquidity::from_depth(&depth(182.0, 182.1, 2_000.0, 2_000.0)).unwrap();
        let b = TickLiquidity::from_depth(&depth(182.0, 182.5, 500.0, 500.0)).unwrap();
        let mut bucket = BucketLiquidity::default();
        bucket.fold(&a, 1);
        bucket.fold(&b, 1);
        let s = bucket.summary().unwrap();
        let expected_avg = (a.score + b.score) / 2.0;
        assert!((s.liquidity_score_avg - expected_avg).abs() < 1e-9);
        assert!((s.liquidity_score_min - a.score.min(b.score)).abs() < 1e-9);
        assert!((s.spread_pct_max - b.spread_pct).abs() < 1e-9);
    }

    #[test]
    fn fold_summary_merges_weighted() {
        let a = TickLiquidity::from_depth(&depth(182.0, 182.1, 2_000.0, 2_000.0)).unwrap();
        let mut one = BucketLiquidity::default();
        one.fold(&a, 3);
        let s1 = one.summary().unwrap();

        let mut merged = BucketLiquidity::default();
        merged.fold_summary(&s1);
        merged.fold_summary(&s1);
        let s = merged.summary().unwrap();
        assert_eq!(s.total_tick_count, 6);
        assert!((s.liquidity_score_avg - s1.liquidity_score_avg).abs() < 1e-9);
    }

    #[test]
    fn no_depth_means_no_summary() {
        assert!(BucketLiquidity::default().summary().is_none());
    }
}
