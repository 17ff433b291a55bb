// =============================================================================
// Moneyness classification — ATM / OTM1..10 / ITM1..10
// =============================================================================
//
// The label is relative to spot at flush time: offsets inside half a strike
// step are ATM; beyond that the step count is rounded and clamped at 10.
// Positive offsets (strike above spot) are OTM for calls by convention; the
// label is side-agnostic and stored once per strike row.

/// Classify a strike against the underlying close.
///
/// `gap` is the per-symbol strike step (e.g. 50 for NIFTY). A non-positive
/// gap cannot classify anything and yields `None`.
pub fn classify(strike: f64, underlying_close: f64, gap: f64) -> Option<String> {
    if gap <= 0.0 || !underlying_close.is_finite() || !strike.is_finite() {
        return None;
    }

    let offset = strike - underlying_close;
    if offset.abs() < gap / 2.0 {
        return Some("ATM".to_string());
    }

    let steps = (offset.abs() / gap).round().max(1.0).min(10.0) as u32;
    if offset > 0.0 {
        Some(format!("OTM{steps}"))
    } else {
        Some(format!("ITM{steps}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // NIFTY-style fixture: gap 50, underlying 24 650.
    #[test]
    fn classification_fixture() {
        let gap = 50.0;
        let spot = 24_650.0;
        assert_eq!(classify(24_650.0, spot, gap).unwrap(), "ATM");
        assert_eq!(classify(24_700.0, spot, gap).unwrap(), "OTM1");
        assert_eq!(classify(24_800.0, spot, gap).unwrap(), "OTM3");
        assert_eq!(classify(24_600.0, spot, gap).unwrap(), "ITM1");
        // Deep strikes clamp at step 10.
        assert_eq!(classify(26_000.0, spot, gap).unwrap(), "OTM10");
        assert_eq!(classify(20_000.0, spot, gap).unwrap(), "ITM10");
    }

    #[test]
    fn atm_band_is_half_gap_wide() {
        let gap = 50.0;
        let spot = 24_650.0;
        assert_eq!(classify(24_674.9, spot, gap).unwrap(), "ATM");
        // Exactly half a gap away is no longer ATM.
        assert_eq!(classify(24_675.0, spot, gap).unwrap(), "OTM1");
        assert_eq!(classify(24_625.0, spot, gap).unwrap(), "ITM1");
    }

    #[test]
    fn wider_gap_symbols() {
        // BANKNIFTY-style 100-point steps.
        let gap = 100.0;
        let spot = 51_320.0;
        assert_eq!(classify(51_300.0, spot, gap).unwrap(), "ATM");
        assert_eq!(classify(51_500.0, spot, gap).unwrap(), "OTM2");
        assert_eq!(classify(51_000.0, spot, gap).unwrap(), "ITM3");
    }

    #[test]
    fn degenerate_inputs_yield_none() {
        assert_eq!(classify(25_000.0, 24_650.0, 0.0), None);
        assert_eq!(classify(25_000.0, f64::NAN, 50.0), None);
        assert_eq!(classify(f64::INFINITY, 24_650.0, 50.0), None);
    }
}
