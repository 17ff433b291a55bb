// =============================================================================
// Shared types used across the Meridian F&O engine
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Which side of the option chain a contract sits on.
///
/// Wire format from the ticker bus is `CE` / `PE`; internally we normalise to
/// CALL / PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionSide {
    #[serde(rename = "CE", alias = "CALL")]
    Call,
    #[serde(rename = "PE", alias = "PUT")]
    Put,
}

impl OptionSide {
    /// Parse the exchange wire form (`CE` / `PE`, case-insensitive).
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CE" | "CALL" => Some(Self::Call),
            "PE" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CE"),
            Self::Put => write!(f, "PE"),
        }
    }
}

/// Aggregation bucket duration. Buckets are half-open windows
/// `[bucket_start, bucket_start + timeframe)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1min")]
    Min1,
    #[serde(rename = "5min")]
    Min5,
    #[serde(rename = "15min")]
    Min15,
}

impl Timeframe {
    /// Bucket duration in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::Min1 => 60_000,
            Self::Min5 => 300_000,
            Self::Min15 => 900_000,
        }
    }

    /// Canonical label, also used as the table-name suffix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1min",
            Self::Min5 => "5min",
            Self::Min15 => "15min",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1min" | "1m" => Some(Self::Min1),
            "5min" | "5m" => Some(Self::Min5),
            "15min" | "15m" => Some(Self::Min15),
            _ => None,
        }
    }

    /// Floor an epoch-millisecond timestamp to the start of its bucket.
    pub fn bucket_start(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.duration_ms())
    }

    /// The aggregated timeframes derived from the 1-minute base.
    pub fn rollup_targets() -> [Timeframe; 2] {
        [Self::Min5, Self::Min15]
    }

    pub fn all() -> [Timeframe; 3] {
        [Self::Min1, Self::Min5, Self::Min15]
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange segment of an instrument, as carried on subscription events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Cash index (e.g. `INDICES`).
    Index,
    /// Index future (e.g. `NFO-FUT`).
    Future,
    /// Index option (e.g. `NFO-OPT`).
    Option,
}

impl Segment {
    /// Classify an exchange segment string. `INDICES` maps to the underlying;
    /// anything ending in `-FUT` / `-OPT` maps to futures / options.
    pub fn classify(raw: &str) -> Option<Self> {
        let upper = raw.to_ascii_uppercase();
        if upper == "INDICES" {
            Some(Self::Index)
        } else if upper.ends_with("-FUT") {
            Some(Self::Future)
        } else if upper.ends_with("-OPT") {
            Some(Self::Option)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "INDICES"),
            Self::Future => write!(f, "FUT"),
            Self::Option => write!(f, "OPT"),
        }
    }
}

/// Metric selectable on the series and distribution read paths.
///
/// Together with [`OptionSide`] it picks the aggregation column: IV and the
/// Greeks aggregate as count-weighted averages, volume and OI as sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Iv,
    Delta,
    Gamma,
    Theta,
    Vega,
    Volume,
    Oi,
}

impl Indicator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iv" => Some(Self::Iv),
            "delta" => Some(Self::Delta),
            "gamma" => Some(Self::Gamma),
            "theta" => Some(Self::Theta),
            "vega" => Some(Self::Vega),
            "volume" => Some(Self::Volume),
            "oi" => Some(Self::Oi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iv => "iv",
            Self::Delta => "delta",
            Self::Gamma => "gamma",
            Self::Theta => "theta",
            Self::Vega => "vega",
            Self::Volume => "volume",
            Self::Oi => "oi",
        }
    }

    /// Whether the indicator aggregates as a count-weighted average (true)
    /// or a plain sum (false).
    pub fn is_weighted_average(self) -> bool {
        !matches!(self, Self::Volume | Self::Oi)
    }
}

impl std::fmt::Display for Indicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inclusive strike window used by query filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrikeRange {
    pub low: f64,
    pub high: f64,
}

impl StrikeRange {
    pub fn contains(&self, strike: f64) -> bool {
        strike >= self.low && strike <= self.high
    }
}

/// Format an expiry date the way it travels on the wire and in cache keys.
pub fn format_expiry(expiry: NaiveDate) -> String {
    expiry.format("%Y-%m-%d").to_string()
}

/// Parse a `YYYY-MM-DD` expiry date.
pub fn parse_expiry(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_side_wire_roundtrip() {
        assert_eq!(OptionSide::from_wire("CE"), Some(OptionSide::Call));
        assert_eq!(OptionSide::from_wire("pe"), Some(OptionSide::Put));
        assert_eq!(OptionSide::from_wire("PUT"), Some(OptionSide::Put));
        assert_eq!(OptionSide::from_wire("XX"), None);
        assert_eq!(OptionSide::Call.to_string(), "CE");
    }

    #[test]
    fn timeframe_bucket_floor() {
        // 10:00:37.500 UTC floors to 10:00:00 for 1min.
        let ts = 1_730_887_237_500_i64;
        assert_eq!(Timeframe::Min1.bucket_start(ts), 1_730_887_200_000);
        // Already aligned timestamps are unchanged.
        assert_eq!(
            Timeframe::Min5.bucket_start(1_730_887_200_000),
            1_730_887_200_000
        );
        // 5min floor lands on a 300s boundary.
        assert_eq!(Timeframe::Min5.bucket_start(ts) % 300_000, 0);
    }

    #[test]
    fn timeframe_parse_accepts_short_forms() {
        assert_eq!(Timeframe::parse("1min"), Some(Timeframe::Min1));
        assert_eq!(Timeframe::parse("5m"), Some(Timeframe::Min5));
        assert_eq!(Timeframe::parse("15min"), Some(Timeframe::Min15));
        assert_eq!(Timeframe::parse("1h"), None);
    }

    #[test]
    fn segment_classification() {
        assert_eq!(Segment::classify("INDICES"), Some(Segment::Index));
        assert_eq!(Segment::classify("NFO-FUT"), Some(Segment::Future));
        assert_eq!(Segment::classify("NFO-OPT"), Some(Segment::Option));
        assert_eq!(Segment::classify("BFO-OPT"), Some(Segment::Option));
        assert_eq!(Segment::classify("NSE"), None);
    }

    #[test]
    fn expiry_parse_format_roundtrip() {
        let d = parse_expiry("2025-11-28").unwrap();
        assert_eq!(format_expiry(d), "2025-11-28");
        assert!(parse_expiry("28-11-2025").is_none());
    }

    #[test]
    fn indicator_parse_and_aggregation_kind() {
        assert_eq!(Indicator::parse("IV"), Some(Indicator::Iv));
        assert_eq!(Indicator::parse("oi"), Some(Indicator::Oi));
        assert_eq!(Indicator::parse("pcr"), None);
        assert!(Indicator::Delta.is_weighted_average());
        assert!(!Indicator::Volume.is_weighted_average());
        assert!(!Indicator::Oi.is_weighted_average());
    }

    #[test]
    fn strike_range_bounds_inclusive() {
        let r = StrikeRange {
            low: 24_000.0,
            high: 25_000.0,
        };
        assert!(r.contains(24_000.0));
        assert!(r.contains(25_000.0));
        assert!(!r.contains(25_050.0));
    }
}
