// =============================================================================
// Subscription lifecycle events from the upstream ticker service
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::OptionSide;

/// Lifecycle transitions published on the `events` channel.
///
/// `subscription_removed` and `subscription_deleted` are aliases emitted by
/// different upstream versions; both decode to `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEventType {
    #[serde(rename = "subscription_created")]
    Created,
    #[serde(rename = "subscription_removed", alias = "subscription_deleted")]
    Removed,
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "subscription_created"),
            Self::Removed => write!(f, "subscription_removed"),
        }
    }
}

/// Instrument descriptor attached to a subscription event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub tradingsymbol: String,
    pub segment: String,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub option_side: Option<OptionSide>,
}

/// A subscription lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub event_type: SubscriptionEventType,
    pub instrument_token: u64,
    pub metadata: EventMetadata,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl SubscriptionEvent {
    /// The underlying index symbol, derived from the trading symbol prefix
    /// (e.g. `NIFTY25NOV24500CE` → `NIFTY`).
    pub fn underlying_symbol(&self) -> String {
        let ts = &self.metadata.tradingsymbol;
        let end = ts
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(ts.len());
        ts[..end].to_string()
    }
}

/// Parse and minimally validate a subscription event payload.
pub fn parse_subscription_event(data: &serde_json::Value) -> Result<SubscriptionEvent> {
    let event: SubscriptionEvent =
        serde_json::from_value(data.clone()).context("failed to decode subscription event")?;
    if event.metadata.tradingsymbol.is_empty() {
        anyhow::bail!("subscription event missing tradingsymbol");
    }
    Ok(event)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_created_event() {
        let v = serde_json::json!({
            "event_type": "subscription_created",
            "instrument_token": 13660418_u64,
            "metadata": {
                "tradingsymbol": "NIFTY25NOV24500CE",
                "segment": "NFO-OPT",
                "expiry": "2025-11-28",
                "strike": 24500.0,
                "option_side": "CE"
            },
            "timestamp": 1_730_887_200_000_i64
        });
        let ev = parse_subscription_event(&v).unwrap();
        assert_eq!(ev.event_type, SubscriptionEventType::Created);
        assert_eq!(ev.instrument_token, 13_660_418);
        assert_eq!(ev.underlying_symbol(), "NIFTY");
        assert_eq!(ev.metadata.strike, Some(24_500.0));
    }

    #[test]
    fn removed_and_deleted_are_aliases() {
        for et in ["subscription_removed", "subscription_deleted"] {
            let v = serde_json::json!({
                "event_type": et,
                "instrument_token": 1_u64,
                "metadata": { "tradingsymbol": "NIFTY", "segment": "INDICES" },
                "timestamp": 1_i64
            });
            let ev = parse_subscription_event(&v).unwrap();
            assert_eq!(ev.event_type, SubscriptionEventType::Removed);
        }
    }

    #[test]
    fn underlying_symbol_from_index_tradingsymbol() {
        let v = serde_json::json!({
            "event_type": "subscription_created",
            "instrument_token": 256265_u64,
            "metadata": { "tradingsymbol": "NIFTY", "segment": "INDICES" },
            "timestamp": 1_i64
        });
        let ev = parse_subscription_event(&v).unwrap();
        assert_eq!(ev.underlying_symbol(), "NIFTY");
    }

    #[test]
    fn reject_unknown_event_type() {
        let v = serde_json::json!({
            "event_type": "subscription_paused",
            "instrument_token": 1_u64,
            "metadata": { "tradingsymbol": "NIFTY", "segment": "INDICES" },
            "timestamp": 1_i64
        });
        assert!(parse_subscription_event(&v).is_err());
    }
}
