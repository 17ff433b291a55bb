// =============================================================================
// Wire types — option ticks, underlying bars, L2 depth
// =============================================================================

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::OptionSide;

// ---------------------------------------------------------------------------
// Depth
// ---------------------------------------------------------------------------

/// A single price level of the L2 book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub orders: u32,
}

/// L2 snapshot carried on an option tick. Levels are ordered best-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    #[serde(default)]
    pub bid: Vec<DepthLevel>,
    #[serde(default)]
    pub ask: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bid.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.ask.first()
    }

    pub fn total_bid_qty(&self) -> f64 {
        self.bid.iter().map(|l| l.quantity).sum()
    }

    pub fn total_ask_qty(&self) -> f64 {
        self.ask.iter().map(|l| l.quantity).sum()
    }
}

// ---------------------------------------------------------------------------
// Option tick
// ---------------------------------------------------------------------------

/// A single option quote from the `options` channel.
///
/// Greeks and OI are optional per tick; absences are preserved so weighted
/// averages only count real contributions. Generator output is flagged with
/// `is_mock` and must never reach aggregation or the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionTick {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_side: OptionSide,
    pub last_price: f64,
    /// Cumulative traded volume at tick time.
    pub volume: f64,
    #[serde(default)]
    pub oi: Option<f64>,
    #[serde(default)]
    pub iv: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub theta: Option<f64>,
    #[serde(default)]
    pub vega: Option<f64>,
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(default)]
    pub depth: Option<DepthSnapshot>,
    #[serde(default)]
    pub is_mock: bool,
}

impl OptionTick {
    /// Bounds validation beyond what serde enforces. Out-of-range ticks are
    /// counted and dropped by the consumer.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            anyhow::bail!("empty symbol");
        }
        if !(self.strike > 0.0) {
            anyhow::bail!("non-positive strike {}", self.strike);
        }
        if self.last_price < 0.0 {
            anyhow::bail!("negative last_price {}", self.last_price);
        }
        if self.volume < 0.0 {
            anyhow::bail!("negative volume {}", self.volume);
        }
        if let Some(iv) = self.iv {
            // IV arrives as a fraction; anything past 500% is garbage.
            if !(0.0..=5.0).contains(&iv) {
                anyhow::bail!("iv {} out of range", iv);
            }
        }
        if self.ts <= 0 {
            anyhow::bail!("non-positive timestamp {}", self.ts);
        }
        Ok(())
    }
}

/// Parse and validate an option tick from a channel payload.
pub fn parse_option_tick(data: &serde_json::Value) -> Result<OptionTick> {
    let tick: OptionTick =
        serde_json::from_value(data.clone()).context("failed to decode option tick")?;
    tick.validate().context("option tick failed validation")?;
    Ok(tick)
}

// ---------------------------------------------------------------------------
// Underlying bar
// ---------------------------------------------------------------------------

/// A spot-index bar from the `underlying` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingBar {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(default)]
    pub is_mock: bool,
}

impl UnderlyingBar {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            anyhow::bail!("empty symbol");
        }
        if self.close <= 0.0 {
            anyhow::bail!("non-positive close {}", self.close);
        }
        if self.low > self.high {
            anyhow::bail!("low {} above high {}", self.low, self.high);
        }
        if self.ts <= 0 {
            anyhow::bail!("non-positive timestamp {}", self.ts);
        }
        Ok(())
    }
}

/// Parse and validate an underlying bar from a channel payload.
pub fn parse_underlying_bar(data: &serde_json::Value) -> Result<UnderlyingBar> {
    let bar: UnderlyingBar =
        serde_json::from_value(data.clone()).context("failed to decode underlying bar")?;
    bar.validate().context("underlying bar failed validation")?;
    Ok(bar)
}
