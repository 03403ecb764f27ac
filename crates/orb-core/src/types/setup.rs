//! Session setups, entry windows, index bias and signals.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Candle, Instrument, TradeSide};

/// Per-symbol breakout levels, computed once when the opening range locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSetup {
    pub instrument: Instrument,
    pub token: u64,
    pub trading_day: NaiveDate,
    pub range_high: Decimal,
    pub range_low: Decimal,
    pub vwap: Decimal,
    pub buffer: Decimal,
    pub long_trigger: Decimal,
    pub short_trigger: Decimal,
    /// Opening range as a percentage of VWAP.
    pub range_pct: Decimal,
    pub locked_at: DateTime<Utc>,
}

impl SymbolSetup {
    pub fn trigger(&self, side: TradeSide) -> Decimal {
        match side {
            TradeSide::Long => self.long_trigger,
            TradeSide::Short => self.short_trigger,
        }
    }

    /// Which side, if any, the candle close breaks out on.
    pub fn breakout_side(&self, close: Decimal) -> Option<TradeSide> {
        if close > self.long_trigger && close > self.vwap {
            Some(TradeSide::Long)
        } else if close < self.short_trigger && close < self.vwap {
            Some(TradeSide::Short)
        } else {
            None
        }
    }
}

/// Entry-window state derived from market-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryWindow {
    NotOpen,
    Primary,
    Soft,
    Closed,
}

impl EntryWindow {
    pub fn allows_entry(&self) -> bool {
        matches!(self, EntryWindow::Primary | EntryWindow::Soft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasDirection {
    Long,
    Short,
    Neutral,
}

/// Direction of the broad index relative to its opening VWAP.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexBias {
    pub direction: BiasDirection,
    /// |price - vwap| / vwap * 100
    pub strength_pct: Decimal,
}

impl IndexBias {
    pub fn neutral() -> Self {
        Self {
            direction: BiasDirection::Neutral,
            strength_pct: Decimal::ZERO,
        }
    }
}

impl Default for IndexBias {
    fn default() -> Self {
        Self::neutral()
    }
}

/// A confirmed entry signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: Instrument,
    pub token: u64,
    pub side: TradeSide,
    /// Close of the signal candle.
    pub entry_price: Decimal,
    pub candle: Candle,
    pub trigger: Decimal,
    pub vwap: Decimal,
    pub window: EntryWindow,
    pub via_retest: bool,
}
