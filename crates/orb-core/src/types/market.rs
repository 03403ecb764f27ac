//! Market data types: instruments, candles and quotes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tradable symbol on an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_exchange() -> String {
    "NSE".to_string()
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            exchange: exchange.into(),
        }
    }

    pub fn nse(symbol: impl Into<String>) -> Self {
        Self::new(symbol, default_exchange())
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Candle interval as understood by the market-data collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "minute")]
    Minute1,
    #[serde(rename = "3minute")]
    Minute3,
    #[serde(rename = "5minute")]
    Minute5,
    #[serde(rename = "10minute")]
    Minute10,
    #[serde(rename = "15minute")]
    Minute15,
    #[serde(rename = "30minute")]
    Minute30,
    #[serde(rename = "60minute")]
    Minute60,
    #[serde(rename = "day")]
    Day,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute1 => "minute",
            Interval::Minute3 => "3minute",
            Interval::Minute5 => "5minute",
            Interval::Minute10 => "10minute",
            Interval::Minute15 => "15minute",
            Interval::Minute30 => "30minute",
            Interval::Minute60 => "60minute",
            Interval::Day => "day",
        }
    }

    /// Length of one candle in minutes.
    pub fn minutes(&self) -> i64 {
        match self {
            Interval::Minute1 => 1,
            Interval::Minute3 => 3,
            Interval::Minute5 => 5,
            Interval::Minute10 => 10,
            Interval::Minute15 => 15,
            Interval::Minute30 => 30,
            Interval::Minute60 => 60,
            Interval::Day => 375,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV bar. `time` is the bar's open instant and identifies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

impl Candle {
    pub fn new(
        time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: u64,
    ) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// (H + L + C) / 3
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// A usable opening-range candle has positive bounds with high >= low.
    pub fn is_valid_range(&self) -> bool {
        self.high > Decimal::ZERO && self.low > Decimal::ZERO && self.high >= self.low
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: u64,
    #[serde(default)]
    pub orders: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketDepth {
    #[serde(default)]
    pub buy: Vec<DepthLevel>,
    #[serde(default)]
    pub sell: Vec<DepthLevel>,
}

/// Point-in-time quote for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub last_price: Decimal,
    #[serde(default)]
    pub ohlc: Option<Ohlc>,
    /// Day volume traded so far.
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub depth: Option<MarketDepth>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn at_price(last_price: Decimal) -> Self {
        Self {
            last_price,
            ohlc: None,
            volume: 0,
            depth: None,
            timestamp: None,
        }
    }

    pub fn with_depth(mut self, bid: Decimal, ask: Decimal) -> Self {
        self.depth = Some(MarketDepth {
            buy: vec![DepthLevel {
                price: bid,
                quantity: 100,
                orders: 1,
            }],
            sell: vec![DepthLevel {
                price: ask,
                quantity: 100,
                orders: 1,
            }],
        });
        self
    }

    pub fn with_volume(mut self, volume: u64) -> Self {
        self.volume = volume;
        self
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.depth.as_ref()?.buy.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.depth.as_ref()?.sell.first().map(|l| l.price)
    }

    /// Bid/ask spread as a percentage of last price.
    pub fn spread_pct(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if self.last_price <= Decimal::ZERO {
            return None;
        }
        Some((ask - bid) / self.last_price * Decimal::ONE_HUNDRED)
    }
}
