//! Opening-range scanner.
//!
//! Runs once per session after the opening range closes and produces the
//! immutable set of [`SymbolSetup`]s used for the rest of the day.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use orb_core::api::MarketData;
use orb_core::clock::MarketCalendar;
use orb_core::config::FilterConfig;
use orb_core::indicators;
use orb_core::types::{Instrument, SymbolSetup};
use risk_manager::RiskEngine;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a symbol was left out of the session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScanSkip {
    #[error("instrument token not found")]
    NoToken,
    #[error("no opening range candle")]
    NoOpeningCandle,
    #[error("invalid opening range: high {high}, low {low}")]
    InvalidRange { high: Decimal, low: Decimal },
    #[error("no VWAP available")]
    NoVwap,
    #[error("range {range_pct}% outside [{min}%, {max}%]")]
    RangeOutOfBounds {
        range_pct: Decimal,
        min: Decimal,
        max: Decimal,
    },
    #[error("market data error: {0}")]
    Data(String),
}

impl From<orb_core::Error> for ScanSkip {
    fn from(e: orb_core::Error) -> Self {
        ScanSkip::Data(e.to_string())
    }
}

/// Setups locked for one session, in configured symbol order.
#[derive(Debug, Clone)]
pub struct SessionSetups {
    trading_day: NaiveDate,
    setups: Vec<SymbolSetup>,
    skipped: Vec<(Instrument, ScanSkip)>,
}

impl SessionSetups {
    pub fn trading_day(&self) -> NaiveDate {
        self.trading_day
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolSetup> {
        self.setups.iter()
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&SymbolSetup> {
        self.setups.iter().find(|s| &s.instrument == instrument)
    }

    pub fn len(&self) -> usize {
        self.setups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setups.is_empty()
    }

    pub fn skipped(&self) -> &[(Instrument, ScanSkip)] {
        &self.skipped
    }
}

pub struct SymbolScanner {
    market: Arc<dyn MarketData>,
    calendar: MarketCalendar,
    filters: FilterConfig,
    risk: RiskEngine,
}

impl SymbolScanner {
    pub fn new(
        market: Arc<dyn MarketData>,
        calendar: MarketCalendar,
        filters: FilterConfig,
        risk: RiskEngine,
    ) -> Self {
        Self {
            market,
            calendar,
            filters,
            risk,
        }
    }

    /// Compute setups for every symbol. Individual failures only skip that symbol.
    pub async fn scan(&self, symbols: &[Instrument], trading_day: NaiveDate, now: DateTime<Utc>) -> SessionSetups {
        let mut setups = Vec::new();
        let mut skipped = Vec::new();

        for instrument in symbols {
            match self.scan_symbol(instrument, trading_day, now).await {
                Ok(setup) => {
                    info!(
                        symbol = %setup.instrument,
                        range_low = %setup.range_low,
                        range_high = %setup.range_high,
                        vwap = %setup.vwap.round_dp(2),
                        buffer = %setup.buffer.round_dp(2),
                        long_trigger = %setup.long_trigger.round_dp(2),
                        short_trigger = %setup.short_trigger.round_dp(2),
                        "Setup locked"
                    );
                    setups.push(setup);
                }
                Err(reason) => {
                    warn!(symbol = %instrument, reason = %reason, "Symbol skipped for session");
                    skipped.push((instrument.clone(), reason));
                }
            }
        }

        info!(
            configured = symbols.len(),
            ready = setups.len(),
            trading_day = %trading_day,
            "Opening range scan complete"
        );
        SessionSetups {
            trading_day,
            setups,
            skipped,
        }
    }

    pub async fn scan_symbol(
        &self,
        instrument: &Instrument,
        trading_day: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<SymbolSetup, ScanSkip> {
        let token = self
            .market
            .instrument_token(instrument)
            .await?
            .ok_or(ScanSkip::NoToken)?;

        let open = self.calendar.market_open(trading_day);
        let range_end = self.calendar.range_end(trading_day);

        let opening = self
            .market
            .historical_candles(token, open, range_end, self.filters.range_interval)
            .await?;
        let first = opening
            .iter()
            .find(|c| c.time >= open)
            .ok_or(ScanSkip::NoOpeningCandle)?;
        if !first.is_valid_range() {
            return Err(ScanSkip::InvalidRange {
                high: first.high,
                low: first.low,
            });
        }

        let session = self
            .market
            .historical_candles(token, open, now, self.filters.candle_interval)
            .await?;
        let vwap = indicators::vwap(&session)
            .filter(|v| *v > Decimal::ZERO)
            .ok_or(ScanSkip::NoVwap)?;

        let range_pct = (first.high - first.low) / vwap * Decimal::ONE_HUNDRED;
        if self.filters.use_range_filter
            && (range_pct < self.filters.range_min_pct || range_pct > self.filters.range_max_pct)
        {
            return Err(ScanSkip::RangeOutOfBounds {
                range_pct: range_pct.round_dp(3),
                min: self.filters.range_min_pct,
                max: self.filters.range_max_pct,
            });
        }

        let atr = if self.risk.config().use_atr_buffer {
            self.entry_atr(token, now).await
        } else {
            None
        };
        let buffer = self.risk.entry_buffer(atr);

        Ok(SymbolSetup {
            instrument: instrument.clone(),
            token,
            trading_day,
            range_high: first.high,
            range_low: first.low,
            vwap,
            buffer,
            long_trigger: first.high + buffer,
            short_trigger: first.low - buffer,
            range_pct,
            locked_at: now,
        })
    }

    /// ATR over the candles just before `now`. `None` when there are not
    /// enough of them, which selects the fixed buffer.
    async fn entry_atr(&self, token: u64, now: DateTime<Utc>) -> Option<Decimal> {
        let period = self.risk.config().atr_period;
        let interval = self.filters.candle_interval;
        let lookback = Duration::minutes((period as i64 + 2) * interval.minutes());
        match self
            .market
            .historical_candles(token, now - lookback, now, interval)
            .await
        {
            Ok(candles) => {
                let atr = indicators::atr(&candles, period);
                if atr.is_none() {
                    warn!(token, candles = candles.len(), "Not enough candles for ATR, using fixed buffer");
                }
                atr
            }
            Err(e) => {
                warn!(token, error = %e, "ATR candles unavailable, using fixed buffer");
                None
            }
        }
    }
}
