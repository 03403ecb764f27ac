//! Breakout signal evaluation.
//!
//! Filters run in a fixed order: entry window, volume, index bias, trend,
//! liquidity, then the optional retest. Candles are deduplicated per symbol
//! by open time, so the same candle never fires twice.

use chrono::{DateTime, Duration, Utc};
use orb_core::api::MarketData;
use orb_core::clock::MarketCalendar;
use orb_core::config::{EntryConfig, FilterConfig};
use orb_core::indicators;
use orb_core::types::{
    BiasDirection, Candle, EntryWindow, IndexBias, Instrument, Signal, SymbolSetup, TradeSide,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A breakout waiting for price to come back and confirm the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRetest {
    pub side: TradeSide,
    pub trigger: Decimal,
    pub zone_low: Decimal,
    pub zone_high: Decimal,
    pub candles_waited: u32,
    pub breakout_at: DateTime<Utc>,
}

impl PendingRetest {
    fn new(side: TradeSide, trigger: Decimal, zone_pct: Decimal, breakout_at: DateTime<Utc>) -> Self {
        let width = trigger * zone_pct / Decimal::ONE_HUNDRED;
        Self {
            side,
            trigger,
            zone_low: trigger - width,
            zone_high: trigger + width,
            candles_waited: 0,
            breakout_at,
        }
    }

    /// Candle traded into the zone and closed back through the trigger.
    pub fn confirmed_by(&self, candle: &Candle, vwap: Decimal) -> bool {
        let touched = candle.low <= self.zone_high && candle.high >= self.zone_low;
        let closed_through = match self.side {
            TradeSide::Long => candle.close > self.trigger && candle.close > vwap,
            TradeSide::Short => candle.close < self.trigger && candle.close < vwap,
        };
        touched && closed_through
    }
}

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq)]
enum Rejection {
    Window(EntryWindow),
    Volume { ratio: Decimal, required: Decimal },
    IndexBias(IndexBias),
    Trend { htf_vwap: Decimal },
    Liquidity(String),
    Data(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Window(w) => write!(f, "entry window {w:?}"),
            Rejection::Volume { ratio, required } => {
                write!(f, "volume {}x below {}x", ratio.round_dp(2), required.round_dp(2))
            }
            Rejection::IndexBias(b) => {
                write!(f, "index bias {:?} ({}%)", b.direction, b.strength_pct.round_dp(2))
            }
            Rejection::Trend { htf_vwap } => write!(f, "against HTF VWAP {}", htf_vwap.round_dp(2)),
            Rejection::Liquidity(reason) => write!(f, "liquidity: {reason}"),
            Rejection::Data(reason) => write!(f, "data unavailable: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    last_candle: Option<DateTime<Utc>>,
    pending: Option<PendingRetest>,
    /// Cached HTF VWAP and when it was fetched.
    trend: Option<(DateTime<Utc>, Option<Decimal>)>,
}

pub struct SignalEvaluator {
    market: Arc<dyn MarketData>,
    calendar: MarketCalendar,
    entry: EntryConfig,
    filters: FilterConfig,
    index: Instrument,
    symbols: HashMap<Instrument, SymbolState>,
    bias: Option<(DateTime<Utc>, IndexBias)>,
}

impl SignalEvaluator {
    pub fn new(
        market: Arc<dyn MarketData>,
        calendar: MarketCalendar,
        entry: EntryConfig,
        filters: FilterConfig,
        index: Instrument,
    ) -> Self {
        Self {
            market,
            calendar,
            entry,
            filters,
            index,
            symbols: HashMap::new(),
            bias: None,
        }
    }

    /// Drop all per-symbol state. Called at session rollover.
    pub fn reset(&mut self) {
        self.symbols.clear();
        self.bias = None;
    }

    pub fn pending_retest(&self, instrument: &Instrument) -> Option<&PendingRetest> {
        self.symbols.get(instrument)?.pending.as_ref()
    }

    /// Latest completed candle for a setup, or `None` when data is missing.
    pub async fn latest_candle(&self, setup: &SymbolSetup, now: DateTime<Utc>) -> Option<Candle> {
        let interval = self.filters.candle_interval;
        let from = self.calendar.market_open(setup.trading_day);
        match self
            .market
            .historical_candles(setup.token, from, now, interval)
            .await
        {
            Ok(candles) => candles
                .into_iter()
                .rev()
                .find(|c| c.time + Duration::minutes(interval.minutes()) <= now),
            Err(e) => {
                warn!(symbol = %setup.instrument, error = %e, "Candle fetch failed, skipping tick");
                None
            }
        }
    }

    /// Index bias, refreshed at most every `index_refresh_secs`.
    pub async fn index_bias(&mut self, now: DateTime<Utc>) -> IndexBias {
        if let Some((fetched, bias)) = self.bias {
            if now - fetched < Duration::seconds(self.filters.index_refresh_secs as i64) {
                return bias;
            }
        }
        let bias = self.compute_index_bias(now).await;
        info!(
            index = %self.index,
            direction = ?bias.direction,
            strength_pct = %bias.strength_pct.round_dp(3),
            "Index bias refreshed"
        );
        self.bias = Some((now, bias));
        bias
    }

    async fn compute_index_bias(&self, now: DateTime<Utc>) -> IndexBias {
        let quote = match self.market.quote(&self.index).await {
            Ok(q) if q.last_price > Decimal::ZERO => q,
            Ok(_) => return IndexBias::neutral(),
            Err(e) => {
                warn!(index = %self.index, error = %e, "Index quote unavailable, bias neutral");
                return IndexBias::neutral();
            }
        };

        let mut reference = None;
        if let Ok(Some(token)) = self.market.instrument_token(&self.index).await {
            let day = self.calendar.trading_day(now);
            let open = self.calendar.market_open(day);
            let range_end = self.calendar.range_end(day);
            if let Ok(candles) = self
                .market
                .historical_candles(token, open, range_end, self.filters.range_interval)
                .await
            {
                reference = candles.first().and_then(|c| indicators::vwap(std::slice::from_ref(c)));
            }
        }
        let Some(reference) = reference
            .or_else(|| quote.ohlc.as_ref().map(|o| o.open))
            .filter(|r| *r > Decimal::ZERO)
        else {
            return IndexBias::neutral();
        };

        let price = quote.last_price;
        let strength_pct = (price - reference).abs() / reference * Decimal::ONE_HUNDRED;
        let direction = if strength_pct < self.filters.index_strong_threshold_pct {
            BiasDirection::Neutral
        } else if price > reference {
            BiasDirection::Long
        } else {
            BiasDirection::Short
        };
        IndexBias {
            direction,
            strength_pct,
        }
    }

    /// Evaluate the latest candle for one setup.
    ///
    /// Returns a signal at most once per candle. With retest enabled a
    /// breakout is parked and only fires from a later confirming candle.
    pub async fn evaluate(
        &mut self,
        setup: &SymbolSetup,
        candle: &Candle,
        bias: &IndexBias,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        {
            let state = self.symbols.entry(setup.instrument.clone()).or_default();
            if state.last_candle.is_some_and(|seen| seen >= candle.time) {
                return None;
            }
            state.last_candle = Some(candle.time);
        }

        let window = self.entry.window_at(self.calendar.local_time(now));
        if !window.allows_entry() {
            debug!(symbol = %setup.instrument, reason = %Rejection::Window(window), "No entry");
            return None;
        }

        if let Some(signal) = self.advance_retest(setup, candle, bias, window, now).await {
            return Some(signal);
        }
        if self.has_pending(&setup.instrument) {
            return None;
        }

        let side = setup.breakout_side(candle.close)?;
        debug!(
            symbol = %setup.instrument,
            side = %side,
            close = %candle.close,
            trigger = %setup.trigger(side),
            "Breakout candle"
        );

        if let Err(rejection) = self.run_filters(setup, side, candle, bias, window, now).await {
            info!(symbol = %setup.instrument, side = %side, reason = %rejection, "Breakout filtered");
            return None;
        }

        if self.filters.use_retest {
            let pending = PendingRetest::new(
                side,
                setup.trigger(side),
                self.filters.retest_zone_pct,
                candle.time,
            );
            info!(
                symbol = %setup.instrument,
                side = %side,
                zone_low = %pending.zone_low.round_dp(2),
                zone_high = %pending.zone_high.round_dp(2),
                "Breakout parked for retest"
            );
            if let Some(state) = self.symbols.get_mut(&setup.instrument) {
                state.pending = Some(pending);
            }
            return None;
        }

        Some(self.signal(setup, side, candle, window, false))
    }

    fn has_pending(&self, instrument: &Instrument) -> bool {
        self.symbols
            .get(instrument)
            .is_some_and(|s| s.pending.is_some())
    }

    async fn advance_retest(
        &mut self,
        setup: &SymbolSetup,
        candle: &Candle,
        bias: &IndexBias,
        window: EntryWindow,
        now: DateTime<Utc>,
    ) -> Option<Signal> {
        let max_wait = self.filters.retest_max_candles;
        let pending = {
            let state = self.symbols.get_mut(&setup.instrument)?;
            let pending = state.pending.as_mut()?;
            pending.candles_waited += 1;
            if pending.candles_waited > max_wait {
                info!(
                    symbol = %setup.instrument,
                    waited = pending.candles_waited,
                    "Retest expired"
                );
                state.pending = None;
                return None;
            }
            pending.clone()
        };

        if !pending.confirmed_by(candle, setup.vwap) {
            debug!(symbol = %setup.instrument, waited = pending.candles_waited, "Retest not confirmed");
            return None;
        }
        if let Err(rejection) = self
            .run_filters(setup, pending.side, candle, bias, window, now)
            .await
        {
            info!(symbol = %setup.instrument, reason = %rejection, "Retest confirmed but filtered");
            return None;
        }

        if let Some(state) = self.symbols.get_mut(&setup.instrument) {
            state.pending = None;
        }
        info!(symbol = %setup.instrument, side = %pending.side, "Retest confirmed");
        Some(self.signal(setup, pending.side, candle, window, true))
    }

    fn signal(
        &self,
        setup: &SymbolSetup,
        side: TradeSide,
        candle: &Candle,
        window: EntryWindow,
        via_retest: bool,
    ) -> Signal {
        Signal {
            instrument: setup.instrument.clone(),
            token: setup.token,
            side,
            entry_price: candle.close,
            candle: candle.clone(),
            trigger: setup.trigger(side),
            vwap: setup.vwap,
            window,
            via_retest,
        }
    }

    async fn run_filters(
        &mut self,
        setup: &SymbolSetup,
        side: TradeSide,
        candle: &Candle,
        bias: &IndexBias,
        window: EntryWindow,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        self.check_volume(setup, candle, window, now).await?;
        self.check_bias(side, bias)?;
        self.check_trend(setup, side, candle.close, now).await?;
        self.check_liquidity(setup).await
    }

    async fn check_volume(
        &self,
        setup: &SymbolSetup,
        candle: &Candle,
        window: EntryWindow,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let soft = window == EntryWindow::Soft;
        if !self.filters.use_volume_filter && !soft {
            return Ok(());
        }

        let interval = self.filters.candle_interval;
        let lookback = self.filters.volume_lookback_candles.max(self.filters.min_volume_candles);
        let from = candle.time - Duration::minutes(lookback as i64 * interval.minutes());
        let baseline: Vec<Candle> = self
            .market
            .historical_candles(setup.token, from, candle.time, interval)
            .await
            .map_err(|e| Rejection::Data(e.to_string()))?
            .into_iter()
            .filter(|c| c.time < candle.time)
            .collect();

        if baseline.len() < self.filters.min_volume_candles {
            warn!(
                symbol = %setup.instrument,
                candles = baseline.len(),
                "Too few candles for volume baseline, allowing"
            );
            return Ok(());
        }
        let Some(average) = indicators::average_volume(&baseline, lookback).filter(|a| *a > Decimal::ZERO)
        else {
            return Ok(());
        };

        let mut multiplier = self.filters.volume_multiplier;
        if soft {
            multiplier = multiplier.max(self.filters.soft_volume_multiplier);
        }
        if self.filters.use_time_of_day_volume {
            multiplier *= self
                .filters
                .volume_factors
                .factor_at(self.calendar.local_time(now));
        }

        let ratio = Decimal::from(candle.volume) / average;
        if ratio >= multiplier {
            Ok(())
        } else {
            Err(Rejection::Volume {
                ratio,
                required: multiplier,
            })
        }
    }

    fn check_bias(&self, side: TradeSide, bias: &IndexBias) -> Result<(), Rejection> {
        if !self.filters.use_index_bias {
            return Ok(());
        }
        let wanted = match side {
            TradeSide::Long => BiasDirection::Long,
            TradeSide::Short => BiasDirection::Short,
        };
        let blocked = if self.filters.index_soft_bias {
            let opposite = match side {
                TradeSide::Long => BiasDirection::Short,
                TradeSide::Short => BiasDirection::Long,
            };
            bias.direction == opposite && bias.strength_pct >= self.filters.index_strong_threshold_pct
        } else {
            bias.direction != wanted
        };
        if blocked {
            Err(Rejection::IndexBias(*bias))
        } else {
            Ok(())
        }
    }

    async fn check_trend(
        &mut self,
        setup: &SymbolSetup,
        side: TradeSide,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if !self.filters.use_trend_filter {
            return Ok(());
        }
        let Some(htf_vwap) = self.trend_vwap(setup, now).await else {
            return Ok(());
        };
        let aligned = match side {
            TradeSide::Long => price > htf_vwap,
            TradeSide::Short => price < htf_vwap,
        };
        if aligned {
            Ok(())
        } else {
            Err(Rejection::Trend { htf_vwap })
        }
    }

    async fn trend_vwap(&mut self, setup: &SymbolSetup, now: DateTime<Utc>) -> Option<Decimal> {
        let ttl = Duration::seconds(self.filters.trend_refresh_secs as i64);
        if let Some((fetched, cached)) = self.symbols.get(&setup.instrument).and_then(|s| s.trend) {
            if now - fetched < ttl {
                return cached;
            }
        }

        let from = self.calendar.market_open(setup.trading_day);
        let vwap = match self
            .market
            .historical_candles(setup.token, from, now, self.filters.trend_interval)
            .await
        {
            Ok(candles) => indicators::vwap(&candles),
            Err(e) => {
                warn!(symbol = %setup.instrument, error = %e, "HTF candles unavailable, trend filter passes");
                None
            }
        };
        if let Some(state) = self.symbols.get_mut(&setup.instrument) {
            state.trend = Some((now, vwap));
        }
        vwap
    }

    async fn check_liquidity(&self, setup: &SymbolSetup) -> Result<(), Rejection> {
        if !self.filters.use_liquidity_filter {
            return Ok(());
        }
        let quote = self
            .market
            .quote(&setup.instrument)
            .await
            .map_err(|e| Rejection::Liquidity(format!("no quote: {e}")))?;

        if quote.volume > 0 && quote.volume < self.filters.min_daily_volume {
            return Err(Rejection::Liquidity(format!(
                "day volume {} below {}",
                quote.volume, self.filters.min_daily_volume
            )));
        }
        let spread = quote
            .spread_pct()
            .ok_or_else(|| Rejection::Liquidity("no bid/ask depth".to_string()))?;
        if spread > self.filters.max_spread_pct {
            return Err(Rejection::Liquidity(format!("spread {}%", spread.round_dp(3))));
        }
        Ok(())
    }
}
