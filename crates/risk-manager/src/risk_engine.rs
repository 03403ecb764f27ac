//! Stop placement, R-multiple target ladder and ATR trailing.
//!
//! Every stop movement goes through [`tighten`], so a stop can only ever
//! reduce risk.

use orb_core::config::RiskConfig;
use orb_core::types::{TargetLadder, TargetLeg, Trade, TradeSide};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

/// Initial stop: the tighter of VWAP and the signal candle extreme beyond `buffer`.
pub fn initial_stop(
    side: TradeSide,
    vwap: Decimal,
    candle_high: Decimal,
    candle_low: Decimal,
    buffer: Decimal,
) -> Decimal {
    match side {
        TradeSide::Long => vwap.max(candle_low - buffer),
        TradeSide::Short => vwap.min(candle_high + buffer),
    }
}

/// Scales the entry-to-stop distance by `factor` and re-applies it from entry.
///
/// `factor >= 1` leaves the stop unchanged.
pub fn apply_distance_factor(entry: Decimal, stop: Decimal, factor: Decimal) -> Decimal {
    if factor >= Decimal::ONE || factor < Decimal::ZERO || stop == entry {
        return stop;
    }
    let distance = (entry - stop).abs() * factor;
    if stop < entry {
        entry - distance
    } else {
        entry + distance
    }
}

/// Ratchet: `candidate` if it reduces risk, else `current`.
pub fn tighten(side: TradeSide, current: Decimal, candidate: Decimal) -> Decimal {
    if side.is_tighter(current, candidate) {
        candidate
    } else {
        current
    }
}

/// A stop is usable when it sits strictly on the losing side of entry.
pub fn is_valid_stop(side: TradeSide, entry: Decimal, stop: Decimal) -> bool {
    match side {
        TradeSide::Long => stop < entry,
        TradeSide::Short => stop > entry,
    }
}

/// Floors each leg's share of `quantity`, then repairs rounding so small
/// positions still book partials and at least one share is left for the
/// final leg.
pub fn leg_quantities(quantity: u64, close_pcts: &[Decimal]) -> Vec<u64> {
    let mut legs: Vec<u64> = close_pcts
        .iter()
        .map(|pct| {
            (Decimal::from(quantity) * pct)
                .floor()
                .to_u64()
                .unwrap_or(0)
        })
        .collect();

    if legs.len() >= 2 {
        if quantity >= 2 && legs[0] == 0 && close_pcts[0] > Decimal::ZERO {
            legs[0] = 1;
        }
        if quantity >= 4 && legs[1] == 0 && close_pcts[1] > Decimal::ZERO {
            legs[1] = 1;
        }

        let partial = legs[0] + legs[1];
        if quantity > 0 && partial >= quantity {
            let mut overflow = partial - (quantity - 1);
            let cut = overflow.min(legs[1]);
            legs[1] -= cut;
            overflow -= cut;
            legs[0] -= overflow.min(legs[0]);
        }

        // The last rung carries whatever the partial legs leave.
        if legs.len() > 2 {
            let booked: u64 = legs[..legs.len() - 1].iter().sum();
            if let Some(last) = legs.last_mut() {
                *last = quantity.saturating_sub(booked);
            }
        }
    }

    legs
}

#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Trigger buffer: `multiplier * ATR`, or the fixed amount without ATR.
    pub fn entry_buffer(&self, atr: Option<Decimal>) -> Decimal {
        match atr {
            Some(atr) if self.config.use_atr_buffer && atr > Decimal::ZERO => {
                atr * self.config.atr_buffer_multiplier
            }
            _ => self.config.buffer_amount,
        }
    }

    /// Stop for a new trade, after the distance factor.
    ///
    /// Falls back to VWAP when dynamic stops are off or the candle is unknown.
    pub fn stop_for_entry(
        &self,
        side: TradeSide,
        entry: Decimal,
        vwap: Decimal,
        candle: Option<(Decimal, Decimal)>,
    ) -> Decimal {
        let raw = match candle {
            Some((high, low)) if self.config.use_dynamic_stop => {
                initial_stop(side, vwap, high, low, self.config.dynamic_stop_buffer)
            }
            _ => vwap,
        };
        let stop = apply_distance_factor(entry, raw, self.config.stop_distance_factor);
        debug!(side = %side, entry = %entry, raw_stop = %raw, stop = %stop, "Initial stop computed");
        stop
    }

    pub fn build_target_ladder(&self, side: TradeSide, entry: Decimal, stop: Decimal, quantity: u64) -> TargetLadder {
        let risk = (entry - stop).abs();
        let quantities = leg_quantities(quantity, &self.config.target_close_pcts);
        let legs = self
            .config
            .target_r_multiples
            .iter()
            .zip(&self.config.target_close_pcts)
            .zip(quantities)
            .map(|((r, pct), qty)| TargetLeg {
                r_multiple: *r,
                price: side.toward_profit(entry, risk * r),
                close_pct: *pct,
                quantity: qty,
            })
            .collect();
        TargetLadder { legs }
    }

    pub fn breakeven_due(&self, trade: &Trade, price: Decimal) -> bool {
        trade.r_multiple_at(price) >= self.config.breakeven_at_r
    }

    /// `price -/+ ATR * multiplier` for longs/shorts.
    pub fn trailing_candidate(&self, side: TradeSide, price: Decimal, atr: Decimal) -> Decimal {
        side.toward_loss(price, atr * self.config.atr_trail_multiplier)
    }

    /// New trailing stop if trailing is active at `price` and it tightens.
    pub fn trailing_stop(&self, trade: &Trade, price: Decimal, atr: Option<Decimal>) -> Option<Decimal> {
        if !self.config.use_atr_trailing {
            return None;
        }
        let atr = atr.filter(|a| *a > Decimal::ZERO)?;
        if trade.r_multiple_at(price) < self.config.atr_trail_start_r {
            return None;
        }
        let candidate = self.trailing_candidate(trade.side, price, atr);
        trade.side.is_tighter(trade.stop_price, candidate).then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orb_core::types::{Instrument, NewTrade};

    fn d(v: i64, scale: u32) -> Decimal {
        Decimal::new(v, scale)
    }

    #[test]
    fn test_distance_factor_halves_risk() {
        let stop = apply_distance_factor(d(1500, 0), d(1425, 0), d(5, 1));
        assert_eq!(stop, d(14625, 1));
        // short side mirrors
        let stop = apply_distance_factor(d(1500, 0), d(1575, 0), d(5, 1));
        assert_eq!(stop, d(15375, 1));
    }

    #[test]
    fn test_distance_factor_at_or_above_one_is_noop() {
        assert_eq!(apply_distance_factor(d(1500, 0), d(1425, 0), Decimal::ONE), d(1425, 0));
        assert_eq!(apply_distance_factor(d(1500, 0), d(1425, 0), d(15, 1)), d(1425, 0));
    }

    #[test]
    fn test_initial_stop_takes_tighter_level() {
        // long: vwap 1480 vs low-buffer 1489.95
        let stop = initial_stop(TradeSide::Long, d(1480, 0), d(1505, 0), d(1490, 0), d(5, 2));
        assert_eq!(stop, d(148995, 2));
        // long: vwap closer than candle low
        let stop = initial_stop(TradeSide::Long, d(1495, 0), d(1505, 0), d(1490, 0), d(5, 2));
        assert_eq!(stop, d(1495, 0));
        // short: vwap 1520 vs high+buffer 1510.05
        let stop = initial_stop(TradeSide::Short, d(1520, 0), d(1510, 0), d(1495, 0), d(5, 2));
        assert_eq!(stop, d(151005, 2));
    }

    #[test]
    fn test_reference_ladder_prices() {
        let engine = RiskEngine::new(RiskConfig::default());
        let ladder = engine.build_target_ladder(TradeSide::Long, d(1500, 0), d(14625, 1), 83);
        let prices: Vec<_> = ladder.legs.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![d(151875, 2), d(15375, 1), d(1575, 0)]);
        let qtys: Vec<_> = ladder.legs.iter().map(|l| l.quantity).collect();
        assert_eq!(qtys, vec![20, 41, 22]);
    }

    #[test]
    fn test_short_ladder_goes_down() {
        let engine = RiskEngine::new(RiskConfig::default());
        let ladder = engine.build_target_ladder(TradeSide::Short, d(100, 0), d(102, 0), 10);
        let prices: Vec<_> = ladder.legs.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![d(99, 0), d(98, 0), d(96, 0)]);
    }

    #[test]
    fn test_rounding_repair_small_positions() {
        let pcts = [d(25, 2), d(50, 2), d(25, 2)];
        assert_eq!(leg_quantities(1, &pcts), vec![0, 0, 1]);
        // 2 shares: first leg bumped, second would consume everything
        assert_eq!(leg_quantities(2, &pcts), vec![1, 0, 1]);
        // 3 shares: floor gives 0/1, first bumped
        assert_eq!(leg_quantities(3, &pcts), vec![1, 1, 1]);
        assert_eq!(leg_quantities(4, &pcts), vec![1, 2, 1]);
        assert_eq!(leg_quantities(83, &pcts), vec![20, 41, 22]);
    }

    #[test]
    fn test_rounding_repair_keeps_one_share() {
        let pcts = [d(50, 2), d(50, 2), Decimal::ZERO];
        let legs = leg_quantities(10, &pcts);
        assert_eq!(legs, vec![5, 4, 1]);
        let pcts = [d(90, 2), d(10, 2), Decimal::ZERO];
        assert_eq!(leg_quantities(5, &pcts), vec![4, 0, 1]);
    }

    #[test]
    fn test_tighten_is_a_ratchet() {
        assert_eq!(tighten(TradeSide::Long, d(100, 0), d(99, 0)), d(100, 0));
        assert_eq!(tighten(TradeSide::Long, d(100, 0), d(101, 0)), d(101, 0));
        assert_eq!(tighten(TradeSide::Short, d(100, 0), d(101, 0)), d(100, 0));
        assert_eq!(tighten(TradeSide::Short, d(100, 0), d(99, 0)), d(99, 0));
    }

    #[test]
    fn test_entry_buffer_falls_back_without_atr() {
        let engine = RiskEngine::new(RiskConfig::default());
        assert_eq!(engine.entry_buffer(Some(d(5, 0))), d(1, 0));
        assert_eq!(engine.entry_buffer(None), d(10, 2));
        assert_eq!(engine.entry_buffer(Some(Decimal::ZERO)), d(10, 2));
    }

    #[test]
    fn test_stop_for_entry_without_candle_uses_vwap() {
        let engine = RiskEngine::new(RiskConfig::default());
        let stop = engine.stop_for_entry(TradeSide::Long, d(1500, 0), d(1425, 0), None);
        assert_eq!(stop, d(14625, 1));
        assert!(is_valid_stop(TradeSide::Long, d(1500, 0), stop));
        assert!(!is_valid_stop(TradeSide::Long, d(1500, 0), d(1500, 0)));
    }

    #[test]
    fn test_trailing_starts_at_trigger_and_only_tightens() {
        let engine = RiskEngine::new(RiskConfig::default());
        let trade = Trade::open(NewTrade {
            instrument: Instrument::nse("INFY"),
            token: 1,
            side: TradeSide::Long,
            trade_number: 1,
            entry_price: d(1500, 0),
            quantity: 83,
            stop_price: d(14625, 1),
            ladder: TargetLadder::default(),
            partial_booking: true,
            opened_at: Utc::now(),
        });
        let atr = Some(d(10, 0));
        // 1.4R: not yet
        assert_eq!(engine.trailing_stop(&trade, d(15525, 1), atr), None);
        // 1.6R = 1560: candidate 1560 - 12 = 1548
        assert_eq!(engine.trailing_stop(&trade, d(1560, 0), atr), Some(d(1548, 0)));
        // huge ATR would loosen: rejected
        assert_eq!(engine.trailing_stop(&trade, d(1560, 0), Some(d(100, 0))), None);
        assert_eq!(engine.trailing_stop(&trade, d(1560, 0), None), None);
    }
}
