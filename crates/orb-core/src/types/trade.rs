//! Trade lifecycle types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Instrument, OrderSide};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            TradeSide::Long => OrderSide::Buy,
            TradeSide::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// Per-share move from `entry` to `price`, positive when in profit.
    pub fn profit_per_share(&self, entry: Decimal, price: Decimal) -> Decimal {
        match self {
            TradeSide::Long => price - entry,
            TradeSide::Short => entry - price,
        }
    }

    pub fn pnl(&self, entry: Decimal, exit: Decimal, quantity: u64) -> Decimal {
        self.profit_per_share(entry, exit) * Decimal::from(quantity)
    }

    /// Moves `distance` from `from` in the profitable direction.
    pub fn toward_profit(&self, from: Decimal, distance: Decimal) -> Decimal {
        match self {
            TradeSide::Long => from + distance,
            TradeSide::Short => from - distance,
        }
    }

    /// Moves `distance` from `from` in the losing direction.
    pub fn toward_loss(&self, from: Decimal, distance: Decimal) -> Decimal {
        match self {
            TradeSide::Long => from - distance,
            TradeSide::Short => from + distance,
        }
    }

    pub fn target_touched(&self, price: Decimal, target: Decimal) -> bool {
        match self {
            TradeSide::Long => price >= target,
            TradeSide::Short => price <= target,
        }
    }

    pub fn stop_touched(&self, price: Decimal, stop: Decimal) -> bool {
        match self {
            TradeSide::Long => price <= stop,
            TradeSide::Short => price >= stop,
        }
    }

    /// True when `candidate` reduces risk relative to `current`.
    pub fn is_tighter(&self, current: Decimal, candidate: Decimal) -> bool {
        match self {
            TradeSide::Long => candidate > current,
            TradeSide::Short => candidate < current,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Long => f.write_str("LONG"),
            TradeSide::Short => f.write_str("SHORT"),
        }
    }
}

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    Open,
    Stage1Done,
    Stage2Done,
    Closed,
}

impl TradeState {
    fn rank(&self) -> u8 {
        match self {
            TradeState::Open => 0,
            TradeState::Stage1Done => 1,
            TradeState::Stage2Done => 2,
            TradeState::Closed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStage {
    Stage1,
    Stage2,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    EndOfDay,
    CircuitBreaker,
    Manual,
    StopLoss,
    FinalTarget,
}

/// Why a protective stop moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMove {
    Breakeven,
    Stage2Lock,
    Trailing,
}

/// One rung of the R-multiple target ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLeg {
    pub r_multiple: Decimal,
    pub price: Decimal,
    pub close_pct: Decimal,
    pub quantity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetLadder {
    pub legs: Vec<TargetLeg>,
}

impl TargetLadder {
    pub fn leg(&self, index: usize) -> Option<&TargetLeg> {
        self.legs.get(index)
    }

    pub fn final_leg(&self) -> Option<&TargetLeg> {
        self.legs.last()
    }
}

/// A booked exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub stage: ExitStage,
    pub quantity: u64,
    pub price: Decimal,
    pub pnl: Decimal,
    pub at: DateTime<Utc>,
}

/// Parameters for opening a trade.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub instrument: Instrument,
    pub token: u64,
    pub side: TradeSide,
    pub trade_number: u32,
    pub entry_price: Decimal,
    pub quantity: u64,
    pub stop_price: Decimal,
    pub ladder: TargetLadder,
    pub partial_booking: bool,
    pub opened_at: DateTime<Utc>,
}

/// An open or finished trade.
///
/// Accounting invariant: `remaining_quantity + exited_quantity() == initial_quantity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub instrument: Instrument,
    pub token: u64,
    pub side: TradeSide,
    /// 1-based ordinal of this trade within the session.
    pub trade_number: u32,
    pub entry_price: Decimal,
    pub initial_quantity: u64,
    pub remaining_quantity: u64,
    pub initial_stop: Decimal,
    pub stop_price: Decimal,
    /// R: distance from entry to the initial stop.
    pub risk_per_share: Decimal,
    pub ladder: TargetLadder,
    pub partial_booking: bool,
    pub state: TradeState,
    pub breakeven_locked: bool,
    pub fills: Vec<LegFill>,
    pub realized_pnl: Decimal,
    pub last_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub entry_order_id: Option<String>,
    pub stop_order_id: Option<String>,
    /// Bumped whenever a replacement protective stop is placed.
    pub stop_revision: u32,
}

impl Trade {
    pub fn open(params: NewTrade) -> Self {
        let risk_per_share = (params.entry_price - params.stop_price).abs();
        Self {
            id: Uuid::new_v4(),
            instrument: params.instrument,
            token: params.token,
            side: params.side,
            trade_number: params.trade_number,
            entry_price: params.entry_price,
            initial_quantity: params.quantity,
            remaining_quantity: params.quantity,
            initial_stop: params.stop_price,
            stop_price: params.stop_price,
            risk_per_share,
            ladder: params.ladder,
            partial_booking: params.partial_booking,
            state: TradeState::Open,
            breakeven_locked: false,
            fills: Vec::new(),
            realized_pnl: Decimal::ZERO,
            last_price: params.entry_price,
            opened_at: params.opened_at,
            closed_at: None,
            close_reason: None,
            entry_order_id: None,
            stop_order_id: None,
            stop_revision: 0,
        }
    }

    pub fn exited_quantity(&self) -> u64 {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.state == TradeState::Closed
    }

    pub fn profit_per_share(&self, price: Decimal) -> Decimal {
        self.side.profit_per_share(self.entry_price, price)
    }

    /// Profit at `price` measured in multiples of R. Zero when R is zero.
    pub fn r_multiple_at(&self, price: Decimal) -> Decimal {
        if self.risk_per_share.is_zero() {
            return Decimal::ZERO;
        }
        self.profit_per_share(price) / self.risk_per_share
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.side.pnl(self.entry_price, price, self.remaining_quantity)
    }

    /// Books `quantity` shares at `price`. The quantity is clamped to what remains.
    pub fn book(&mut self, stage: ExitStage, quantity: u64, price: Decimal, at: DateTime<Utc>) -> LegFill {
        let quantity = quantity.min(self.remaining_quantity);
        let pnl = self.side.pnl(self.entry_price, price, quantity);
        self.remaining_quantity -= quantity;
        self.realized_pnl += pnl;
        let fill = LegFill {
            stage,
            quantity,
            price,
            pnl,
            at,
        };
        self.fills.push(fill.clone());
        debug_assert_eq!(
            self.remaining_quantity + self.exited_quantity(),
            self.initial_quantity
        );
        fill
    }

    /// Books everything that remains and closes the trade.
    pub fn close(&mut self, price: Decimal, reason: CloseReason, at: DateTime<Utc>) -> LegFill {
        let fill = self.book(ExitStage::Final, self.remaining_quantity, price, at);
        self.state = TradeState::Closed;
        self.closed_at = Some(at);
        self.close_reason = Some(reason);
        fill
    }

    /// Moves to `next` if it is ahead of the current state.
    pub fn advance(&mut self, next: TradeState) -> bool {
        if next.rank() > self.state.rank() {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Applies `candidate` only when it reduces risk. Returns whether the stop moved.
    pub fn tighten_stop(&mut self, candidate: Decimal) -> bool {
        if self.side.is_tighter(self.stop_price, candidate) {
            self.stop_price = candidate;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_trade() -> Trade {
        Trade::open(NewTrade {
            instrument: Instrument::nse("INFY"),
            token: 1,
            side: TradeSide::Long,
            trade_number: 1,
            entry_price: Decimal::new(1500, 0),
            quantity: 10,
            stop_price: Decimal::new(14625, 1),
            ladder: TargetLadder::default(),
            partial_booking: true,
            opened_at: Utc::now(),
        })
    }

    #[test]
    fn test_book_keeps_accounting() {
        let mut trade = long_trade();
        let fill = trade.book(ExitStage::Stage1, 3, Decimal::new(151875, 2), Utc::now());
        assert_eq!(fill.pnl, Decimal::new(5625, 2));
        assert_eq!(trade.remaining_quantity, 7);
        assert_eq!(trade.exited_quantity(), 3);

        let fill = trade.close(Decimal::new(1490, 0), CloseReason::StopLoss, Utc::now());
        assert_eq!(fill.quantity, 7);
        assert_eq!(trade.remaining_quantity, 0);
        assert_eq!(trade.realized_pnl, Decimal::new(5625, 2) - Decimal::new(70, 0));
        assert!(trade.is_closed());
    }

    #[test]
    fn test_book_clamps_to_remaining() {
        let mut trade = long_trade();
        let fill = trade.book(ExitStage::Stage1, 50, Decimal::new(1510, 0), Utc::now());
        assert_eq!(fill.quantity, 10);
        assert_eq!(trade.remaining_quantity, 0);
    }

    #[test]
    fn test_stop_never_loosens() {
        let mut trade = long_trade();
        assert!(!trade.tighten_stop(Decimal::new(1450, 0)));
        assert!(trade.tighten_stop(Decimal::new(1500, 0)));
        assert!(!trade.tighten_stop(Decimal::new(1499, 0)));
        assert_eq!(trade.stop_price, Decimal::new(1500, 0));
    }

    #[test]
    fn test_short_side_math() {
        let side = TradeSide::Short;
        let entry = Decimal::new(200, 0);
        assert_eq!(side.pnl(entry, Decimal::new(190, 0), 5), Decimal::new(50, 0));
        assert!(side.target_touched(Decimal::new(190, 0), Decimal::new(195, 0)));
        assert!(side.stop_touched(Decimal::new(205, 0), Decimal::new(204, 0)));
        assert!(side.is_tighter(Decimal::new(210, 0), Decimal::new(205, 0)));
    }

    #[test]
    fn test_state_only_advances() {
        let mut trade = long_trade();
        assert!(trade.advance(TradeState::Stage1Done));
        assert!(!trade.advance(TradeState::Open));
        assert_eq!(trade.state, TradeState::Stage1Done);
    }

    #[test]
    fn test_r_multiple() {
        let trade = long_trade();
        assert_eq!(trade.r_multiple_at(Decimal::new(15375, 1)), Decimal::ONE);
    }
}
