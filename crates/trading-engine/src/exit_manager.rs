//! Trade exit state machine: `OPEN -> STAGE1_DONE -> STAGE2_DONE -> CLOSED`.
//!
//! [`ExitManager::step`] is pure: it takes the current trade and one tick of
//! input and returns the next trade plus the actions the session must carry
//! out (orders, stop replacement, persistence). Accounting always advances,
//! whether or not the resulting orders succeed.

use chrono::{DateTime, Utc};
use orb_core::types::{CloseReason, ExitStage, LegFill, StopMove, Trade, TradeState};
use risk_manager::RiskEngine;
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Inputs for one exit-management tick.
#[derive(Debug, Clone)]
pub struct TickInput {
    pub now: DateTime<Utc>,
    /// Latest traded price. `None` on a data gap.
    pub price: Option<Decimal>,
    pub eod: bool,
    pub breaker_tripped: bool,
    /// Explicit liquidation requested by the operator.
    pub liquidate: bool,
    pub atr: Option<Decimal>,
}

impl TickInput {
    pub fn at_price(now: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            now,
            price: Some(price),
            eod: false,
            breaker_tripped: false,
            liquidate: false,
            atr: None,
        }
    }
}

/// Side effect requested by a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    /// A partial leg completed. `fill` is `None` when the leg rounded to zero shares.
    StageComplete { stage: ExitStage, fill: Option<LegFill> },
    MoveStop {
        from: Decimal,
        to: Decimal,
        reason: StopMove,
    },
    Close { reason: CloseReason, fill: LegFill },
}

impl ExitAction {
    pub fn fill(&self) -> Option<&LegFill> {
        match self {
            ExitAction::StageComplete { fill, .. } => fill.as_ref(),
            ExitAction::Close { fill, .. } => Some(fill),
            ExitAction::MoveStop { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitManager {
    risk: RiskEngine,
}

impl ExitManager {
    pub fn new(risk: RiskEngine) -> Self {
        Self { risk }
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    /// Advance `trade` by one tick.
    pub fn step(&self, trade: &Trade, tick: &TickInput) -> (Trade, Vec<ExitAction>) {
        let mut next = trade.clone();
        let mut actions = Vec::new();
        if next.is_closed() {
            return (next, actions);
        }

        if let Some(price) = tick.price {
            next.last_price = price;
        }
        let mark = next.last_price;

        if tick.eod {
            Self::close(&mut next, &mut actions, mark, CloseReason::EndOfDay, tick.now);
            return (next, actions);
        }
        if tick.breaker_tripped || tick.liquidate {
            let reason = if tick.breaker_tripped {
                CloseReason::CircuitBreaker
            } else {
                CloseReason::Manual
            };
            Self::close(&mut next, &mut actions, mark, reason, tick.now);
            return (next, actions);
        }

        let Some(price) = tick.price else {
            debug!(trade_id = %next.id, "No price this tick");
            return (next, actions);
        };

        if next.partial_booking && next.state == TradeState::Open {
            self.book_stage(&mut next, &mut actions, 0, price, tick.now);
        }

        if !next.breakeven_locked && self.risk.breakeven_due(&next, price) {
            next.breakeven_locked = true;
            let entry_price = next.entry_price;
            Self::move_stop(&mut next, &mut actions, entry_price, StopMove::Breakeven);
        }

        if next.partial_booking && next.state == TradeState::Stage1Done {
            self.book_stage(&mut next, &mut actions, 1, price, tick.now);
        }

        if let Some(candidate) = self.risk.trailing_stop(&next, price, tick.atr) {
            Self::move_stop(&mut next, &mut actions, candidate, StopMove::Trailing);
        }

        if next.side.stop_touched(price, next.stop_price) {
            Self::close(&mut next, &mut actions, price, CloseReason::StopLoss, tick.now);
            return (next, actions);
        }

        if !next.partial_booking {
            let final_target = next.ladder.final_leg().map(|l| l.price);
            if final_target.is_some_and(|t| next.side.target_touched(price, t)) {
                Self::close(&mut next, &mut actions, price, CloseReason::FinalTarget, tick.now);
            }
        }

        (next, actions)
    }

    /// Book ladder leg `index` if its target is touched. A leg never takes
    /// the last share.
    fn book_stage(
        &self,
        trade: &mut Trade,
        actions: &mut Vec<ExitAction>,
        index: usize,
        price: Decimal,
        now: DateTime<Utc>,
    ) {
        let Some(leg) = trade.ladder.leg(index).cloned() else {
            return;
        };
        if !trade.side.target_touched(price, leg.price) {
            return;
        }

        let (stage, next_state) = if index == 0 {
            (ExitStage::Stage1, TradeState::Stage1Done)
        } else {
            (ExitStage::Stage2, TradeState::Stage2Done)
        };
        let quantity = leg.quantity.min(trade.remaining_quantity.saturating_sub(1));
        let fill = (quantity > 0).then(|| trade.book(stage, quantity, price, now));
        trade.advance(next_state);

        info!(
            trade_id = %trade.id,
            symbol = %trade.instrument,
            stage = ?stage,
            quantity,
            price = %price,
            pnl = %fill.as_ref().map(|f| f.pnl).unwrap_or_default(),
            remaining = trade.remaining_quantity,
            "Target leg booked"
        );
        actions.push(ExitAction::StageComplete { stage, fill });

        if stage == ExitStage::Stage2 {
            Self::move_stop(trade, actions, trade.entry_price, StopMove::Stage2Lock);
        }
    }

    fn move_stop(trade: &mut Trade, actions: &mut Vec<ExitAction>, candidate: Decimal, reason: StopMove) {
        let from = trade.stop_price;
        if trade.tighten_stop(candidate) {
            info!(
                trade_id = %trade.id,
                symbol = %trade.instrument,
                from = %from,
                to = %candidate,
                reason = ?reason,
                "Stop moved"
            );
            actions.push(ExitAction::MoveStop {
                from,
                to: candidate,
                reason,
            });
        }
    }

    fn close(
        trade: &mut Trade,
        actions: &mut Vec<ExitAction>,
        price: Decimal,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) {
        let fill = trade.close(price, reason, now);
        info!(
            trade_id = %trade.id,
            symbol = %trade.instrument,
            reason = ?reason,
            quantity = fill.quantity,
            price = %price,
            pnl = %fill.pnl,
            realized_pnl = %trade.realized_pnl,
            "Trade closed"
        );
        actions.push(ExitAction::Close { reason, fill });
    }
}
