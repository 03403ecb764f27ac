//! Trade persistence.
//!
//! Store failures never block trading: callers log and continue.

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CloseReason, Instrument, LegFill, Trade, TradeSide, TradeState};
use crate::Result;

pub use jsonl::JsonlTradeStore;
pub use memory::MemoryTradeStore;

/// Persisted projection of a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub instrument: Instrument,
    pub side: TradeSide,
    pub trade_number: u32,
    pub entry_price: Decimal,
    pub quantity: u64,
    pub remaining_quantity: u64,
    pub stop_price: Decimal,
    pub targets: Vec<Decimal>,
    pub state: TradeState,
    pub realized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    #[serde(default)]
    pub fills: Vec<LegFill>,
}

impl From<&Trade> for TradeRecord {
    fn from(trade: &Trade) -> Self {
        Self {
            id: trade.id,
            instrument: trade.instrument.clone(),
            side: trade.side,
            trade_number: trade.trade_number,
            entry_price: trade.entry_price,
            quantity: trade.initial_quantity,
            remaining_quantity: trade.remaining_quantity,
            stop_price: trade.stop_price,
            targets: trade.ladder.legs.iter().map(|l| l.price).collect(),
            state: trade.state,
            realized_pnl: trade.realized_pnl,
            opened_at: trade.opened_at,
            closed_at: trade.closed_at,
            close_reason: trade.close_reason,
            fills: trade.fills.clone(),
        }
    }
}

/// Partial update. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub state: Option<TradeState>,
    pub remaining_quantity: Option<u64>,
    pub stop_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub fill: Option<LegFill>,
}

impl TradeUpdate {
    /// Snapshot of the mutable fields of `trade`, plus an optional new fill.
    pub fn from_trade(trade: &Trade, fill: Option<LegFill>) -> Self {
        Self {
            state: Some(trade.state),
            remaining_quantity: Some(trade.remaining_quantity),
            stop_price: Some(trade.stop_price),
            realized_pnl: Some(trade.realized_pnl),
            closed_at: trade.closed_at,
            close_reason: trade.close_reason,
            fill,
        }
    }

    pub fn apply(&self, record: &mut TradeRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(remaining) = self.remaining_quantity {
            record.remaining_quantity = remaining;
        }
        if let Some(stop) = self.stop_price {
            record.stop_price = stop;
        }
        if let Some(pnl) = self.realized_pnl {
            record.realized_pnl = pnl;
        }
        if self.closed_at.is_some() {
            record.closed_at = self.closed_at;
        }
        if self.close_reason.is_some() {
            record.close_reason = self.close_reason;
        }
        if let Some(fill) = &self.fill {
            record.fills.push(fill.clone());
        }
    }
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn create_trade(&self, record: &TradeRecord) -> Result<Uuid>;

    /// Returns false when the trade is unknown to the store.
    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<bool>;
}
