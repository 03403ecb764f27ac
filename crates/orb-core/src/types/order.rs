//! Order types for broker execution.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Type of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    /// Stop-loss market (SL-M): becomes a market order once the trigger trades.
    StopLossMarket,
}

/// Margin product the order is placed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductType {
    /// Intraday margin product, squared off the same day.
    Mis,
    /// Cash-and-carry delivery.
    Cnc,
}

/// Current status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted by the broker.
    Placed,
    /// Rejected by the broker or failed in transit.
    Rejected,
    /// Cancelled before execution.
    Cancelled,
}

/// Order sent to the broker collaborator.
///
/// `tag` is a client-side idempotency key. Retries of the same logical
/// order reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub tag: String,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: u64,
    pub kind: OrderKind,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub product: ProductType,
}

impl OrderRequest {
    pub fn market(tag: impl Into<String>, instrument: Instrument, side: OrderSide, quantity: u64) -> Self {
        Self {
            tag: tag.into(),
            instrument,
            side,
            quantity,
            kind: OrderKind::Market,
            price: None,
            trigger_price: None,
            product: ProductType::Mis,
        }
    }

    pub fn limit(
        tag: impl Into<String>,
        instrument: Instrument,
        side: OrderSide,
        quantity: u64,
        price: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::Limit,
            price: Some(price),
            ..Self::market(tag, instrument, side, quantity)
        }
    }

    pub fn stop_market(
        tag: impl Into<String>,
        instrument: Instrument,
        side: OrderSide,
        quantity: u64,
        trigger_price: Decimal,
    ) -> Self {
        Self {
            kind: OrderKind::StopLossMarket,
            trigger_price: Some(trigger_price),
            ..Self::market(tag, instrument, side, quantity)
        }
    }
}

/// Net position reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: Instrument,
    /// Signed net quantity: positive long, negative short.
    pub quantity: i64,
    pub average_price: Decimal,
    pub product: ProductType,
}

/// Outcome of submitting an order through the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub tag: String,
    pub order_id: Option<String>,
    pub status: OrderStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn success(tag: impl Into<String>, order_id: String, attempts: u32) -> Self {
        Self {
            tag: tag.into(),
            order_id: Some(order_id),
            status: OrderStatus::Placed,
            attempts,
            error: None,
            executed_at: Utc::now(),
        }
    }

    pub fn rejected(tag: impl Into<String>, error: String, attempts: u32) -> Self {
        Self {
            tag: tag.into(),
            order_id: None,
            status: OrderStatus::Rejected,
            attempts,
            error: Some(error),
            executed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OrderStatus::Placed
    }
}
