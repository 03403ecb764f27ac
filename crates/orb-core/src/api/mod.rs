//! Collaborator interfaces for market data and order routing.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{BrokerPosition, Candle, Instrument, Interval, OrderRequest, Quote};
use crate::Result;

pub use memory::InMemoryMarket;

/// Quotes and historical candles.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn quote(&self, instrument: &Instrument) -> Result<Quote>;

    /// Candles with `from <= time <= to`, oldest first.
    async fn historical_candles(
        &self,
        token: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<Candle>>;

    async fn instrument_token(&self, instrument: &Instrument) -> Result<Option<u64>>;
}

/// Order routing and account state.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Returns the broker order id.
    async fn place_order(&self, order: &OrderRequest) -> Result<String>;

    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn account_balance(&self) -> Result<Decimal>;
}
