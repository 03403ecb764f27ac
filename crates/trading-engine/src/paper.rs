//! Paper broker: fills market and limit orders immediately and keeps net
//! positions in memory. Stop-market orders rest until cancelled.

use async_trait::async_trait;
use dashmap::DashMap;
use orb_core::api::Broker;
use orb_core::types::{BrokerPosition, Instrument, OrderKind, OrderRequest, OrderSide};
use orb_core::{Error, Result};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    quantity: i64,
    average_price: Decimal,
}

/// A resting protective stop.
#[derive(Debug, Clone, PartialEq)]
pub struct RestingStop {
    pub order_id: String,
    pub request: OrderRequest,
}

pub struct PaperBroker {
    balance: Mutex<Decimal>,
    positions: DashMap<Instrument, PaperPosition>,
    stops: DashMap<String, RestingStop>,
    /// Every accepted order, in submission order.
    orders: Mutex<Vec<(String, OrderRequest)>>,
    /// Last price per instrument, used to fill market orders.
    marks: DashMap<Instrument, Decimal>,
    next_id: AtomicU64,
    /// Number of upcoming `place_order` calls to reject.
    fail_next: AtomicU32,
}

impl PaperBroker {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(balance),
            positions: DashMap::new(),
            stops: DashMap::new(),
            orders: Mutex::new(Vec::new()),
            marks: DashMap::new(),
            next_id: AtomicU64::new(1),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn set_balance(&self, balance: Decimal) {
        if let Ok(mut b) = self.balance.lock() {
            *b = balance;
        }
    }

    /// Price used for market fills of `instrument`.
    pub fn mark(&self, instrument: &Instrument, price: Decimal) {
        self.marks.insert(instrument.clone(), price);
    }

    /// Reject the next `count` order placements.
    pub fn fail_next_orders(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn orders(&self) -> Vec<(String, OrderRequest)> {
        self.orders.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn open_stops(&self) -> Vec<RestingStop> {
        let mut stops: Vec<_> = self.stops.iter().map(|s| s.value().clone()).collect();
        stops.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        stops
    }

    pub fn net_quantity(&self, instrument: &Instrument) -> i64 {
        self.positions.get(instrument).map(|p| p.quantity).unwrap_or(0)
    }

    fn fill_price(&self, order: &OrderRequest) -> Decimal {
        match order.kind {
            OrderKind::Limit => order.price.unwrap_or_default(),
            _ => self
                .marks
                .get(&order.instrument)
                .map(|p| *p)
                .or(order.price)
                .unwrap_or_default(),
        }
    }

    fn apply_fill(&self, order: &OrderRequest, price: Decimal) {
        let signed = match order.side {
            OrderSide::Buy => order.quantity as i64,
            OrderSide::Sell => -(order.quantity as i64),
        };
        let mut pos = self.positions.entry(order.instrument.clone()).or_default();
        let before = pos.quantity;
        let after = before + signed;
        // Average price only moves when the position grows.
        if before == 0 || before.signum() == signed.signum() {
            let total = Decimal::from(before.abs()) * pos.average_price
                + Decimal::from(signed.abs()) * price;
            pos.average_price = total / Decimal::from(after.abs().max(1));
        } else if after != 0 && after.signum() != before.signum() {
            pos.average_price = price;
        }
        pos.quantity = after;
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, order: &OrderRequest) -> Result<String> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::broker(format!("paper rejection for {}", order.tag)));
        }
        if order.quantity == 0 {
            return Err(Error::Order {
                message: "quantity must be positive".to_string(),
            });
        }

        let order_id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut orders) = self.orders.lock() {
            orders.push((order_id.clone(), order.clone()));
        }

        if order.kind == OrderKind::StopLossMarket {
            debug!(order_id = %order_id, trigger = ?order.trigger_price, "Paper stop resting");
            self.stops.insert(
                order_id.clone(),
                RestingStop {
                    order_id: order_id.clone(),
                    request: order.clone(),
                },
            );
        } else {
            let price = self.fill_price(order);
            self.apply_fill(order, price);
            info!(
                order_id = %order_id,
                instrument = %order.instrument,
                side = ?order.side,
                quantity = order.quantity,
                price = %price,
                "Paper fill"
            );
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        Ok(self.stops.remove(order_id).is_some())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self
            .positions
            .iter()
            .filter(|p| p.quantity != 0)
            .map(|p| BrokerPosition {
                instrument: p.key().clone(),
                quantity: p.quantity,
                average_price: p.average_price,
                product: orb_core::types::ProductType::Mis,
            })
            .collect())
    }

    async fn account_balance(&self) -> Result<Decimal> {
        self.balance
            .lock()
            .map(|b| *b)
            .map_err(|_| Error::broker("balance lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_orders_net_out() {
        let broker = PaperBroker::new(Decimal::new(50000, 0));
        let infy = Instrument::nse("INFY");
        broker.mark(&infy, Decimal::new(1500, 0));

        broker
            .place_order(&OrderRequest::market("t:entry", infy.clone(), OrderSide::Buy, 83))
            .await
            .unwrap();
        broker
            .place_order(&OrderRequest::market("t:leg1", infy.clone(), OrderSide::Sell, 20))
            .await
            .unwrap();
        assert_eq!(broker.net_quantity(&infy), 63);

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].average_price, Decimal::new(1500, 0));
    }

    #[tokio::test]
    async fn test_stops_rest_until_cancelled() {
        let broker = PaperBroker::new(Decimal::ZERO);
        let infy = Instrument::nse("INFY");
        let id = broker
            .place_order(&OrderRequest::stop_market(
                "t:stop0",
                infy.clone(),
                OrderSide::Sell,
                83,
                Decimal::new(14625, 1),
            ))
            .await
            .unwrap();
        assert_eq!(broker.net_quantity(&infy), 0);
        assert_eq!(broker.open_stops().len(), 1);
        assert!(broker.cancel_order(&id).await.unwrap());
        assert!(!broker.cancel_order(&id).await.unwrap());
        assert!(broker.open_stops().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = PaperBroker::new(Decimal::ZERO);
        broker.fail_next_orders(1);
        let order = OrderRequest::market("t:x", Instrument::nse("TCS"), OrderSide::Buy, 1);
        assert!(broker.place_order(&order).await.is_err());
        assert!(broker.place_order(&order).await.is_ok());
    }
}
