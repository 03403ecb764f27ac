//! Order execution: entry, exit and protective-stop placement.
//!
//! Every order carries an idempotency tag. A tag that was already accepted
//! returns the existing order id instead of submitting again, so a retried
//! exit can never double-sell.

use anyhow::Result;
use dashmap::DashMap;
use orb_core::api::Broker;
use orb_core::config::ExecutionConfig;
use orb_core::retry::{DependencyHealth, RetryPolicy};
use orb_core::types::{ExecutionReport, Instrument, OrderRequest, OrderSide, TradeSide};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const BROKER: &str = "broker";

/// Metrics for order execution.
#[derive(Debug, Default, Clone)]
pub struct ExecutionMetrics {
    pub orders_submitted: u64,
    pub orders_placed: u64,
    pub orders_rejected: u64,
    pub duplicate_tags: u64,
    pub retries: u64,
    pub cancels: u64,
    pub avg_latency_us: u64,
}

/// Configuration for the order executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub use_limit_orders: bool,
    /// Limit price offset from the signal price.
    pub limit_order_buffer: Decimal,
    pub entry_retry: RetryPolicy,
    pub exit_retry: RetryPolicy,
    pub failure_threshold: u32,
    pub backoff: Duration,
}

impl From<&ExecutionConfig> for ExecutorConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            use_limit_orders: config.use_limit_orders,
            limit_order_buffer: config.limit_order_buffer,
            entry_retry: RetryPolicy::no_retry(),
            exit_retry: RetryPolicy::new(
                config.exit_max_attempts,
                Duration::from_millis(config.retry_base_delay_ms),
                Duration::from_millis(config.retry_max_delay_ms),
            ),
            failure_threshold: config.failure_threshold,
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    config: ExecutorConfig,
    /// Accepted tags and their broker order ids.
    placed: DashMap<String, String>,
    health: DependencyHealth,
    metrics: std::sync::RwLock<ExecutionMetrics>,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn Broker>, config: ExecutorConfig) -> Self {
        let health = DependencyHealth::new(config.failure_threshold, config.backoff);
        Self {
            broker,
            config,
            placed: DashMap::new(),
            health,
            metrics: std::sync::RwLock::new(ExecutionMetrics::default()),
        }
    }

    /// Price an entry is expected to fill at: the limit price when limit
    /// orders are on, else `price`.
    pub fn entry_price(&self, side: TradeSide, price: Decimal) -> Decimal {
        if !self.config.use_limit_orders {
            return price;
        }
        match side.entry_order_side() {
            OrderSide::Buy => price + self.config.limit_order_buffer,
            OrderSide::Sell => price - self.config.limit_order_buffer,
        }
    }

    /// Entry order for a signal: a limit at `price +/- buffer`, or market.
    pub fn entry_order(
        &self,
        tag: impl Into<String>,
        instrument: Instrument,
        side: TradeSide,
        quantity: u64,
        price: Decimal,
    ) -> OrderRequest {
        let order_side = side.entry_order_side();
        if self.config.use_limit_orders {
            let limit = self.entry_price(side, price);
            OrderRequest::limit(tag, instrument, order_side, quantity, limit)
        } else {
            OrderRequest::market(tag, instrument, order_side, quantity)
        }
    }

    /// Consecutive failed submissions. Orders are never skipped on failures.
    pub fn broker_failures(&self) -> u32 {
        self.health.consecutive_failures(BROKER)
    }

    /// Place an entry order. Entries are never retried.
    pub async fn place_entry(&self, order: OrderRequest) -> ExecutionReport {
        let policy = self.config.entry_retry;
        self.submit(order, policy, "entry order").await
    }

    /// Place an exit order with the exit retry policy.
    pub async fn place_exit(&self, order: OrderRequest) -> ExecutionReport {
        let policy = self.config.exit_retry;
        self.submit(order, policy, "exit order").await
    }

    /// Cancel an order. Failures are logged and reported as `false`.
    pub async fn cancel(&self, order_id: &str) -> bool {
        match self.broker.cancel_order(order_id).await {
            Ok(cancelled) => {
                if let Ok(mut m) = self.metrics.write() {
                    m.cancels += 1;
                }
                cancelled
            }
            Err(e) => {
                warn!(order_id, error = %e, "Failed to cancel order");
                false
            }
        }
    }

    /// Cancel the previous protective stop (if any) and place `stop`.
    ///
    /// A failed cancel only warns. Returns the new stop's order id, or `None`
    /// when the position is left to the software stop.
    pub async fn replace_stop(&self, previous: Option<&str>, stop: OrderRequest) -> Option<String> {
        if let Some(previous) = previous {
            if !self.cancel(previous).await {
                warn!(order_id = previous, "Previous stop not cancelled, placing replacement anyway");
            }
        }
        let trigger = stop.trigger_price;
        let report = self.place_exit(stop).await;
        if report.is_success() {
            debug!(tag = %report.tag, trigger = ?trigger, "Protective stop placed");
            report.order_id
        } else {
            warn!(
                tag = %report.tag,
                error = ?report.error,
                "Protective stop rejected, monitoring with software stop only"
            );
            None
        }
    }

    /// Close every open broker position with market orders.
    pub async fn flatten_all(&self, tag_prefix: &str) -> Result<Vec<ExecutionReport>> {
        let positions = self
            .broker
            .positions()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to fetch positions: {}", e))?;

        let mut reports = Vec::new();
        for position in positions.into_iter().filter(|p| p.quantity != 0) {
            let side = if position.quantity > 0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            let order = OrderRequest::market(
                format!("{tag_prefix}:{}", position.instrument),
                position.instrument.clone(),
                side,
                position.quantity.unsigned_abs(),
            );
            let report = self.place_exit(order).await;
            if !report.is_success() {
                error!(
                    instrument = %position.instrument,
                    quantity = position.quantity,
                    error = ?report.error,
                    "Failed to flatten position"
                );
            }
            reports.push(report);
        }
        info!(count = reports.len(), "Flattened broker positions");
        Ok(reports)
    }

    /// Broker cash balance, or `None` when it cannot be fetched.
    pub async fn account_balance(&self) -> Option<Decimal> {
        match self.broker.account_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!(error = %e, "Failed to fetch account balance");
                None
            }
        }
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics.read().map(|m| m.clone()).unwrap_or_default()
    }

    async fn submit(&self, order: OrderRequest, policy: RetryPolicy, what: &str) -> ExecutionReport {
        if let Some(existing) = self.placed.get(&order.tag) {
            debug!(tag = %order.tag, order_id = %*existing, "Order tag already placed");
            if let Ok(mut m) = self.metrics.write() {
                m.duplicate_tags += 1;
            }
            return ExecutionReport::success(order.tag.clone(), existing.clone(), 0);
        }

        let start = std::time::Instant::now();
        let broker = &self.broker;
        let order_ref = &order;
        let (result, attempts) = policy
            .run(what, |_| async move { broker.place_order(order_ref).await })
            .await;
        let latency_us = start.elapsed().as_micros() as u64;

        if let Ok(mut m) = self.metrics.write() {
            m.orders_submitted += 1;
            m.retries += u64::from(attempts.saturating_sub(1));
            let n = m.orders_submitted;
            m.avg_latency_us = (m.avg_latency_us * (n - 1) + latency_us) / n;
        }

        match result {
            Ok(order_id) => {
                self.health.record_success(BROKER);
                self.placed.insert(order.tag.clone(), order_id.clone());
                if let Ok(mut m) = self.metrics.write() {
                    m.orders_placed += 1;
                }
                info!(
                    tag = %order.tag,
                    order_id = %order_id,
                    instrument = %order.instrument,
                    side = ?order.side,
                    kind = ?order.kind,
                    quantity = order.quantity,
                    attempts,
                    "Order placed"
                );
                ExecutionReport::success(order.tag, order_id, attempts)
            }
            Err(e) => {
                self.health.record_failure(BROKER);
                if let Ok(mut m) = self.metrics.write() {
                    m.orders_rejected += 1;
                }
                error!(
                    tag = %order.tag,
                    instrument = %order.instrument,
                    attempts,
                    error = %e,
                    "Order failed"
                );
                ExecutionReport::rejected(order.tag, e.to_string(), attempts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::always;
    use orb_core::types::{BrokerPosition, OrderKind, ProductType};
    use orb_core::Error;

    mock! {
        pub Broker {}

        #[async_trait]
        impl Broker for Broker {
            async fn place_order(&self, order: &OrderRequest) -> orb_core::Result<String>;
            async fn cancel_order(&self, order_id: &str) -> orb_core::Result<bool>;
            async fn positions(&self) -> orb_core::Result<Vec<BrokerPosition>>;
            async fn account_balance(&self) -> orb_core::Result<Decimal>;
        }
    }

    fn executor(mock: MockBroker) -> OrderExecutor {
        OrderExecutor::new(Arc::new(mock), ExecutorConfig::default())
    }

    fn exit() -> OrderRequest {
        OrderRequest::market("t1:leg1", Instrument::nse("INFY"), OrderSide::Sell, 20)
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_retries_once() {
        let mut mock = MockBroker::new();
        let mut calls = 0;
        mock.expect_place_order().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(Error::broker("timeout"))
            } else {
                Ok("OID-2".to_string())
            }
        });
        let report = executor(mock).place_exit(exit()).await;
        assert!(report.is_success());
        assert_eq!(report.attempts, 2);
        assert_eq!(report.order_id.as_deref(), Some("OID-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_gives_up_after_two_attempts() {
        let mut mock = MockBroker::new();
        mock.expect_place_order()
            .times(2)
            .returning(|_| Err(Error::broker("down")));
        let executor = executor(mock);
        let report = executor.place_exit(exit()).await;
        assert!(!report.is_success());
        assert_eq!(executor.metrics().orders_rejected, 1);
    }

    #[tokio::test]
    async fn test_entry_is_not_retried() {
        let mut mock = MockBroker::new();
        mock.expect_place_order()
            .times(1)
            .returning(|_| Err(Error::broker("rejected")));
        let executor = executor(mock);
        let order = executor.entry_order("t1:entry", Instrument::nse("INFY"), TradeSide::Long, 83, Decimal::new(1500, 0));
        let report = executor.place_entry(order).await;
        assert_eq!(report.attempts, 1);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_duplicate_tag_is_not_resubmitted() {
        let mut mock = MockBroker::new();
        mock.expect_place_order()
            .with(always())
            .times(1)
            .returning(|_| Ok("OID-1".to_string()));
        let executor = executor(mock);
        let first = executor.place_exit(exit()).await;
        let second = executor.place_exit(exit()).await;
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(executor.metrics().duplicate_tags, 1);
    }

    #[test]
    fn test_limit_entry_price_offsets() {
        let executor = executor(MockBroker::new());
        let buy = executor.entry_order("a", Instrument::nse("INFY"), TradeSide::Long, 1, Decimal::new(1500, 0));
        assert_eq!(buy.kind, OrderKind::Limit);
        assert_eq!(buy.price, Some(Decimal::new(15002, 1)));
        let sell = executor.entry_order("b", Instrument::nse("INFY"), TradeSide::Short, 1, Decimal::new(1500, 0));
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.price, Some(Decimal::new(14998, 1)));
    }

    #[tokio::test]
    async fn test_replace_stop_places_even_when_cancel_fails() {
        let mut mock = MockBroker::new();
        mock.expect_cancel_order()
            .times(1)
            .returning(|_| Err(Error::broker("unknown order")));
        mock.expect_place_order()
            .times(1)
            .returning(|o| {
                assert_eq!(o.kind, OrderKind::StopLossMarket);
                Ok("SL-2".to_string())
            });
        let executor = executor(mock);
        let stop = OrderRequest::stop_market("t1:stop1", Instrument::nse("INFY"), OrderSide::Sell, 63, Decimal::new(1500, 0));
        assert_eq!(executor.replace_stop(Some("SL-1"), stop).await.as_deref(), Some("SL-2"));
    }

    #[tokio::test]
    async fn test_flatten_all_closes_each_side() {
        let mut mock = MockBroker::new();
        mock.expect_positions().times(1).returning(|| {
            Ok(vec![
                BrokerPosition {
                    instrument: Instrument::nse("INFY"),
                    quantity: 63,
                    average_price: Decimal::new(1500, 0),
                    product: ProductType::Mis,
                },
                BrokerPosition {
                    instrument: Instrument::nse("TCS"),
                    quantity: -10,
                    average_price: Decimal::new(3500, 0),
                    product: ProductType::Mis,
                },
            ])
        });
        mock.expect_place_order().times(2).returning(|o| {
            match o.instrument.symbol.as_str() {
                "INFY" => assert_eq!((o.side, o.quantity), (OrderSide::Sell, 63)),
                _ => assert_eq!((o.side, o.quantity), (OrderSide::Buy, 10)),
            }
            Ok(format!("X-{}", o.instrument.symbol))
        });
        let reports = executor(mock).flatten_all("breaker").await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_broker_failures_counted_and_reset() {
        let mut mock = MockBroker::new();
        let mut calls = 0;
        mock.expect_place_order().times(4).returning(move |_| {
            calls += 1;
            if calls <= 3 {
                Err(Error::broker("down"))
            } else {
                Ok("OID".to_string())
            }
        });
        let executor = executor(mock);
        for i in 0..3 {
            let order = OrderRequest::market(format!("e{i}"), Instrument::nse("INFY"), OrderSide::Buy, 1);
            executor.place_entry(order).await;
        }
        assert_eq!(executor.broker_failures(), 3);
        // still attempted while failing
        let order = OrderRequest::market("e3", Instrument::nse("INFY"), OrderSide::Buy, 1);
        assert!(executor.place_entry(order).await.is_success());
        assert_eq!(executor.broker_failures(), 0);
    }
}
