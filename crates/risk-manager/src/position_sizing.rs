//! Position sizing from balance, utilization and leverage.

use orb_core::config::CapitalConfig;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// `floor(balance * utilization * leverage / price)`, or 0 when the inputs
/// cannot produce at least one share.
pub fn compute_quantity(balance: Decimal, price: Decimal, utilization: Decimal, leverage: Decimal) -> u64 {
    if balance <= Decimal::ZERO || price <= Decimal::ZERO {
        return 0;
    }
    let raw = balance * utilization * leverage / price;
    if raw < Decimal::ONE {
        return 0;
    }
    raw.floor().to_u64().unwrap_or(0)
}

/// Sizing outcome with the numbers logged at entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingDecision {
    pub quantity: u64,
    pub price: Decimal,
    pub leverage_factor: Decimal,
    /// Balance committed: balance * utilization.
    pub capital_for_trade: Decimal,
    pub notional: Decimal,
    pub margin_required: Decimal,
    /// Zero until a stop is attached with [`SizingDecision::with_stop`].
    pub risk_per_share: Decimal,
    pub total_risk: Decimal,
}

impl SizingDecision {
    /// Attach the protective stop: risk is `|entry - stop|` per share.
    pub fn with_stop(mut self, entry: Decimal, stop: Decimal) -> Self {
        self.risk_per_share = (entry - stop).abs();
        self.total_risk = self.risk_per_share * Decimal::from(self.quantity);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: CapitalConfig,
}

impl PositionSizer {
    pub fn new(config: CapitalConfig) -> Self {
        Self { config }
    }

    pub fn leverage_factor(&self) -> Decimal {
        if self.config.use_leverage {
            self.config.leverage
        } else {
            Decimal::ONE
        }
    }

    pub fn compute_quantity(&self, balance: Decimal, price: Decimal) -> u64 {
        compute_quantity(balance, price, self.config.utilization, self.leverage_factor())
    }

    /// Size a position. `None` aborts the trade attempt.
    pub fn size(&self, balance: Decimal, price: Decimal) -> Option<SizingDecision> {
        let quantity = self.compute_quantity(balance, price);
        if quantity == 0 {
            warn!(
                balance = %balance,
                price = %price,
                "Position size below one share, skipping"
            );
            return None;
        }

        let leverage_factor = self.leverage_factor();
        let notional = price * Decimal::from(quantity);
        let decision = SizingDecision {
            quantity,
            price,
            leverage_factor,
            capital_for_trade: balance * self.config.utilization,
            notional,
            margin_required: notional / leverage_factor,
            risk_per_share: Decimal::ZERO,
            total_risk: Decimal::ZERO,
        };
        debug!(
            quantity,
            notional = %decision.notional,
            margin = %decision.margin_required,
            "Position sized"
        );
        Some(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_quantity() {
        let qty = compute_quantity(
            Decimal::new(50000, 0),
            Decimal::new(1500, 0),
            Decimal::new(5, 1),
            Decimal::new(5, 0),
        );
        assert_eq!(qty, 83);
    }

    #[test]
    fn test_invalid_inputs_size_to_zero() {
        let u = Decimal::new(5, 1);
        let l = Decimal::new(5, 0);
        assert_eq!(compute_quantity(Decimal::ZERO, Decimal::new(100, 0), u, l), 0);
        assert_eq!(compute_quantity(Decimal::new(-10, 0), Decimal::new(100, 0), u, l), 0);
        assert_eq!(compute_quantity(Decimal::new(1000, 0), Decimal::ZERO, u, l), 0);
        // 100 * 0.5 * 5 / 300 < 1
        assert_eq!(compute_quantity(Decimal::new(100, 0), Decimal::new(300, 0), u, l), 0);
    }

    #[test]
    fn test_leverage_disabled() {
        let sizer = PositionSizer::new(CapitalConfig {
            use_leverage: false,
            ..Default::default()
        });
        assert_eq!(sizer.leverage_factor(), Decimal::ONE);
        assert_eq!(sizer.compute_quantity(Decimal::new(50000, 0), Decimal::new(1500, 0)), 16);
    }

    #[test]
    fn test_size_reports_margin() {
        let sizer = PositionSizer::new(CapitalConfig::default());
        let d = sizer.size(Decimal::new(50000, 0), Decimal::new(1500, 0)).unwrap();
        assert_eq!(d.quantity, 83);
        assert_eq!(d.notional, Decimal::new(124500, 0));
        assert_eq!(d.margin_required, Decimal::new(24900, 0));
        assert_eq!(d.capital_for_trade, Decimal::new(25000, 0));
        assert!(sizer.size(Decimal::ZERO, Decimal::new(1500, 0)).is_none());
    }

    #[test]
    fn test_size_reports_risk_once_stop_known() {
        let sizer = PositionSizer::new(CapitalConfig::default());
        let d = sizer.size(Decimal::new(50000, 0), Decimal::new(1500, 0)).unwrap();
        assert_eq!(d.total_risk, Decimal::ZERO);

        let d = d.with_stop(Decimal::new(1500, 0), Decimal::new(14625, 1));
        assert_eq!(d.risk_per_share, Decimal::new(375, 1));
        assert_eq!(d.total_risk, Decimal::new(31125, 1));

        // Shorts measure the same distance
        let d = d.with_stop(Decimal::new(1500, 0), Decimal::new(15375, 1));
        assert_eq!(d.risk_per_share, Decimal::new(375, 1));
    }
}
