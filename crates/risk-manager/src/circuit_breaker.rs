//! Daily loss circuit breaker.
//!
//! Tracks realized P&L for the session against starting capital. Once the
//! loss threshold is breached the breaker latches until the next session.

use chrono::{DateTime, NaiveDate, Utc};
use orb_core::clock::{Clock, SystemClock};
use orb_core::config::{BreakerConfig, RecoveryBudget};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Reason for circuit breaker activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    /// Session loss limit breached.
    DailyLossLimit,
    /// Manual activation.
    Manual,
}

/// Session risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub trading_day: NaiveDate,
    pub starting_capital: Decimal,
    /// Cumulative realized P&L for the session.
    pub realized_pnl: Decimal,
    /// Realized P&L at which the current loss allocation began.
    pub allocation_baseline: Decimal,
    /// Loss measured against the current allocation, as a fraction of capital.
    pub loss_pct: Decimal,
    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub trades_closed: u32,
    pub wins: u32,
    pub losses: u32,
}

impl DailyRiskState {
    fn new(trading_day: NaiveDate, starting_capital: Decimal) -> Self {
        Self {
            trading_day,
            starting_capital,
            realized_pnl: Decimal::ZERO,
            allocation_baseline: Decimal::ZERO,
            loss_pct: Decimal::ZERO,
            tripped: false,
            trip_reason: None,
            tripped_at: None,
            trades_closed: 0,
            wins: 0,
            losses: 0,
        }
    }

    /// P&L counted against the loss threshold.
    pub fn measured_pnl(&self) -> Decimal {
        self.realized_pnl - self.allocation_baseline
    }
}

/// Daily loss breaker shared between the session loop and status readers.
pub struct DailyLossBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<DailyRiskState>>,
    /// Fast path flag for checking if tripped.
    is_tripped: AtomicBool,
}

impl DailyLossBreaker {
    pub fn new(config: BreakerConfig, trading_day: NaiveDate, starting_capital: Decimal) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            state: Arc::new(RwLock::new(DailyRiskState::new(trading_day, starting_capital))),
            is_tripped: AtomicBool::new(false),
        }
    }

    /// Stamp trips with `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start a new session. The only way to clear a trip.
    pub async fn roll_session(&self, trading_day: NaiveDate, starting_capital: Decimal) {
        let mut state = self.state.write().await;
        if state.tripped {
            info!(
                previous_day = %state.trading_day,
                trading_day = %trading_day,
                "Session rollover, clearing daily loss breaker"
            );
        }
        *state = DailyRiskState::new(trading_day, starting_capital);
        self.is_tripped.store(false, Ordering::SeqCst);
    }

    /// Check if trading is halted (fast path).
    pub fn is_tripped(&self) -> bool {
        self.is_tripped.load(Ordering::SeqCst)
    }

    /// Loss limit in currency for the current session.
    pub async fn loss_limit(&self) -> Decimal {
        self.state.read().await.starting_capital * self.config.max_daily_loss_pct
    }

    /// Add realized P&L (one booked leg or a whole trade) and re-check.
    pub async fn record_realized(&self, pnl: Decimal) -> Option<TripReason> {
        {
            let mut state = self.state.write().await;
            state.realized_pnl += pnl;
        }
        self.check().await
    }

    /// Count a finished trade for the session report.
    pub async fn record_trade_result(&self, trade_pnl: Decimal) {
        let mut state = self.state.write().await;
        state.trades_closed += 1;
        if trade_pnl > Decimal::ZERO {
            state.wins += 1;
        } else {
            state.losses += 1;
        }
    }

    /// Trip when measured P&L / starting capital <= -threshold.
    ///
    /// Returns the reason if the breaker is (now or already) tripped.
    pub async fn check(&self) -> Option<TripReason> {
        let mut state = self.state.write().await;
        if state.tripped {
            return state.trip_reason.clone();
        }
        if state.starting_capital <= Decimal::ZERO {
            warn!(
                starting_capital = %state.starting_capital,
                "Cannot evaluate daily loss without positive starting capital"
            );
            return None;
        }

        state.loss_pct = state.measured_pnl() / state.starting_capital;
        if !self.config.enabled {
            return None;
        }
        if state.loss_pct <= -self.config.max_daily_loss_pct {
            self.trip_internal(&mut state, TripReason::DailyLossLimit);
            return Some(TripReason::DailyLossLimit);
        }
        None
    }

    /// Manually trip the circuit breaker.
    pub async fn manual_trip(&self, reason: Option<String>) {
        let mut state = self.state.write().await;
        warn!(reason = ?reason, "Manual circuit breaker trip");
        self.trip_internal(&mut state, TripReason::Manual);
    }

    /// Start the loss allocation for a recovery trade.
    ///
    /// With an independent budget the breaker measures only P&L from here on.
    /// A latched trip is never cleared.
    pub async fn begin_recovery_allocation(&self, budget: RecoveryBudget) {
        if budget != RecoveryBudget::Independent {
            return;
        }
        let mut state = self.state.write().await;
        if state.tripped {
            return;
        }
        state.allocation_baseline = state.realized_pnl;
        state.loss_pct = Decimal::ZERO;
        info!(
            baseline = %state.allocation_baseline,
            "Recovery trade gets an independent loss allocation"
        );
    }

    pub async fn state(&self) -> DailyRiskState {
        self.state.read().await.clone()
    }

    fn trip_internal(&self, state: &mut DailyRiskState, reason: TripReason) {
        if state.tripped {
            return;
        }
        state.tripped = true;
        state.trip_reason = Some(reason.clone());
        state.tripped_at = Some(self.clock.now());
        self.is_tripped.store(true, Ordering::SeqCst);

        error!(
            reason = ?reason,
            realized_pnl = %state.realized_pnl,
            loss_pct = %state.loss_pct,
            trading_day = %state.trading_day,
            "Daily loss breaker TRIPPED, entries halted for the session"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn breaker() -> DailyLossBreaker {
        DailyLossBreaker::new(BreakerConfig::default(), day(), Decimal::new(20000, 0))
    }

    #[tokio::test]
    async fn test_trips_at_threshold() {
        let breaker = breaker();
        assert_eq!(breaker.loss_limit().await, Decimal::new(400, 0));

        let reason = breaker.record_realized(Decimal::new(-400, 0)).await;
        assert_eq!(reason, Some(TripReason::DailyLossLimit));
        assert!(breaker.is_tripped());
    }

    #[tokio::test]
    async fn test_does_not_trip_just_below_threshold() {
        let breaker = breaker();
        assert_eq!(breaker.record_realized(Decimal::new(-399, 0)).await, None);
        assert!(!breaker.is_tripped());
    }

    #[tokio::test]
    async fn test_trip_latches_until_rollover() {
        let breaker = breaker();
        breaker.record_realized(Decimal::new(-250, 0)).await;
        breaker.record_realized(Decimal::new(-200, 0)).await;
        assert!(breaker.is_tripped());

        // Later profit does not clear the latch.
        assert_eq!(
            breaker.record_realized(Decimal::new(1000, 0)).await,
            Some(TripReason::DailyLossLimit)
        );
        assert!(breaker.is_tripped());

        let next = day().succ_opt().unwrap();
        breaker.roll_session(next, Decimal::new(20000, 0)).await;
        assert!(!breaker.is_tripped());
        let state = breaker.state().await;
        assert_eq!(state.trading_day, next);
        assert_eq!(state.realized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_breaker_tracks_but_never_trips() {
        let config = BreakerConfig {
            enabled: false,
            ..Default::default()
        };
        let breaker = DailyLossBreaker::new(config, day(), Decimal::new(20000, 0));
        assert_eq!(breaker.record_realized(Decimal::new(-5000, 0)).await, None);
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.state().await.realized_pnl, Decimal::new(-5000, 0));
    }

    #[tokio::test]
    async fn test_manual_trip() {
        let breaker = breaker();
        breaker.manual_trip(Some("operator".to_string())).await;
        assert!(breaker.is_tripped());
        assert_eq!(breaker.check().await, Some(TripReason::Manual));
    }

    #[tokio::test]
    async fn test_shared_recovery_budget_counts_first_loss() {
        let breaker = breaker();
        breaker.record_realized(Decimal::new(-300, 0)).await;
        breaker.begin_recovery_allocation(RecoveryBudget::Shared).await;
        assert_eq!(
            breaker.record_realized(Decimal::new(-100, 0)).await,
            Some(TripReason::DailyLossLimit)
        );
    }

    #[tokio::test]
    async fn test_independent_recovery_budget_rebaselines() {
        let breaker = breaker();
        breaker.record_realized(Decimal::new(-300, 0)).await;
        breaker.begin_recovery_allocation(RecoveryBudget::Independent).await;
        assert_eq!(breaker.record_realized(Decimal::new(-100, 0)).await, None);
        assert_eq!(
            breaker.record_realized(Decimal::new(-300, 0)).await,
            Some(TripReason::DailyLossLimit)
        );
        assert_eq!(breaker.state().await.realized_pnl, Decimal::new(-700, 0));
    }

    #[tokio::test]
    async fn test_trip_time_comes_from_clock() {
        use chrono::TimeZone;
        use orb_core::clock::ManualClock;

        let at = Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(at));
        let breaker = breaker().with_clock(clock.clone());
        clock.advance(chrono::Duration::minutes(10));
        breaker.record_realized(Decimal::new(-400, 0)).await;

        let state = breaker.state().await;
        assert_eq!(state.tripped_at, Some(at + chrono::Duration::minutes(10)));
    }

    #[tokio::test]
    async fn test_trade_results_counted() {
        let breaker = breaker();
        breaker.record_trade_result(Decimal::new(50, 0)).await;
        breaker.record_trade_result(Decimal::new(-20, 0)).await;
        breaker.record_trade_result(Decimal::ZERO).await;
        let state = breaker.state().await;
        assert_eq!((state.trades_closed, state.wins, state.losses), (3, 1, 2));
    }
}
