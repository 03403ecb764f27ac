//! Session orchestration.
//!
//! One [`TradingSession`] owns the decision loop: wait for the market, lock
//! setups, scan for a signal, manage the resulting trade, repeat within the
//! day's trade rules, then stand by for the next trading day. It runs on a
//! single spawned task controlled through a [`BotHandle`].

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use orb_core::api::MarketData;
use orb_core::clock::{Clock, MarketCalendar};
use orb_core::config::BotConfig;
use orb_core::indicators;
use orb_core::retry::DependencyHealth;
use orb_core::store::{TradeRecord, TradeStore, TradeUpdate};
use orb_core::types::{
    CloseReason, EntryWindow, ExitStage, IndexBias, Instrument, NewTrade, OrderRequest, Signal, Trade,
    TradeSide, TradeState,
};
use risk_manager::{is_valid_stop, DailyLossBreaker, PositionSizer, RiskEngine};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::executor::OrderExecutor;
use crate::exit_manager::{ExitAction, ExitManager, TickInput};
use crate::scanner::{SessionSetups, SymbolScanner};
use crate::signals::SignalEvaluator;

const MARKET_DATA: &str = "market_data";
/// Longest single sleep, so wall-clock drift is corrected regularly.
const MAX_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Starting,
    WaitingForOpen,
    BuildingRange,
    Scanning,
    InTrade,
    Halted,
    Standby,
    Stopped,
}

/// Open position as seen by status readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub trade_id: Uuid,
    pub instrument: Instrument,
    pub side: TradeSide,
    pub state: TradeState,
    pub entry_price: Decimal,
    pub remaining_quantity: u64,
    pub stop_price: Decimal,
    pub last_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

impl From<&Trade> for PositionSnapshot {
    fn from(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id,
            instrument: trade.instrument.clone(),
            side: trade.side,
            state: trade.state,
            entry_price: trade.entry_price,
            remaining_quantity: trade.remaining_quantity,
            stop_price: trade.stop_price,
            last_price: trade.last_price,
            unrealized_pnl: trade.unrealized_pnl(trade.last_price),
            realized_pnl: trade.realized_pnl,
        }
    }
}

/// Point-in-time status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub trading_day: Option<NaiveDate>,
    pub current_position: Option<PositionSnapshot>,
    pub realized_pnl_today: Decimal,
    pub trades_today: u32,
    pub breaker_tripped: bool,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: SessionPhase::Starting,
            trading_day: None,
            current_position: None,
            realized_pnl_today: Decimal::ZERO,
            trades_today: 0,
            breaker_tripped: false,
            updated_at: now,
        }
    }
}

/// Per-day mutable state, owned by the session loop.
#[derive(Debug)]
pub struct SessionContext {
    pub trading_day: NaiveDate,
    pub setups: Option<SessionSetups>,
    pub trades_today: u32,
    pub trades_by_symbol: HashMap<Instrument, u32>,
    pub closed_trades: Vec<Trade>,
    /// Symbol sweep resumes here after a tick ran out of budget.
    scan_cursor: usize,
    flattened: bool,
}

impl SessionContext {
    pub fn new(trading_day: NaiveDate) -> Self {
        Self {
            trading_day,
            setups: None,
            trades_today: 0,
            trades_by_symbol: HashMap::new(),
            closed_trades: Vec::new(),
            scan_cursor: 0,
            flattened: false,
        }
    }

    fn trades_for(&self, instrument: &Instrument) -> u32 {
        self.trades_by_symbol.get(instrument).copied().unwrap_or(0)
    }

    fn last_trade_lost(&self) -> bool {
        self.closed_trades
            .last()
            .is_some_and(|t| t.realized_pnl < Decimal::ZERO)
    }
}

/// Stop and liquidation signals from the handle.
pub struct Controls {
    stop: watch::Receiver<bool>,
    liquidate: watch::Receiver<u64>,
}

enum Wake {
    Elapsed,
    Stop,
    Liquidate,
}

enum TradeOutcome {
    Closed(Trade),
    Stopped,
}

enum LoopExit {
    DayDone,
    Stop,
}

impl Controls {
    fn stop_requested(&self) -> bool {
        self.stop.has_changed().is_err() || *self.stop.borrow()
    }

    /// Consume a pending liquidation request.
    fn take_liquidation(&mut self) -> bool {
        match self.liquidate.has_changed() {
            Ok(true) => {
                self.liquidate.borrow_and_update();
                true
            }
            _ => false,
        }
    }

    async fn sleep(&mut self, duration: Duration) -> Wake {
        if self.stop_requested() {
            return Wake::Stop;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
            res = self.stop.changed() => {
                if res.is_err() || *self.stop.borrow() {
                    Wake::Stop
                } else {
                    Wake::Elapsed
                }
            }
            res = self.liquidate.changed() => {
                if res.is_err() { Wake::Stop } else { Wake::Liquidate }
            }
        }
    }
}

/// Collaborators the session is built from.
pub struct SessionDeps {
    pub clock: Arc<dyn Clock>,
    pub market: Arc<dyn MarketData>,
    pub executor: OrderExecutor,
    pub store: Arc<dyn TradeStore>,
}

pub struct TradingSession {
    config: Arc<BotConfig>,
    clock: Arc<dyn Clock>,
    calendar: MarketCalendar,
    market: Arc<dyn MarketData>,
    executor: OrderExecutor,
    store: Arc<dyn TradeStore>,
    scanner: SymbolScanner,
    evaluator: SignalEvaluator,
    sizer: PositionSizer,
    exits: ExitManager,
    breaker: Arc<DailyLossBreaker>,
    health: DependencyHealth,
    status: Arc<RwLock<SessionStatus>>,
    /// Trailing ATR per token and when it was computed.
    atr_cache: HashMap<u64, (DateTime<Utc>, Option<Decimal>)>,
}

impl TradingSession {
    pub fn new(config: Arc<BotConfig>, deps: SessionDeps) -> Result<Self> {
        let calendar = MarketCalendar::new(&config.session)?;
        let risk = RiskEngine::new(config.risk.clone());
        let now = deps.clock.now();
        let scanner = SymbolScanner::new(
            deps.market.clone(),
            calendar.clone(),
            config.filters.clone(),
            risk.clone(),
        );
        let evaluator = SignalEvaluator::new(
            deps.market.clone(),
            calendar.clone(),
            config.entry.clone(),
            config.filters.clone(),
            config.index.clone(),
        );
        let breaker = Arc::new(
            DailyLossBreaker::new(
                config.breaker.clone(),
                calendar.trading_day(now),
                config.capital.starting_capital,
            )
            .with_clock(deps.clock.clone()),
        );
        let health = DependencyHealth::new(
            config.execution.failure_threshold,
            Duration::from_secs(config.execution.backoff_secs),
        );

        Ok(Self {
            sizer: PositionSizer::new(config.capital.clone()),
            exits: ExitManager::new(risk),
            config,
            clock: deps.clock,
            calendar,
            market: deps.market,
            executor: deps.executor,
            store: deps.store,
            scanner,
            evaluator,
            breaker,
            health,
            status: Arc::new(RwLock::new(SessionStatus::new(now))),
            atr_cache: HashMap::new(),
        })
    }

    pub fn breaker(&self) -> Arc<DailyLossBreaker> {
        self.breaker.clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<SessionStatus>> {
        self.status.clone()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.execution.poll_interval_secs)
    }

    /// Runs sessions day after day until stopped.
    pub async fn run(mut self, mut controls: Controls) -> Result<()> {
        info!(
            symbols = self.config.symbols.len(),
            poll_secs = self.config.execution.poll_interval_secs,
            "Starting trading session loop"
        );

        loop {
            let day = self.calendar.upcoming_session(self.clock.now());
            self.set_phase(SessionPhase::WaitingForOpen, Some(day)).await;
            let open = self.calendar.market_open(day);
            if !self.wait_until(open, &mut controls).await {
                break;
            }

            let mut ctx = self.start_day(day).await;

            let now = self.clock.now();
            let local = self.calendar.local_time(now);
            if local >= self.config.entry.hard_cutoff || self.calendar.is_eod(now) {
                info!(trading_day = %day, "Started after the entry cutoff, standing by");
            } else {
                self.set_phase(SessionPhase::BuildingRange, Some(day)).await;
                let range_end = self.calendar.range_end(day);
                if !self.wait_until(range_end, &mut controls).await {
                    break;
                }

                let now = self.clock.now();
                let setups = self.scanner.scan(&self.config.symbols, day, now).await;
                ctx.setups = Some(setups);

                if let LoopExit::Stop = self.entry_loop(&mut ctx, &mut controls).await {
                    self.report_day(&ctx).await;
                    break;
                }
            }

            self.report_day(&ctx).await;
            let phase = if self.breaker.is_tripped() {
                SessionPhase::Halted
            } else {
                SessionPhase::Standby
            };
            self.set_phase(phase, Some(day)).await;
            let eod = self.calendar.eod_cutoff(day);
            if !self.wait_until(eod, &mut controls).await {
                break;
            }
        }

        self.set_phase(SessionPhase::Stopped, None).await;
        info!("Trading session loop stopped");
        Ok(())
    }

    /// Sleeps until `at`. Returns false when stop was requested first.
    async fn wait_until(&self, at: DateTime<Utc>, controls: &mut Controls) -> bool {
        loop {
            if controls.stop_requested() {
                return false;
            }
            let remaining = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return true;
            }
            match controls.sleep(remaining.min(MAX_SLEEP)).await {
                Wake::Stop => return false,
                Wake::Liquidate => info!("Liquidation requested with no open trade"),
                Wake::Elapsed => {}
            }
        }
    }

    async fn start_day(&mut self, day: NaiveDate) -> SessionContext {
        let capital = self
            .executor
            .account_balance()
            .await
            .filter(|b| *b > Decimal::ZERO)
            .unwrap_or(self.config.capital.starting_capital);
        self.breaker.roll_session(day, capital).await;
        self.evaluator.reset();
        self.atr_cache.clear();
        info!(trading_day = %day, starting_capital = %capital, "Session started");

        let mut status = self.status.write().await;
        status.trading_day = Some(day);
        status.trades_today = 0;
        status.realized_pnl_today = Decimal::ZERO;
        status.breaker_tripped = false;
        status.current_position = None;
        status.updated_at = self.clock.now();
        SessionContext::new(day)
    }

    async fn entry_loop(&mut self, ctx: &mut SessionContext, controls: &mut Controls) -> LoopExit {
        self.set_phase(SessionPhase::Scanning, Some(ctx.trading_day)).await;
        loop {
            let now = self.clock.now();
            if self.breaker.is_tripped() {
                self.halt(ctx).await;
                return LoopExit::DayDone;
            }
            let window = self.config.entry.window_at(self.calendar.local_time(now));
            if self.calendar.is_eod(now) || window == EntryWindow::Closed {
                info!(trades_today = ctx.trades_today, "Entry window closed");
                return LoopExit::DayDone;
            }
            if !self.may_enter(ctx, now) {
                return LoopExit::DayDone;
            }

            if window.allows_entry() {
                if let Some(signal) = self.scan_for_signal(ctx, now).await {
                    if let Some(trade) = self.open_trade(ctx, &signal).await {
                        match self.manage_trade(ctx, trade, controls).await {
                            TradeOutcome::Stopped => return LoopExit::Stop,
                            TradeOutcome::Closed(trade) => {
                                self.finish_trade(ctx, trade).await;
                                self.set_phase(SessionPhase::Scanning, Some(ctx.trading_day)).await;
                                continue;
                            }
                        }
                    }
                }
            }

            match controls.sleep(self.poll_interval()).await {
                Wake::Stop => return LoopExit::Stop,
                Wake::Liquidate => info!("Liquidation requested with no open trade"),
                Wake::Elapsed => {}
            }
        }
    }

    /// Day caps and the recovery-trade rule.
    fn may_enter(&self, ctx: &SessionContext, now: DateTime<Utc>) -> bool {
        let entry = &self.config.entry;
        if ctx.trades_today >= entry.max_trades_per_day {
            info!(trades_today = ctx.trades_today, "Daily trade cap reached");
            return false;
        }
        if ctx.trades_today == 0 {
            return true;
        }
        if !entry.allow_recovery_trade {
            info!("One trade per day, done");
            return false;
        }
        if ctx.trades_today > entry.max_recovery_trades || !ctx.last_trade_lost() {
            info!(trades_today = ctx.trades_today, "No further entries today");
            return false;
        }
        if self.calendar.local_time(now) >= entry.recovery_cutoff {
            info!("Recovery trade cutoff passed");
            return false;
        }
        true
    }

    /// One sweep over the setups in scan order. The first signal wins.
    async fn scan_for_signal(&mut self, ctx: &mut SessionContext, now: DateTime<Utc>) -> Option<Signal> {
        if self.health.is_backing_off(MARKET_DATA) {
            return None;
        }
        let setups = ctx.setups.as_ref()?.iter().cloned().collect::<Vec<_>>();
        if setups.is_empty() {
            return None;
        }

        let bias = if self.config.filters.use_index_bias {
            self.evaluator.index_bias(now).await
        } else {
            IndexBias::neutral()
        };

        let budget = Duration::from_millis(self.config.execution.scan_budget_ms);
        let started = tokio::time::Instant::now();
        let start = ctx.scan_cursor % setups.len();
        ctx.scan_cursor = 0;

        for offset in 0..setups.len() {
            let index = (start + offset) % setups.len();
            let setup = &setups[index];
            if started.elapsed() > budget {
                warn!(
                    deferred = setups.len() - offset,
                    budget_ms = budget.as_millis() as u64,
                    "Scan budget exhausted, deferring remaining symbols"
                );
                ctx.scan_cursor = index;
                return None;
            }
            if ctx.trades_for(&setup.instrument) >= self.config.entry.max_trades_per_symbol {
                continue;
            }
            let Some(candle) = self.evaluator.latest_candle(setup, now).await else {
                continue;
            };
            if let Some(signal) = self.evaluator.evaluate(setup, &candle, &bias, now).await {
                info!(
                    symbol = %signal.instrument,
                    side = %signal.side,
                    price = %signal.entry_price,
                    window = ?signal.window,
                    retest = signal.via_retest,
                    "Entry signal"
                );
                return Some(signal);
            }
        }
        None
    }

    /// Size, place the entry and protective stop. `None` aborts this attempt.
    async fn open_trade(&mut self, ctx: &mut SessionContext, signal: &Signal) -> Option<Trade> {
        let balance = match self.executor.account_balance().await {
            Some(b) if b > Decimal::ZERO => b,
            _ => self.config.capital.starting_capital,
        };
        let order_price = self.executor.entry_price(signal.side, signal.entry_price);
        let sizing = self.sizer.size(balance, order_price)?;

        let risk = self.exits.risk();
        let stop = risk.stop_for_entry(
            signal.side,
            signal.entry_price,
            signal.vwap,
            Some((signal.candle.high, signal.candle.low)),
        );
        if !is_valid_stop(signal.side, signal.entry_price, stop) {
            warn!(
                symbol = %signal.instrument,
                entry = %signal.entry_price,
                stop = %stop,
                "Stop is not beyond entry, skipping signal"
            );
            return None;
        }
        let sizing = sizing.with_stop(signal.entry_price, stop);
        let ladder = risk.build_target_ladder(signal.side, signal.entry_price, stop, sizing.quantity);

        let now = self.clock.now();
        let mut trade = Trade::open(NewTrade {
            instrument: signal.instrument.clone(),
            token: signal.token,
            side: signal.side,
            trade_number: ctx.trades_today + 1,
            entry_price: signal.entry_price,
            quantity: sizing.quantity,
            stop_price: stop,
            ladder,
            partial_booking: risk.config().partial_booking,
            opened_at: now,
        });

        let order = self.executor.entry_order(
            format!("{}:entry", trade.id),
            trade.instrument.clone(),
            trade.side,
            trade.initial_quantity,
            signal.entry_price,
        );
        let report = self.executor.place_entry(order).await;
        if !report.is_success() {
            error!(
                symbol = %trade.instrument,
                error = ?report.error,
                "Entry order failed, no trade opened"
            );
            return None;
        }
        trade.entry_order_id = report.order_id;

        if ctx.trades_today > 0 {
            self.breaker
                .begin_recovery_allocation(self.config.entry.recovery_budget)
                .await;
        }
        ctx.trades_today += 1;
        *ctx.trades_by_symbol.entry(trade.instrument.clone()).or_default() += 1;

        info!(
            trade_id = %trade.id,
            trade_number = trade.trade_number,
            symbol = %trade.instrument,
            side = %trade.side,
            quantity = trade.initial_quantity,
            entry = %trade.entry_price,
            stop = %trade.stop_price,
            risk_per_share = %sizing.risk_per_share,
            total_risk = %sizing.total_risk,
            targets = ?trade.ladder.legs.iter().map(|l| l.price).collect::<Vec<_>>(),
            notional = %sizing.notional,
            margin = %sizing.margin_required,
            "Trade opened"
        );

        if let Err(e) = self.store.create_trade(&TradeRecord::from(&trade)).await {
            warn!(trade_id = %trade.id, error = %e, "Failed to persist new trade");
        }

        let stop_order = self.stop_order(&trade);
        trade.stop_order_id = self.executor.replace_stop(None, stop_order).await;
        self.publish(Some(&trade), ctx).await;
        Some(trade)
    }

    fn stop_order(&self, trade: &Trade) -> OrderRequest {
        OrderRequest::stop_market(
            format!("{}:stop{}", trade.id, trade.stop_revision),
            trade.instrument.clone(),
            trade.side.exit_order_side(),
            trade.remaining_quantity,
            trade.stop_price,
        )
    }

    async fn manage_trade(
        &mut self,
        ctx: &mut SessionContext,
        mut trade: Trade,
        controls: &mut Controls,
    ) -> TradeOutcome {
        self.set_phase(SessionPhase::InTrade, Some(ctx.trading_day)).await;
        let mut liquidate = false;

        loop {
            let now = self.clock.now();
            liquidate |= controls.take_liquidation();
            let price = self.fetch_price(&trade.instrument).await;
            let atr = match price {
                Some(p) => self.trailing_atr(&trade, p, now).await,
                None => None,
            };
            let tick = TickInput {
                now,
                price,
                eod: self.calendar.is_eod(now),
                breaker_tripped: self.breaker.is_tripped(),
                liquidate,
                atr,
            };

            let (next, actions) = self.exits.step(&trade, &tick);
            trade = self.apply_actions(next, actions).await;
            self.publish(Some(&trade), ctx).await;

            if trade.is_closed() {
                return TradeOutcome::Closed(trade);
            }
            if self.breaker.is_tripped() {
                continue;
            }

            match controls.sleep(self.poll_interval()).await {
                Wake::Stop => {
                    warn!(
                        trade_id = %trade.id,
                        remaining = trade.remaining_quantity,
                        "Stop requested with an open trade, leaving position to its protective stop"
                    );
                    return TradeOutcome::Stopped;
                }
                Wake::Liquidate => liquidate = true,
                Wake::Elapsed => {}
            }
        }
    }

    /// Carry out the side effects of one exit tick. Each leg's order,
    /// persistence update and breaker report happen exactly once.
    async fn apply_actions(&mut self, mut trade: Trade, actions: Vec<ExitAction>) -> Trade {
        if actions.is_empty() {
            return trade;
        }

        let mut stop_moved = false;
        for action in &actions {
            match action {
                ExitAction::StageComplete { stage, fill } => {
                    stop_moved = true;
                    let Some(fill) = fill else {
                        continue;
                    };
                    let purpose = match stage {
                        ExitStage::Stage1 => "leg1",
                        ExitStage::Stage2 => "leg2",
                        ExitStage::Final => "close",
                    };
                    let order = OrderRequest::market(
                        format!("{}:{purpose}", trade.id),
                        trade.instrument.clone(),
                        trade.side.exit_order_side(),
                        fill.quantity,
                    );
                    let report = self.executor.place_exit(order).await;
                    if !report.is_success() {
                        error!(trade_id = %trade.id, stage = ?stage, "Partial exit order failed, accounting advanced anyway");
                    }
                    self.breaker.record_realized(fill.pnl).await;
                }
                ExitAction::MoveStop { .. } => stop_moved = true,
                ExitAction::Close { reason, fill } => {
                    if let Some(stop_id) = trade.stop_order_id.take() {
                        self.executor.cancel(&stop_id).await;
                    }
                    if fill.quantity > 0 {
                        let order = OrderRequest::market(
                            format!("{}:close", trade.id),
                            trade.instrument.clone(),
                            trade.side.exit_order_side(),
                            fill.quantity,
                        );
                        let report = self.executor.place_exit(order).await;
                        if !report.is_success() {
                            error!(trade_id = %trade.id, reason = ?reason, "Close order failed, accounting advanced anyway");
                        }
                    }
                    self.breaker.record_realized(fill.pnl).await;
                }
            }
        }

        if stop_moved && !trade.is_closed() && trade.remaining_quantity > 0 {
            trade.stop_revision += 1;
            let previous = trade.stop_order_id.take();
            let order = self.stop_order(&trade);
            trade.stop_order_id = self.executor.replace_stop(previous.as_deref(), order).await;
        }

        let fills: Vec<_> = actions.iter().filter_map(|a| a.fill().cloned()).collect();
        let updates = if fills.is_empty() {
            vec![TradeUpdate::from_trade(&trade, None)]
        } else {
            fills
                .into_iter()
                .map(|f| TradeUpdate::from_trade(&trade, Some(f)))
                .collect()
        };
        for update in updates {
            match self.store.update_trade(trade.id, &update).await {
                Ok(true) => {}
                Ok(false) => warn!(trade_id = %trade.id, "Trade unknown to store, update dropped"),
                Err(e) => warn!(trade_id = %trade.id, error = %e, "Failed to persist trade update"),
            }
        }
        trade
    }

    async fn finish_trade(&mut self, ctx: &mut SessionContext, trade: Trade) {
        self.breaker.record_trade_result(trade.realized_pnl).await;
        info!(
            trade_id = %trade.id,
            symbol = %trade.instrument,
            reason = ?trade.close_reason,
            realized_pnl = %trade.realized_pnl,
            "Trade finished"
        );
        ctx.closed_trades.push(trade);
        self.publish(None, ctx).await;
    }

    /// Breaker tripped: flatten everything the broker still holds, once.
    async fn halt(&mut self, ctx: &mut SessionContext) {
        self.set_phase(SessionPhase::Halted, Some(ctx.trading_day)).await;
        if ctx.flattened || !self.config.breaker.auto_liquidate {
            return;
        }
        ctx.flattened = true;
        let prefix = format!("{}:breaker", ctx.trading_day);
        if let Err(e) = self.executor.flatten_all(&prefix).await {
            error!(error = %e, "Failed to liquidate positions after breaker trip");
        }
    }

    /// Quote for the open trade. Polled every tick even while market data is
    /// backing off; failures still feed the backoff that gates scanning.
    async fn fetch_price(&self, instrument: &Instrument) -> Option<Decimal> {
        match self.market.quote(instrument).await {
            Ok(quote) if quote.last_price > Decimal::ZERO => {
                self.health.record_success(MARKET_DATA);
                Some(quote.last_price)
            }
            Ok(_) => None,
            Err(e) => {
                self.health.record_failure(MARKET_DATA);
                warn!(symbol = %instrument, error = %e, "Quote unavailable, skipping tick");
                None
            }
        }
    }

    /// ATR for trailing, refreshed every `atr_trail_refresh_secs` once the
    /// trade is far enough in profit to trail.
    async fn trailing_atr(&mut self, trade: &Trade, price: Decimal, now: DateTime<Utc>) -> Option<Decimal> {
        let risk = self.exits.risk().config();
        if !risk.use_atr_trailing || trade.r_multiple_at(price) < risk.atr_trail_start_r {
            return None;
        }
        let ttl = chrono::Duration::seconds(risk.atr_trail_refresh_secs as i64);
        if let Some((at, atr)) = self.atr_cache.get(&trade.token) {
            if now - *at < ttl {
                return *atr;
            }
        }

        let period = risk.atr_period;
        let interval = self.config.filters.candle_interval;
        let from = now - chrono::Duration::minutes((period as i64 + 2) * interval.minutes());
        let atr = match self
            .market
            .historical_candles(trade.token, from, now, interval)
            .await
        {
            Ok(candles) => indicators::atr(&candles, period),
            Err(e) => {
                warn!(symbol = %trade.instrument, error = %e, "ATR candles unavailable");
                None
            }
        };
        debug!(symbol = %trade.instrument, atr = ?atr, "Trailing ATR refreshed");
        self.atr_cache.insert(trade.token, (now, atr));
        atr
    }

    async fn publish(&self, trade: Option<&Trade>, ctx: &SessionContext) {
        let risk = self.breaker.state().await;
        let mut status = self.status.write().await;
        status.current_position = trade.filter(|t| !t.is_closed()).map(PositionSnapshot::from);
        status.realized_pnl_today = risk.realized_pnl;
        status.trades_today = ctx.trades_today;
        status.breaker_tripped = risk.tripped;
        status.updated_at = self.clock.now();
    }

    async fn set_phase(&self, phase: SessionPhase, day: Option<NaiveDate>) {
        let mut status = self.status.write().await;
        if status.phase != phase {
            debug!(from = ?status.phase, to = ?phase, "Session phase");
        }
        status.phase = phase;
        if day.is_some() {
            status.trading_day = day;
        }
        status.breaker_tripped = self.breaker.is_tripped();
        status.updated_at = self.clock.now();
    }

    async fn report_day(&self, ctx: &SessionContext) {
        let risk = self.breaker.state().await;
        info!(
            trading_day = %ctx.trading_day,
            setups = ctx.setups.as_ref().map(|s| s.len()).unwrap_or(0),
            trades = ctx.trades_today,
            wins = risk.wins,
            losses = risk.losses,
            realized_pnl = %risk.realized_pnl,
            breaker_tripped = risk.tripped,
            "End of day report"
        );
        for trade in &ctx.closed_trades {
            info!(
                trade_number = trade.trade_number,
                symbol = %trade.instrument,
                side = %trade.side,
                entry = %trade.entry_price,
                quantity = trade.initial_quantity,
                legs = trade.fills.len(),
                reason = ?trade.close_reason.unwrap_or(CloseReason::EndOfDay),
                pnl = %trade.realized_pnl,
                "Trade summary"
            );
        }
    }
}

/// Handle to a running session.
pub struct BotHandle {
    stop_tx: watch::Sender<bool>,
    liquidate_tx: watch::Sender<u64>,
    status: Arc<RwLock<SessionStatus>>,
    breaker: Arc<DailyLossBreaker>,
    task: JoinHandle<Result<()>>,
}

impl BotHandle {
    /// Spawn the session loop.
    pub fn start(session: TradingSession) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (liquidate_tx, liquidate_rx) = watch::channel(0u64);
        let status = session.status_handle();
        let breaker = session.breaker();
        let controls = Controls {
            stop: stop_rx,
            liquidate: liquidate_rx,
        };
        let task = tokio::spawn(session.run(controls));
        Self {
            stop_tx,
            liquidate_tx,
            status,
            breaker,
            task,
        }
    }

    /// Request cancellation. Open positions are left alone.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Request an explicit flatten of the open trade.
    pub fn liquidate(&self) {
        self.liquidate_tx.send_modify(|n| *n += 1);
    }

    /// Latch the daily loss breaker by hand.
    pub async fn halt_trading(&self, reason: impl Into<String>) {
        self.breaker.manual_trip(Some(reason.into())).await;
    }

    pub async fn status(&self) -> SessionStatus {
        self.status.read().await.clone()
    }

    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("session task failed: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::paper::PaperBroker;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use orb_core::api::InMemoryMarket;
    use orb_core::clock::TokioClock;
    use orb_core::store::MemoryTradeStore;
    use orb_core::types::{Candle, Interval, Quote};

    fn d(v: i64, scale: u32) -> Decimal {
        Decimal::new(v, scale)
    }

    // 2026-03-02 09:15 IST
    fn open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 3, 45, 0).unwrap()
    }

    fn config() -> BotConfig {
        let mut config = BotConfig::default();
        config.symbols = vec![Instrument::nse("INFY")];
        config.filters.use_volume_filter = false;
        config.filters.use_index_bias = false;
        config.filters.use_trend_filter = false;
        config.filters.use_liquidity_filter = false;
        config.filters.use_retest = false;
        config.risk.use_atr_buffer = false;
        config.risk.use_atr_trailing = false;
        config.execution.use_limit_orders = false;
        config
    }

    fn seed_market(market: &InMemoryMarket) {
        let infy = Instrument::nse("INFY");
        market.register(infy.clone(), 1);
        market.set_candles(
            1,
            Interval::Minute15,
            vec![Candle::new(open(), d(1490, 0), d(1495, 0), d(1485, 0), d(1490, 0), 10_000)],
        );
        let flat: Vec<_> = (0..3)
            .map(|i| {
                let p = d(1490, 0);
                Candle::new(open() + ChronoDuration::minutes(5 * i), p, p, p, p, 1_000)
            })
            .collect();
        market.set_candles(1, Interval::Minute5, flat);
        // breakout candle 09:30-09:35
        market.upsert_candle(
            1,
            Interval::Minute5,
            Candle::new(
                open() + ChronoDuration::minutes(15),
                d(1492, 0),
                d(1501, 0),
                d(1488, 0),
                d(1500, 0),
                5_000,
            ),
        );
        market.set_quote(&infy, Quote::at_price(d(1500, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_trades_and_stops_cleanly() {
        let market = Arc::new(InMemoryMarket::new());
        seed_market(&market);
        let broker = Arc::new(PaperBroker::new(d(50000, 0)));
        let store = Arc::new(MemoryTradeStore::new());
        let clock = Arc::new(TokioClock::starting_at(open() - ChronoDuration::minutes(5)));

        let executor = OrderExecutor::new(broker.clone(), ExecutorConfig::from(&config().execution));
        let session = TradingSession::new(
            Arc::new(config()),
            SessionDeps {
                clock,
                market: market.clone(),
                executor,
                store: store.clone(),
            },
        )
        .unwrap();
        let handle = BotHandle::start(session);

        // breakout candle completes at 09:35
        tokio::time::sleep(Duration::from_secs(27 * 60)).await;
        let status = handle.status().await;
        assert_eq!(status.phase, SessionPhase::InTrade);
        let position = status.current_position.unwrap();
        assert_eq!(position.side, TradeSide::Long);
        assert_eq!(position.remaining_quantity, 83);
        assert_eq!(broker.net_quantity(&Instrument::nse("INFY")), 83);
        assert_eq!(broker.open_stops().len(), 1);

        handle.stop();
        handle.join().await.unwrap();
        // stop leaves the position alone
        assert_eq!(broker.net_quantity(&Instrument::nse("INFY")), 83);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_closes_open_trade() {
        let market = Arc::new(InMemoryMarket::new());
        seed_market(&market);
        let broker = Arc::new(PaperBroker::new(d(50000, 0)));
        let store = Arc::new(MemoryTradeStore::new());
        let clock = Arc::new(TokioClock::starting_at(open() - ChronoDuration::minutes(5)));
        let mut config = config();
        config.entry.allow_recovery_trade = false;

        let executor = OrderExecutor::new(broker.clone(), ExecutorConfig::from(&config.execution));
        let session = TradingSession::new(
            Arc::new(config),
            SessionDeps {
                clock,
                market: market.clone(),
                executor,
                store: store.clone(),
            },
        )
        .unwrap();
        let handle = BotHandle::start(session);

        tokio::time::sleep(Duration::from_secs(27 * 60)).await;
        market.set_quote(&Instrument::nse("INFY"), Quote::at_price(d(1505, 0)));
        handle.liquidate();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let status = handle.status().await;
        assert!(status.current_position.is_none());
        assert_eq!(status.trades_today, 1);
        assert_eq!(status.realized_pnl_today, d(415, 0));
        assert_eq!(broker.net_quantity(&Instrument::nse("INFY")), 0);
        assert!(broker.open_stops().is_empty());

        let record = &store.records()[0];
        assert_eq!(record.close_reason, Some(CloseReason::Manual));

        handle.stop();
        handle.join().await.unwrap();
    }

    fn build(config: BotConfig, market: Arc<InMemoryMarket>, broker: Arc<PaperBroker>) -> TradingSession {
        let executor = OrderExecutor::new(broker, ExecutorConfig::from(&config.execution));
        TradingSession::new(
            Arc::new(config),
            SessionDeps {
                clock: Arc::new(TokioClock::starting_at(open() - ChronoDuration::minutes(5))),
                market,
                executor,
                store: Arc::new(MemoryTradeStore::new()),
            },
        )
        .unwrap()
    }

    fn losing_trade(number: u32) -> Trade {
        use orb_core::config::RiskConfig;

        let engine = RiskEngine::new(RiskConfig::default());
        let mut trade = Trade::open(NewTrade {
            instrument: Instrument::nse("INFY"),
            token: 1,
            side: TradeSide::Long,
            trade_number: number,
            entry_price: d(1500, 0),
            quantity: 10,
            stop_price: d(1490, 0),
            ladder: engine.build_target_ladder(TradeSide::Long, d(1500, 0), d(1490, 0), 10),
            partial_booking: true,
            opened_at: open(),
        });
        trade.realized_pnl = d(-100, 0);
        trade
    }

    #[tokio::test]
    async fn test_recovery_entries_capped_by_config() {
        let market = Arc::new(InMemoryMarket::new());
        let broker = Arc::new(PaperBroker::new(d(50000, 0)));
        let now = open() + ChronoDuration::minutes(30);
        let mut ctx = SessionContext::new(open().date_naive());

        let session = build(config(), market.clone(), broker.clone());
        ctx.trades_today = 1;
        ctx.closed_trades.push(losing_trade(1));
        assert!(session.may_enter(&ctx, now));

        // Two losses: the default allows a single recovery trade.
        ctx.trades_today = 2;
        ctx.closed_trades.push(losing_trade(2));
        assert!(!session.may_enter(&ctx, now));

        let mut config = config();
        config.entry.max_recovery_trades = 2;
        let session = build(config, market, broker);
        assert!(session.may_enter(&ctx, now));

        // Past the recovery cutoff
        let late = open() + ChronoDuration::minutes(95);
        assert!(!session.may_enter(&ctx, late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_trade_polled_through_market_data_backoff() {
        let infy = Instrument::nse("INFY");
        let market = Arc::new(InMemoryMarket::new());
        seed_market(&market);
        let broker = Arc::new(PaperBroker::new(d(50000, 0)));
        let mut config = config();
        config.entry.allow_recovery_trade = false;
        let handle = BotHandle::start(build(config, market.clone(), broker.clone()));

        // 09:37:15, between ticks
        tokio::time::sleep(Duration::from_secs(27 * 60 + 15)).await;
        assert_eq!(handle.status().await.phase, SessionPhase::InTrade);

        // Ticks at :37:30, :38:00 and :38:30 fail, backing off until 09:39:30.
        market.clear_quote(&infy);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(handle.status().await.phase, SessionPhase::InTrade);

        // The 09:39:00 tick falls inside the window and must still see the stop.
        market.set_quote(&infy, Quote::at_price(d(1400, 0)));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = handle.status().await;
        assert!(status.current_position.is_none());
        assert!(status.realized_pnl_today < Decimal::ZERO);

        handle.stop();
        handle.join().await.unwrap();
    }
}
