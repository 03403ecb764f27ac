//! Configuration management for the ORB bot.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `ORB__SECTION__KEY` environment overrides. The result is validated once and
//! shared read-only for the whole session.

use crate::types::{EntryWindow, Instrument, Interval};
use crate::{Error, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub capital: CapitalConfig,
    /// Monitored symbols in scan order. The first qualifier in a tick wins.
    pub symbols: Vec<Instrument>,
    /// Broad index used for the bias filter.
    pub index: Instrument,
    pub session: SessionConfig,
    pub entry: EntryConfig,
    pub filters: FilterConfig,
    pub risk: RiskConfig,
    pub breaker: BreakerConfig,
    pub execution: ExecutionConfig,
    pub store: StoreConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        let symbols = [
            "TATASTEEL", "GOKEX", "SILVERBEES", "MOTHERSON", "ETERNAL", "ITBEES", "HDFCBANK",
            "INFY", "ICICIBANK", "TCS", "BAJAJFINSV",
        ]
        .into_iter()
        .map(Instrument::nse)
        .collect();

        Self {
            capital: CapitalConfig::default(),
            symbols,
            index: Instrument::nse("NIFTY 50"),
            session: SessionConfig::default(),
            entry: EntryConfig::default(),
            filters: FilterConfig::default(),
            risk: RiskConfig::default(),
            breaker: BreakerConfig::default(),
            execution: ExecutionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapitalConfig {
    /// Fallback balance when the broker cannot report one.
    pub starting_capital: Decimal,
    pub use_leverage: bool,
    pub leverage: Decimal,
    /// Fraction of balance committed per trade.
    pub utilization: Decimal,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            starting_capital: Decimal::new(20000, 0),
            use_leverage: true,
            leverage: Decimal::new(5, 0), // 5x intraday margin
            utilization: Decimal::new(50, 2), // 50%
        }
    }
}

/// Market-local session times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Market timezone as a fixed offset from UTC, in minutes.
    pub utc_offset_minutes: i32,
    #[serde(with = "hhmm")]
    pub market_open: NaiveTime,
    /// End of the opening-range candle; setups lock here.
    #[serde(with = "hhmm")]
    pub range_end: NaiveTime,
    #[serde(with = "hhmm")]
    pub eod_cutoff: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330, // IST
            market_open: hm(9, 15),
            range_end: hm(9, 30),
            eod_cutoff: hm(15, 25),
        }
    }
}

/// How a recovery trade is measured by the daily loss breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryBudget {
    /// The recovery trade draws on the same session loss budget.
    Shared,
    /// The breaker re-baselines when the recovery trade opens.
    Independent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    #[serde(with = "hhmm")]
    pub primary_start: NaiveTime,
    /// Primary window ends and the soft window begins.
    #[serde(with = "hhmm")]
    pub soft_start: NaiveTime,
    /// No entries at or after this time.
    #[serde(with = "hhmm")]
    pub hard_cutoff: NaiveTime,
    pub max_trades_per_day: u32,
    pub max_trades_per_symbol: u32,
    /// Allow another trade after a losing one.
    pub allow_recovery_trade: bool,
    #[serde(with = "hhmm")]
    pub recovery_cutoff: NaiveTime,
    /// Losing trades that may each be followed by another entry.
    pub max_recovery_trades: u32,
    pub recovery_budget: RecoveryBudget,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            primary_start: hm(9, 30),
            soft_start: hm(10, 15),
            hard_cutoff: hm(10, 45),
            max_trades_per_day: 999,
            max_trades_per_symbol: 999,
            allow_recovery_trade: true,
            recovery_cutoff: hm(10, 45),
            max_recovery_trades: 1,
            recovery_budget: RecoveryBudget::Shared,
        }
    }
}

impl EntryConfig {
    pub fn window_at(&self, local: NaiveTime) -> EntryWindow {
        if local < self.primary_start {
            EntryWindow::NotOpen
        } else if local < self.soft_start {
            EntryWindow::Primary
        } else if local < self.hard_cutoff {
            EntryWindow::Soft
        } else {
            EntryWindow::Closed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Entry candle interval.
    pub candle_interval: Interval,
    /// Opening-range candle interval.
    pub range_interval: Interval,

    pub use_volume_filter: bool,
    pub volume_multiplier: Decimal,
    pub volume_lookback_candles: usize,
    /// Below this many baseline candles the volume filter passes.
    pub min_volume_candles: usize,
    pub soft_volume_multiplier: Decimal,
    pub use_time_of_day_volume: bool,
    pub volume_factors: VolumeFactors,

    pub use_index_bias: bool,
    /// Soft mode only blocks on a strong opposing bias.
    pub index_soft_bias: bool,
    pub index_strong_threshold_pct: Decimal,
    pub index_refresh_secs: u64,

    pub use_trend_filter: bool,
    pub trend_interval: Interval,
    pub trend_refresh_secs: u64,

    pub use_liquidity_filter: bool,
    pub min_daily_volume: u64,
    pub max_spread_pct: Decimal,

    pub use_range_filter: bool,
    pub range_min_pct: Decimal,
    pub range_max_pct: Decimal,

    pub use_retest: bool,
    pub retest_zone_pct: Decimal,
    pub retest_max_candles: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            candle_interval: Interval::Minute5,
            range_interval: Interval::Minute15,
            use_volume_filter: true,
            volume_multiplier: Decimal::new(15, 1), // 1.5x baseline
            volume_lookback_candles: 20,
            min_volume_candles: 5,
            soft_volume_multiplier: Decimal::new(2, 0),
            use_time_of_day_volume: true,
            volume_factors: VolumeFactors::default(),
            use_index_bias: true,
            index_soft_bias: true,
            index_strong_threshold_pct: Decimal::new(25, 2), // 0.25%
            index_refresh_secs: 300,
            use_trend_filter: true,
            trend_interval: Interval::Minute15,
            trend_refresh_secs: 300,
            use_liquidity_filter: true,
            min_daily_volume: 500_000,
            max_spread_pct: Decimal::new(2, 1), // 0.2%
            use_range_filter: true,
            range_min_pct: Decimal::new(1, 1),
            range_max_pct: Decimal::new(25, 1),
            use_retest: true,
            retest_zone_pct: Decimal::new(8, 2), // 0.08%
            retest_max_candles: 3,
        }
    }
}

/// Time-of-day scaling for the volume requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeFactors {
    #[serde(with = "hhmm")]
    pub early_until: NaiveTime,
    pub early: Decimal,
    #[serde(with = "hhmm")]
    pub mid_until: NaiveTime,
    pub mid: Decimal,
    #[serde(with = "hhmm")]
    pub late_until: NaiveTime,
    pub late: Decimal,
    pub close: Decimal,
}

impl Default for VolumeFactors {
    fn default() -> Self {
        Self {
            early_until: hm(10, 15),
            early: Decimal::new(12, 1),
            mid_until: hm(12, 30),
            mid: Decimal::ONE,
            late_until: hm(14, 30),
            late: Decimal::new(8, 1),
            close: Decimal::new(9, 1),
        }
    }
}

impl VolumeFactors {
    pub fn factor_at(&self, local: NaiveTime) -> Decimal {
        if local < self.early_until {
            self.early
        } else if local < self.mid_until {
            self.mid
        } else if local < self.late_until {
            self.late
        } else {
            self.close
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fixed trigger buffer used when ATR is unavailable.
    pub buffer_amount: Decimal,
    pub use_atr_buffer: bool,
    pub atr_period: usize,
    pub atr_buffer_multiplier: Decimal,

    /// Stop at the tighter of VWAP and the signal candle extreme.
    pub use_dynamic_stop: bool,
    pub dynamic_stop_buffer: Decimal,
    /// Scales the raw stop distance; below 1 tightens.
    pub stop_distance_factor: Decimal,

    pub partial_booking: bool,
    /// Ladder R-multiples, ascending. The last rung is the final target.
    pub target_r_multiples: Vec<Decimal>,
    pub target_close_pcts: Vec<Decimal>,
    /// Profit in R at which the stop moves to entry.
    pub breakeven_at_r: Decimal,

    pub use_atr_trailing: bool,
    pub atr_trail_multiplier: Decimal,
    pub atr_trail_start_r: Decimal,
    pub atr_trail_refresh_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            buffer_amount: Decimal::new(10, 2),
            use_atr_buffer: true,
            atr_period: 10,
            atr_buffer_multiplier: Decimal::new(2, 1),
            use_dynamic_stop: true,
            dynamic_stop_buffer: Decimal::new(5, 2),
            stop_distance_factor: Decimal::new(5, 1),
            partial_booking: true,
            target_r_multiples: vec![Decimal::new(5, 1), Decimal::ONE, Decimal::new(2, 0)],
            target_close_pcts: vec![Decimal::new(25, 2), Decimal::new(50, 2), Decimal::new(25, 2)],
            breakeven_at_r: Decimal::ONE,
            use_atr_trailing: true,
            atr_trail_multiplier: Decimal::new(12, 1),
            atr_trail_start_r: Decimal::new(15, 1),
            atr_trail_refresh_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Fraction of starting capital, e.g. 0.02 = 2%.
    pub max_daily_loss_pct: Decimal,
    /// Flatten every broker position on trip.
    pub auto_liquidate: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_daily_loss_pct: Decimal::new(2, 2),
            auto_liquidate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub use_limit_orders: bool,
    /// Limit price offset from the signal price.
    pub limit_order_buffer: Decimal,
    pub poll_interval_secs: u64,
    /// Wall-clock budget for one symbol sweep.
    pub scan_budget_ms: u64,
    pub exit_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Consecutive failures before a dependency enters backoff.
    pub failure_threshold: u32,
    pub backoff_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            use_limit_orders: true,
            limit_order_buffer: Decimal::new(20, 2),
            poll_interval_secs: 30,
            scan_budget_ms: 20_000,
            exit_max_attempts: 2, // one retry
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 4_000,
            failure_threshold: 3,
            backoff_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON-lines trade log. In-memory only when unset.
    pub trade_log: Option<String>,
}

impl BotConfig {
    /// Load configuration from an optional file plus environment overrides.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("ORB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BotConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::config("at least one symbol must be configured"));
        }

        let unit = |name: &str, v: Decimal| {
            if v <= Decimal::ZERO || v > Decimal::ONE {
                Err(Error::config(format!("{name} must be in (0, 1], got {v}")))
            } else {
                Ok(())
            }
        };
        unit("capital.utilization", self.capital.utilization)?;
        unit("breaker.max_daily_loss_pct", self.breaker.max_daily_loss_pct)?;

        if self.capital.leverage < Decimal::ONE {
            return Err(Error::config("capital.leverage must be >= 1"));
        }
        if self.capital.starting_capital <= Decimal::ZERO {
            return Err(Error::config("capital.starting_capital must be positive"));
        }
        if self.risk.stop_distance_factor <= Decimal::ZERO {
            return Err(Error::config("risk.stop_distance_factor must be positive"));
        }

        let r = &self.risk.target_r_multiples;
        let pcts = &self.risk.target_close_pcts;
        if r.is_empty() || r.len() != pcts.len() {
            return Err(Error::config(
                "risk.target_r_multiples and risk.target_close_pcts must be non-empty and the same length",
            ));
        }
        if r.iter().any(|m| *m <= Decimal::ZERO) || r.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::config("risk.target_r_multiples must be positive and ascending"));
        }
        if pcts.iter().any(|p| *p < Decimal::ZERO) {
            return Err(Error::config("risk.target_close_pcts must be non-negative"));
        }
        if pcts.iter().sum::<Decimal>() > Decimal::ONE {
            return Err(Error::config("risk.target_close_pcts must sum to at most 1"));
        }

        let e = &self.entry;
        if !(e.primary_start <= e.soft_start && e.soft_start <= e.hard_cutoff) {
            return Err(Error::config(
                "entry window must satisfy primary_start <= soft_start <= hard_cutoff",
            ));
        }
        let s = &self.session;
        if !(s.market_open < s.range_end && s.range_end <= e.primary_start) {
            return Err(Error::config(
                "session must satisfy market_open < range_end <= entry.primary_start",
            ));
        }
        if e.hard_cutoff >= s.eod_cutoff {
            return Err(Error::config("entry.hard_cutoff must be before session.eod_cutoff"));
        }
        if self.filters.range_min_pct > self.filters.range_max_pct {
            return Err(Error::config("filters.range_min_pct must be <= range_max_pct"));
        }
        if self.execution.poll_interval_secs == 0 {
            return Err(Error::config("execution.poll_interval_secs must be positive"));
        }
        if self.execution.exit_max_attempts == 0 {
            return Err(Error::config("execution.exit_max_attempts must be at least 1"));
        }
        if self.risk.atr_period == 0 {
            return Err(Error::config("risk.atr_period must be positive"));
        }

        Ok(())
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// `"HH:MM"` (or `"HH:MM:SS"`) time-of-day fields.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time '{raw}': {e}")))
    }
}
