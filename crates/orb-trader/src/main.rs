//! ORB Trader
//!
//! Intraday opening-range / VWAP breakout trader running against a paper
//! broker fed by market snapshot files.

mod feed;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orb_core::api::InMemoryMarket;
use orb_core::clock::SystemClock;
use orb_core::config::BotConfig;
use orb_core::store::{JsonlTradeStore, MemoryTradeStore, TradeStore};
use orb_core::types::TradeSide;
use risk_manager::{apply_distance_factor, PositionSizer, RiskEngine};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trading_engine::{BotHandle, ExecutorConfig, OrderExecutor, PaperBroker, SessionDeps, TradingSession};

use crate::feed::FileFeed;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_FILTER: &str = "orb_trader=info,trading_engine=info,risk_manager=info,orb_core=warn";
const FEED_REFRESH: Duration = Duration::from_secs(5);
const STATUS_EVERY: Duration = Duration::from_secs(300);

/// Opening-range breakout trader
#[derive(Parser, Debug)]
#[command(name = "orb-trader", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the trading loop until Ctrl-C
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory of per-symbol market snapshot files
        #[arg(long)]
        feed_dir: Option<PathBuf>,
        /// Paper account balance (defaults to the configured starting capital)
        #[arg(long)]
        balance: Option<Decimal>,
    },
    /// Resolve and validate the configuration, then print it
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging() {
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()),
    );
    if std::env::var_os("ORB_LOG_JSON").is_some() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Run {
            config,
            feed_dir,
            balance,
        } => run(config, feed_dir, balance).await,
        Command::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BotConfig> {
    BotConfig::load(path.as_deref()).context("failed to load configuration")
}

async fn run(config_path: Option<PathBuf>, feed_dir: Option<PathBuf>, balance: Option<Decimal>) -> Result<()> {
    info!("Starting ORB Trader v{}", env!("CARGO_PKG_VERSION"));
    let config = Arc::new(load_config(config_path)?);
    info!(
        symbols = config.symbols.len(),
        index = %config.index,
        starting_capital = %config.capital.starting_capital,
        breaker_pct = %config.breaker.max_daily_loss_pct,
        "Configuration loaded"
    );

    let market = Arc::new(InMemoryMarket::new());
    let broker = Arc::new(PaperBroker::new(
        balance.unwrap_or(config.capital.starting_capital),
    ));
    let store: Arc<dyn TradeStore> = match &config.store.trade_log {
        Some(path) => {
            info!(path = %path, "Logging trades to file");
            Arc::new(JsonlTradeStore::new(path))
        }
        None => Arc::new(MemoryTradeStore::new()),
    };

    let feed_task = match feed_dir {
        Some(dir) => {
            let mut instruments = config.symbols.clone();
            instruments.push(config.index.clone());
            let mut feed = FileFeed::new(dir, instruments, market.clone(), broker.clone());
            let loaded = feed.refresh_once().await;
            info!(loaded, "Initial market snapshots loaded");
            Some(feed.spawn(FEED_REFRESH))
        }
        None => {
            warn!("No feed directory given, market data will stay empty");
            None
        }
    };

    let executor = OrderExecutor::new(broker.clone(), ExecutorConfig::from(&config.execution));
    let session = TradingSession::new(
        config.clone(),
        SessionDeps {
            clock: Arc::new(SystemClock),
            market,
            executor,
            store,
        },
    )?;
    let handle = BotHandle::start(session);

    let mut status_ticker = tokio::time::interval(STATUS_EVERY);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
                break;
            }
            _ = status_ticker.tick() => {
                let status = handle.status().await;
                info!(
                    phase = ?status.phase,
                    trades_today = status.trades_today,
                    realized_pnl = %status.realized_pnl_today,
                    in_trade = status.current_position.is_some(),
                    breaker_tripped = status.breaker_tripped,
                    "Status"
                );
            }
        }
    }

    handle.stop();
    let result = handle.join().await;
    if let Some(task) = feed_task {
        task.abort();
    }
    result?;
    info!("ORB Trader stopped");
    Ok(())
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);

    // Example ladder: long at 1500 with a raw stop at 1425.
    let entry = Decimal::new(1500, 0);
    let stop = apply_distance_factor(entry, Decimal::new(1425, 0), config.risk.stop_distance_factor);
    let quantity = PositionSizer::new(config.capital.clone())
        .size(config.capital.starting_capital, entry)
        .map(|s| s.quantity)
        .unwrap_or(0);
    let ladder = RiskEngine::new(config.risk.clone()).build_target_ladder(TradeSide::Long, entry, stop, quantity);

    println!();
    println!("Example long @ {entry}, stop {stop}, quantity {quantity}:");
    for leg in &ladder.legs {
        println!(
            "  {}R -> {} (close {} = {} shares)",
            leg.r_multiple, leg.price, leg.close_pct, leg.quantity
        );
    }
    Ok(())
}
