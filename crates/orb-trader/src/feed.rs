//! File-snapshot market feed.
//!
//! An external feeder writes one JSON file per symbol into a directory,
//! named `<SYMBOL>.json`. Each refresh loads changed files into the
//! in-memory market and marks the paper broker at the quote's last price.

use anyhow::{Context, Result};
use orb_core::api::InMemoryMarket;
use orb_core::types::{Candle, Instrument, Interval, Quote};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trading_engine::PaperBroker;

#[derive(Debug, Deserialize)]
pub struct CandleSeries {
    pub interval: Interval,
    pub candles: Vec<Candle>,
}

/// Contents of one snapshot file.
#[derive(Debug, Deserialize)]
pub struct FeedSnapshot {
    pub token: u64,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub series: Vec<CandleSeries>,
}

pub struct FileFeed {
    dir: PathBuf,
    instruments: Vec<Instrument>,
    market: Arc<InMemoryMarket>,
    broker: Arc<PaperBroker>,
    /// Last loaded modification time per file.
    seen: HashMap<PathBuf, SystemTime>,
}

impl FileFeed {
    pub fn new(
        dir: impl Into<PathBuf>,
        instruments: Vec<Instrument>,
        market: Arc<InMemoryMarket>,
        broker: Arc<PaperBroker>,
    ) -> Self {
        Self {
            dir: dir.into(),
            instruments,
            market,
            broker,
            seen: HashMap::new(),
        }
    }

    fn path_for(&self, instrument: &Instrument) -> PathBuf {
        self.dir.join(format!("{}.json", instrument.symbol))
    }

    /// Load every changed snapshot. Returns how many files were applied.
    pub async fn refresh_once(&mut self) -> usize {
        let mut applied = 0;
        for instrument in self.instruments.clone() {
            let path = self.path_for(&instrument);
            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if self.seen.get(&path).is_some_and(|seen| *seen >= modified) {
                continue;
            }

            match load_snapshot(&path).await {
                Ok(snapshot) => {
                    self.apply(&instrument, snapshot);
                    self.seen.insert(path, modified);
                    applied += 1;
                }
                Err(e) => warn!(symbol = %instrument, error = %e, "Skipping unreadable snapshot"),
            }
        }
        applied
    }

    fn apply(&self, instrument: &Instrument, snapshot: FeedSnapshot) {
        self.market.register(instrument.clone(), snapshot.token);
        if let Some(quote) = snapshot.quote {
            self.broker.mark(instrument, quote.last_price);
            self.market.set_quote(instrument, quote);
        }
        for series in snapshot.series {
            debug!(
                symbol = %instrument,
                interval = %series.interval,
                candles = series.candles.len(),
                "Snapshot candles loaded"
            );
            self.market.set_candles(snapshot.token, series.interval, series.candles);
        }
    }

    /// Refresh on a fixed interval until the task is aborted.
    pub fn spawn(mut self, every: Duration) -> JoinHandle<()> {
        info!(dir = %self.dir.display(), every_secs = every.as_secs(), "Starting file feed");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let applied = self.refresh_once().await;
                if applied > 0 {
                    debug!(applied, "File feed refreshed");
                }
            }
        })
    }
}

async fn load_snapshot(path: &Path) -> Result<FeedSnapshot> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid snapshot {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::api::MarketData;
    use orb_core::api::Broker;
    use rust_decimal::Decimal;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orb-feed-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const SNAPSHOT: &str = r#"{
        "token": 408065,
        "quote": { "last_price": "1500.5", "volume": 1200000 },
        "series": [
            {
                "interval": "15minute",
                "candles": [
                    { "time": "2026-03-02T03:45:00Z", "open": "1490", "high": "1495",
                      "low": "1485", "close": "1492", "volume": 40000 }
                ]
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_refresh_loads_quote_candles_and_marks() {
        let dir = temp_dir();
        std::fs::write(dir.join("INFY.json"), SNAPSHOT).unwrap();
        std::fs::write(dir.join("TCS.json"), "{ not json").unwrap();

        let market = Arc::new(InMemoryMarket::new());
        let broker = Arc::new(PaperBroker::new(Decimal::new(50000, 0)));
        let infy = Instrument::nse("INFY");
        let mut feed = FileFeed::new(
            &dir,
            vec![infy.clone(), Instrument::nse("TCS"), Instrument::nse("HDFCBANK")],
            market.clone(),
            broker.clone(),
        );

        assert_eq!(feed.refresh_once().await, 1);
        assert_eq!(market.instrument_token(&infy).await.unwrap(), Some(408065));
        assert_eq!(market.quote(&infy).await.unwrap().last_price, Decimal::new(15005, 1));

        let from = "2026-03-02T03:45:00Z".parse().unwrap();
        let to = "2026-03-02T04:00:00Z".parse().unwrap();
        let candles = market
            .historical_candles(408065, from, to, Interval::Minute15)
            .await
            .unwrap();
        assert_eq!(candles.len(), 1);

        // market orders fill at the mark
        let order = orb_core::types::OrderRequest::market(
            "t:entry".to_string(),
            infy.clone(),
            orb_core::types::OrderSide::Buy,
            10,
        );
        broker.place_order(&order).await.unwrap();
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].average_price, Decimal::new(15005, 1));

        // unchanged files are not reloaded
        assert_eq!(feed.refresh_once().await, 0);
        std::fs::remove_dir_all(dir).ok();
    }
}
