//! In-memory market data source.
//!
//! Backs paper trading (fed from snapshot files) and tests. Quotes can be
//! scripted: each `quote` call pops the next scripted value and the last one
//! sticks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

use super::MarketData;
use crate::types::{Candle, Instrument, Interval, Quote};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct QuoteFeed {
    current: Option<Quote>,
    script: VecDeque<Quote>,
}

#[derive(Debug, Default)]
pub struct InMemoryMarket {
    tokens: DashMap<Instrument, u64>,
    quotes: DashMap<Instrument, QuoteFeed>,
    candles: DashMap<(u64, Interval), Vec<Candle>>,
}

impl InMemoryMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instrument: Instrument, token: u64) {
        self.tokens.insert(instrument, token);
    }

    pub fn set_quote(&self, instrument: &Instrument, quote: Quote) {
        let mut feed = self.quotes.entry(instrument.clone()).or_default();
        feed.script.clear();
        feed.current = Some(quote);
    }

    /// Queue quotes to be returned one per call.
    pub fn script_quotes(&self, instrument: &Instrument, quotes: impl IntoIterator<Item = Quote>) {
        let mut feed = self.quotes.entry(instrument.clone()).or_default();
        feed.script.extend(quotes);
    }

    pub fn clear_quote(&self, instrument: &Instrument) {
        self.quotes.remove(instrument);
    }

    /// Replaces the stored series. Candles are kept sorted by time.
    pub fn set_candles(&self, token: u64, interval: Interval, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.time);
        candles.dedup_by_key(|c| c.time);
        self.candles.insert((token, interval), candles);
    }

    /// Appends or replaces a single candle by time.
    pub fn upsert_candle(&self, token: u64, interval: Interval, candle: Candle) {
        let mut series = self.candles.entry((token, interval)).or_default();
        match series.binary_search_by_key(&candle.time, |c| c.time) {
            Ok(i) => series[i] = candle,
            Err(i) => series.insert(i, candle),
        }
    }
}

#[async_trait]
impl MarketData for InMemoryMarket {
    async fn quote(&self, instrument: &Instrument) -> Result<Quote> {
        let mut feed = self
            .quotes
            .get_mut(instrument)
            .ok_or_else(|| Error::market_data(format!("no quote for {instrument}")))?;
        if let Some(next) = feed.script.pop_front() {
            feed.current = Some(next);
        }
        feed.current
            .clone()
            .ok_or_else(|| Error::market_data(format!("no quote for {instrument}")))
    }

    async fn historical_candles(
        &self,
        token: u64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        interval: Interval,
    ) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .get(&(token, interval))
            .map(|series| {
                series
                    .iter()
                    .filter(|c| c.time >= from && c.time <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn instrument_token(&self, instrument: &Instrument) -> Result<Option<u64>> {
        Ok(self.tokens.get(instrument).map(|t| *t))
    }
}
