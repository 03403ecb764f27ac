//! Append-only JSON-lines trade log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{TradeRecord, TradeStore, TradeUpdate};
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogEvent {
    Create {
        at: DateTime<Utc>,
        record: TradeRecord,
    },
    Update {
        at: DateTime<Utc>,
        id: Uuid,
        update: TradeUpdate,
    },
}

/// Writes one JSON object per line. Known ids are tracked so updates to
/// unknown trades report `false`.
pub struct JsonlTradeStore {
    path: PathBuf,
    known: Mutex<HashSet<Uuid>>,
}

impl JsonlTradeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            known: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &LogEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rebuild the latest state of every trade in a log.
    pub async fn replay(path: impl AsRef<Path>) -> Result<HashMap<Uuid, TradeRecord>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut records = HashMap::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogEvent>(line)? {
                LogEvent::Create { record, .. } => {
                    records.insert(record.id, record);
                }
                LogEvent::Update { id, update, .. } => {
                    if let Some(record) = records.get_mut(&id) {
                        update.apply(record);
                    }
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TradeStore for JsonlTradeStore {
    async fn create_trade(&self, record: &TradeRecord) -> Result<Uuid> {
        self.append(&LogEvent::Create {
            at: Utc::now(),
            record: record.clone(),
        })
        .await?;
        self.known.lock().await.insert(record.id);
        Ok(record.id)
    }

    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<bool> {
        if !self.known.lock().await.contains(&id) {
            return Ok(false);
        }
        self.append(&LogEvent::Update {
            at: Utc::now(),
            id,
            update: update.clone(),
        })
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instrument, TradeSide, TradeState};
    use rust_decimal::Decimal;

    fn record() -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            instrument: Instrument::nse("INFY"),
            side: TradeSide::Long,
            trade_number: 1,
            entry_price: Decimal::new(1500, 0),
            quantity: 83,
            remaining_quantity: 83,
            stop_price: Decimal::new(14625, 1),
            targets: vec![],
            state: TradeState::Open,
            realized_pnl: Decimal::ZERO,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            fills: vec![],
        }
    }

    #[tokio::test]
    async fn test_log_replays_latest_state() {
        let path = std::env::temp_dir().join(format!("orb-trades-{}.jsonl", Uuid::new_v4()));
        let store = JsonlTradeStore::new(&path);
        let rec = record();

        store.create_trade(&rec).await.unwrap();
        let update = TradeUpdate {
            state: Some(TradeState::Stage1Done),
            remaining_quantity: Some(63),
            ..Default::default()
        };
        assert!(store.update_trade(rec.id, &update).await.unwrap());
        assert!(!store.update_trade(Uuid::new_v4(), &update).await.unwrap());

        let replayed = JsonlTradeStore::replay(&path).await.unwrap();
        let got = &replayed[&rec.id];
        assert_eq!(got.state, TradeState::Stage1Done);
        assert_eq!(got.remaining_quantity, 63);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
