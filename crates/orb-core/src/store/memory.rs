//! In-memory trade store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::{TradeRecord, TradeStore, TradeUpdate};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryTradeStore {
    records: DashMap<Uuid, TradeRecord>,
    updates: DashMap<Uuid, u32>,
    failing: AtomicBool,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get(&self, id: &Uuid) -> Option<TradeRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn records(&self) -> Vec<TradeRecord> {
        let mut all: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| (r.opened_at, r.trade_number));
        all
    }

    pub fn update_count(&self, id: &Uuid) -> u32 {
        self.updates.get(id).map(|c| *c).unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Persistence {
                message: "store unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn create_trade(&self, record: &TradeRecord) -> Result<Uuid> {
        self.check_available()?;
        self.records.insert(record.id, record.clone());
        Ok(record.id)
    }

    async fn update_trade(&self, id: Uuid, update: &TradeUpdate) -> Result<bool> {
        self.check_available()?;
        match self.records.get_mut(&id) {
            Some(mut record) => {
                update.apply(&mut record);
                *self.updates.entry(id).or_insert(0) += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
