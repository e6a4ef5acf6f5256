// src/store/memory.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{DedupLedger, SourceRegistry, StoreState, WatermarkStore};
use crate::error::Result;
use crate::ids::ItemId;
use crate::source::Source;

/// Process-local store. Loses everything on restart; meant for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            inner: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> StoreState {
        self.inner.read().clone()
    }
}

#[async_trait]
impl SourceRegistry for MemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(self.inner.read().sources.values().cloned().collect())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.inner.read().sources.get(id).cloned())
    }

    async fn upsert_source(&self, source: Source) -> Result<()> {
        self.inner.write().upsert_source(source);
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        Ok(self.inner.write().set_active(id, active))
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().remove_source(id))
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get_watermark(&self, source_id: &str) -> Result<Option<ItemId>> {
        Ok(self.inner.read().watermark(source_id))
    }

    async fn commit_watermark(&self, source_id: &str, new_id: &ItemId) -> Result<bool> {
        Ok(self.inner.write().commit_watermark(source_id, new_id))
    }
}

#[async_trait]
impl DedupLedger for MemoryStore {
    async fn is_processed(&self, item_id: &str, match_key: &str) -> Result<bool> {
        Ok(self.inner.read().is_processed(item_id, match_key))
    }

    async fn mark_processed(&self, item_id: &str, match_key: &str, source_id: &str) -> Result<()> {
        self.inner
            .write()
            .mark_processed(item_id, match_key, source_id, Utc::now());
        Ok(())
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.inner.write().prune_processed(cutoff))
    }
}
