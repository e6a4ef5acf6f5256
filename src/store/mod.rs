// src/store/mod.rs
//! Durable state: the source registry, per-source watermarks and the dedup ledger.
//!
//! Watermarks bound what to fetch next; the ledger bounds what to emit. The two
//! are independent so a lost watermark can only cause refetching, never re-emission.

pub mod json_file;
pub mod memory;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ids::ItemId;
use crate::source::{Source, SourceKind};

/// One emitted (item, match) pair. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedKey {
    pub item_id: String,
    pub match_key: String,
    pub source_id: String,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait SourceRegistry: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn active_sources(&self) -> Result<Vec<Source>> {
        Ok(self
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    async fn upsert_source(&self, source: Source) -> Result<()>;

    /// Returns false if the source does not exist.
    async fn set_active(&self, id: &str, active: bool) -> Result<bool>;

    /// Drops the source and its watermark. Ledger entries are kept.
    async fn remove_source(&self, id: &str) -> Result<bool>;

    /// Register (or reactivate) the source for `external_id` under `kind`.
    /// A new source starts with no watermark, so its first poll is a backfill.
    async fn register_source(&self, external_id: &str, kind: SourceKind) -> Result<Source> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(Error::Config("external id must not be empty".into()));
        }
        let id = source_id_for(external_id, kind);
        if let Some(mut existing) = self.get_source(&id).await? {
            if !existing.active {
                self.set_active(&id, true).await?;
                existing.active = true;
            }
            return Ok(existing);
        }
        let source = Source::new(id, external_id, kind);
        self.upsert_source(source.clone()).await?;
        tracing::info!(source_id = %source.id, kind = kind.as_str(), "source registered");
        Ok(source)
    }

    async fn deactivate_source(&self, id: &str) -> Result<bool> {
        self.set_active(id, false).await
    }
}

/// Stable id for a (kind, identity) pair; identities compare case-insensitively.
pub fn source_id_for(external_id: &str, kind: SourceKind) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(external_id.trim().to_ascii_lowercase().as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("src_{}", &hex[..12])
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get_watermark(&self, source_id: &str) -> Result<Option<ItemId>>;

    /// Advances the watermark; a value below the current one is ignored.
    /// Returns whether anything changed.
    async fn commit_watermark(&self, source_id: &str, new_id: &ItemId) -> Result<bool>;
}

#[async_trait]
pub trait DedupLedger: Send + Sync {
    async fn is_processed(&self, item_id: &str, match_key: &str) -> Result<bool>;

    /// Idempotent: marking an already-processed pair is a no-op.
    async fn mark_processed(&self, item_id: &str, match_key: &str, source_id: &str) -> Result<()>;

    /// Forget entries older than `cutoff`. Returns how many were removed.
    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Everything the coordinator and the webhook path need from persistence.
pub trait StateStore: SourceRegistry + WatermarkStore + DedupLedger {}

impl<T: SourceRegistry + WatermarkStore + DedupLedger + ?Sized> StateStore for T {}

/// Plain serializable state shared by the backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreState {
    #[serde(default)]
    pub sources: BTreeMap<String, Source>,
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessedKey>,
}

fn ledger_key(item_id: &str, match_key: &str) -> String {
    format!("{item_id}\u{1f}{match_key}")
}

impl StoreState {
    pub fn upsert_source(&mut self, source: Source) {
        self.sources.insert(source.id.clone(), source);
    }

    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        match self.sources.get_mut(id) {
            Some(s) => {
                s.active = active;
                true
            }
            None => false,
        }
    }

    pub fn remove_source(&mut self, id: &str) -> bool {
        self.sources.remove(id).is_some()
    }

    pub fn watermark(&self, source_id: &str) -> Option<ItemId> {
        self.sources.get(source_id).and_then(|s| s.watermark.clone())
    }

    pub fn commit_watermark(&mut self, source_id: &str, new_id: &ItemId) -> bool {
        let Some(source) = self.sources.get_mut(source_id) else {
            return false;
        };
        match &source.watermark {
            Some(current) if current >= new_id => false,
            _ => {
                source.watermark = Some(new_id.clone());
                true
            }
        }
    }

    pub fn is_processed(&self, item_id: &str, match_key: &str) -> bool {
        self.processed.contains_key(&ledger_key(item_id, match_key))
    }

    /// Returns true when the pair was newly inserted.
    pub fn mark_processed(
        &mut self,
        item_id: &str,
        match_key: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = ledger_key(item_id, match_key);
        if self.processed.contains_key(&key) {
            return false;
        }
        self.processed.insert(
            key,
            ProcessedKey {
                item_id: item_id.to_string(),
                match_key: match_key.to_string(),
                source_id: source_id.to_string(),
                processed_at: now,
            },
        );
        true
    }

    pub fn prune_processed(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.processed.len();
        self.processed.retain(|_, k| k.processed_at >= cutoff);
        before - self.processed.len()
    }
}
