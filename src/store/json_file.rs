// src/store/json_file.rs
//! JSON file backend: a state snapshot plus an append-only ledger journal.
//!
//! Registry and watermark mutations are applied to a copy of the state, flushed
//! to `<path>.tmp` and renamed over `<path>`; only then does the copy replace
//! the in-memory state. A failed flush leaves disk and memory at the previous
//! state.
//!
//! Ledger marks are the hot path (one per emitted event) and are appended as a
//! JSON line to `<path>.ledger` instead, so a mark costs O(1) regardless of how
//! large the ledger has grown. The journal is folded into the snapshot on open
//! and after every full flush. Replaying a journal line twice is harmless since
//! marking is idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{DedupLedger, ProcessedKey, SourceRegistry, StoreState, WatermarkStore};
use crate::error::{Error, Result};
use crate::ids::ItemId;
use crate::source::Source;

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    ledger_path: PathBuf,
    state: RwLock<StoreState>,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut p = path.to_path_buf().into_os_string();
    p.push(suffix);
    PathBuf::from(p)
}

impl JsonFileStore {
    /// Open (or create) the state file. A present but unreadable file is an error:
    /// silently starting empty would re-emit every previously seen item.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ledger_path = sibling(&path, ".ledger");
        let mut state = match fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => StoreState::default(),
            Ok(s) => serde_json::from_str(&s).map_err(|e| {
                Error::persistence(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).await?;
                    }
                }
                StoreState::default()
            }
            Err(e) => {
                return Err(Error::persistence(format!(
                    "reading state file {}: {e}",
                    path.display()
                )))
            }
        };

        let replayed = replay_journal(&ledger_path, &mut state).await?;
        let store = Self {
            path,
            ledger_path,
            state: RwLock::new(state),
        };
        if replayed > 0 {
            let st = store.state.read().await;
            store.flush(&st).await?;
        }

        let st = store.state.read().await;
        tracing::info!(
            path = %store.path.display(),
            sources = st.sources.len(),
            processed = st.processed.len(),
            replayed,
            "state store opened"
        );
        drop(st);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where ledger marks are appended between snapshots.
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Write the full snapshot, then empty the journal it now contains.
    async fn flush(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::persistence(format!("serialize state: {e}")))?;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;

        match fs::metadata(&self.ledger_path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                if let Err(e) = fs::write(&self.ledger_path, b"").await {
                    // Replay is idempotent; a stale journal only costs startup time.
                    tracing::warn!(path = %self.ledger_path.display(), error = %e, "ledger journal not truncated");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply `f` to a copy, persist it, then publish. Skips the write when `f`
    /// reports no change.
    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> (R, bool)) -> Result<R> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let (out, changed) = f(&mut next);
        if changed {
            self.flush(&next).await?;
            *guard = next;
        }
        Ok(out)
    }

    async fn append_mark(&self, key: &ProcessedKey) -> Result<()> {
        let mut line = serde_json::to_vec(key)
            .map_err(|e| Error::persistence(format!("serialize ledger entry: {e}")))?;
        line.push(b'\n');
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .await?;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }
}

/// Fold journal lines into `state`. A torn final line (crash mid-append) is
/// skipped; garbage anywhere else means the journal is corrupt.
async fn replay_journal(path: &Path, state: &mut StoreState) -> Result<usize> {
    let body = match fs::read_to_string(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(Error::persistence(format!(
                "reading ledger journal {}: {e}",
                path.display()
            )))
        }
    };
    let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut replayed = 0;
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<ProcessedKey>(line) {
            Ok(k) => {
                state.mark_processed(&k.item_id, &k.match_key, &k.source_id, k.processed_at);
                replayed += 1;
            }
            Err(e) if i + 1 == lines.len() => {
                tracing::warn!(path = %path.display(), error = %e, "skipping torn ledger journal tail");
            }
            Err(e) => {
                return Err(Error::persistence(format!(
                    "corrupt ledger journal {} line {}: {e}",
                    path.display(),
                    i + 1
                )))
            }
        }
    }
    Ok(replayed)
}

#[async_trait]
impl SourceRegistry for JsonFileStore {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(self.state.read().await.sources.values().cloned().collect())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.state.read().await.sources.get(id).cloned())
    }

    async fn upsert_source(&self, source: Source) -> Result<()> {
        self.mutate(|st| {
            st.upsert_source(source);
            ((), true)
        })
        .await
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        self.mutate(|st| {
            let found = st.set_active(id, active);
            (found, found)
        })
        .await
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        self.mutate(|st| {
            let found = st.remove_source(id);
            (found, found)
        })
        .await
    }
}

#[async_trait]
impl WatermarkStore for JsonFileStore {
    async fn get_watermark(&self, source_id: &str) -> Result<Option<ItemId>> {
        Ok(self.state.read().await.watermark(source_id))
    }

    async fn commit_watermark(&self, source_id: &str, new_id: &ItemId) -> Result<bool> {
        self.mutate(|st| {
            let advanced = st.commit_watermark(source_id, new_id);
            (advanced, advanced)
        })
        .await
    }
}

#[async_trait]
impl DedupLedger for JsonFileStore {
    async fn is_processed(&self, item_id: &str, match_key: &str) -> Result<bool> {
        Ok(self.state.read().await.is_processed(item_id, match_key))
    }

    async fn mark_processed(&self, item_id: &str, match_key: &str, source_id: &str) -> Result<()> {
        let mut guard = self.state.write().await;
        if guard.is_processed(item_id, match_key) {
            return Ok(());
        }
        let key = ProcessedKey {
            item_id: item_id.to_string(),
            match_key: match_key.to_string(),
            source_id: source_id.to_string(),
            processed_at: Utc::now(),
        };
        self.append_mark(&key).await?;
        guard.mark_processed(item_id, match_key, source_id, key.processed_at);
        Ok(())
    }

    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.mutate(|st| {
            let n = st.prune_processed(cutoff);
            (n, n > 0)
        })
        .await
    }
}
