// src/ingest/providers/fixture.rs
//! In-memory upstream used by tests and local dry runs.
//!
//! Behaves like a real search endpoint: honors cursors and backfill sizes,
//! returns results newest-first (so callers must sort), and can be told to
//! fail the next calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::ids::ItemId;
use crate::ingest::types::{FeedProvider, FetchCursor, FetchRequest, FetchedItem};

pub struct FixtureProvider {
    name: &'static str,
    endpoint: String,
    items: Mutex<Vec<FetchedItem>>,
    failures: Mutex<VecDeque<Error>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FixtureProvider {
    pub fn new(name: &'static str, endpoint: impl Into<String>) -> Self {
        Self {
            name,
            endpoint: endpoint.into(),
            items: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Publish an item upstream. Panics on a non-decimal id (fixture misuse).
    pub fn push(&self, external_id: &str, id: &str, text: &str) {
        let id = ItemId::parse(id).expect("fixture ids are decimal");
        self.items.lock().push(FetchedItem {
            id,
            source_external_id: external_id.to_string(),
            text: text.to_string(),
            payload: serde_json::json!({ "text": text }),
        });
    }

    /// Make the next fetch fail with `err` (queued, one per call).
    pub fn fail_next(&self, err: Error) {
        self.failures.lock().push_back(err);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl FeedProvider for FixtureProvider {
    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<FetchedItem>> {
        self.requests.lock().push(req.clone());
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let items = self.items.lock();
        let mut out: Vec<FetchedItem> = Vec::new();
        for ext in &req.external_ids {
            let mut mine: Vec<&FetchedItem> = items
                .iter()
                .filter(|it| &it.source_external_id == ext)
                .collect();
            mine.sort_by(|a, b| b.id.cmp(&a.id));
            match &req.cursor {
                FetchCursor::Since(c) => out.extend(mine.into_iter().filter(|it| &it.id > c).cloned()),
                FetchCursor::Backfill { per_source } => {
                    out.extend(mine.into_iter().take(*per_source).cloned())
                }
            }
        }
        // Newest first across the whole batch, like a search API.
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn endpoint_key(&self) -> &str {
        &self.endpoint
    }
}
