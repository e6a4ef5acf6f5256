// src/ingest/types.rs
use async_trait::async_trait;

use crate::error::Result;
use crate::ids::ItemId;

/// Lower bound of a combined fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCursor {
    /// Items strictly newer than this id.
    Since(ItemId),
    /// Newest `per_source` items for each requested identity.
    Backfill { per_source: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub external_ids: Vec<String>,
    pub cursor: FetchCursor,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FetchedItem {
    pub id: ItemId,
    /// Which monitored identity produced this item.
    pub source_external_id: String,
    pub text: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait FeedProvider: Send + Sync {
    /// One upstream call. Results may be unsorted and may overlap earlier fetches.
    async fn fetch(&self, req: &FetchRequest) -> Result<Vec<FetchedItem>>;

    fn name(&self) -> &'static str;

    /// Rate-limit key this provider's calls are charged to.
    fn endpoint_key(&self) -> &str;

    /// Query-length cost of one more identity in a combined fetch.
    fn query_cost(&self, external_id: &str) -> usize {
        external_id.len() + " OR ".len()
    }
}
