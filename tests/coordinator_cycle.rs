// tests/coordinator_cycle.rs
//
// End-to-end poll cycles against in-memory state and scripted upstreams.
//
// Covered:
// - unsorted upstream results are emitted ascending, watermark = max seen
// - bounded first-poll backfill, then cursor mode
// - k pattern matches -> k events, each idempotent under refetch
// - mixed watermark batch uses the max cursor and no backfill
// - first-time sources are backfilled one identity at a time
// - failed fetch leaves state byte-identical; next tick recovers
// - persistence failure mid-batch commits no watermark
// - overlapping ticks are skipped

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use feedwatch::config::BudgetConfig;
use feedwatch::coordinator::{BatchOutcome, CoordinatorSettings, CycleReport};
use feedwatch::ingest::providers::FixtureProvider;
use feedwatch::ingest::{FeedProvider, FetchCursor, FetchRequest, FetchedItem};
use feedwatch::matcher::Base58AddressMatcher;
use feedwatch::notify::ChannelDispatcher;
use feedwatch::store::{DedupLedger, MemoryStore, SourceRegistry, StateStore, WatermarkStore};
use feedwatch::{
    Error, ItemId, PollCycleCoordinator, ProcessedItemEvent, RateLimitScheduler, Result, Source,
    SourceKind, TickOutcome,
};

const MINT_A: &str = "7GCihgDB8fe6KNjn2MYtkzZcRjQy3t9GHdC8uHYmW2hr";
const MINT_B: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

fn id(s: &str) -> ItemId {
    ItemId::parse(s).unwrap()
}

fn coordinator(
    store: Arc<dyn StateStore>,
    provider: Arc<dyn FeedProvider>,
    kinds: &[SourceKind],
    backfill_size: usize,
) -> (PollCycleCoordinator, mpsc::Receiver<ProcessedItemEvent>) {
    let (dispatcher, rx) = ChannelDispatcher::channel(1024);
    let settings = CoordinatorSettings {
        backfill_size,
        ..CoordinatorSettings::default()
    };
    let mut c = PollCycleCoordinator::new(
        store,
        Arc::new(RateLimitScheduler::new(BudgetConfig::default())),
        Arc::new(Base58AddressMatcher),
        Arc::new(dispatcher),
        settings,
    );
    for k in kinds {
        c = c.with_provider(*k, provider.clone());
    }
    (c, rx)
}

async fn completed(c: &PollCycleCoordinator) -> CycleReport {
    match c.tick().await {
        TickOutcome::Completed(r) => r,
        TickOutcome::Skipped => panic!("tick unexpectedly skipped"),
    }
}

fn drain(rx: &mut mpsc::Receiver<ProcessedItemEvent>) -> Vec<ProcessedItemEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

/// Returns the same items in the same (scrambled) order on every fetch.
struct ScriptedProvider {
    items: Vec<FetchedItem>,
}

#[async_trait]
impl FeedProvider for ScriptedProvider {
    async fn fetch(&self, _req: &FetchRequest) -> Result<Vec<FetchedItem>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn endpoint_key(&self) -> &str {
        "timeline"
    }
}

fn fetched(ext: &str, item: &str, text: &str) -> FetchedItem {
    FetchedItem {
        id: id(item),
        source_external_id: ext.into(),
        text: text.into(),
        payload: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn unsorted_results_are_emitted_ascending() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream).with_watermark(id("100")))
        .await
        .unwrap();
    let provider = Arc::new(ScriptedProvider {
        items: vec![
            fetched("alice", "103", "c"),
            fetched("alice", "101", "a"),
            fetched("alice", "102", "b"),
        ],
    });
    let (c, mut rx) = coordinator(store.clone(), provider, &[SourceKind::ContentStream], 10);

    let report = completed(&c).await;
    assert_eq!(report.emitted(), 3);
    let order: Vec<String> = drain(&mut rx).into_iter().map(|e| e.item_id).collect();
    assert_eq!(order, vec!["101", "102", "103"]);
    assert_eq!(store.get_watermark("a").await.unwrap(), Some(id("103")));

    // Same upstream answer again: everything is at or below the watermark.
    let again = completed(&c).await;
    assert_eq!(again.emitted(), 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn first_poll_is_bounded_backfill_then_cursor() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    for i in 1..=30 {
        fixture.push("alice", &i.to_string(), "hello");
    }
    let (c, mut rx) = coordinator(store.clone(), fixture.clone(), &[SourceKind::ContentStream], 10);

    let first = completed(&c).await;
    assert_eq!(first.emitted(), 10);
    let ids: Vec<String> = drain(&mut rx).into_iter().map(|e| e.item_id).collect();
    assert_eq!(ids.first().map(String::as_str), Some("21"));
    assert_eq!(ids.last().map(String::as_str), Some("30"));
    assert_eq!(fixture.requests()[0].cursor, FetchCursor::Backfill { per_source: 10 });

    fixture.push("alice", "31", "new");
    let second = completed(&c).await;
    assert_eq!(second.emitted(), 1);
    assert_eq!(fixture.requests()[1].cursor, FetchCursor::Since(id("30")));
    assert_eq!(drain(&mut rx)[0].item_id, "31");
}

#[tokio::test]
async fn short_history_backfills_everything_available() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    for i in 1..=3 {
        fixture.push("alice", &i.to_string(), "hello");
    }
    let (c, _rx) = coordinator(store, fixture, &[SourceKind::ContentStream], 10);
    assert_eq!(completed(&c).await.emitted(), 3);
}

#[tokio::test]
async fn multiple_matches_emit_one_event_each_and_stay_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let scanner = store
        .register_source("scanner", SourceKind::PatternScan)
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "search"));
    fixture.push(
        "scanner",
        "500",
        &format!("new pairs {MINT_A} and {MINT_B}, also {MINT_A} again"),
    );
    let (c, mut rx) = coordinator(store.clone(), fixture, &[SourceKind::PatternScan], 10);

    assert_eq!(completed(&c).await.emitted(), 2);
    let mut keys: Vec<String> = drain(&mut rx).into_iter().map(|e| e.match_key).collect();
    keys.sort();
    let mut expected = vec![MINT_A.to_string(), MINT_B.to_string()];
    expected.sort();
    assert_eq!(keys, expected);

    // Dropping the source loses its watermark; the ledger still remembers.
    assert!(store.remove_source(&scanner.id).await.unwrap());
    store
        .register_source("scanner", SourceKind::PatternScan)
        .await
        .unwrap();
    let refetch = completed(&c).await;
    assert_eq!(refetch.emitted(), 0);
    assert!(drain(&mut rx).is_empty());
    assert!(store.is_processed("500", MINT_A).await.unwrap());
}

#[tokio::test]
async fn mixed_watermarks_use_max_cursor_without_backfill() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream).with_watermark(id("50")))
        .await
        .unwrap();
    store
        .upsert_source(Source::new("b", "bob", SourceKind::ContentStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    for i in [10, 40, 51, 60] {
        fixture.push("alice", &i.to_string(), "a");
        fixture.push("bob", &(i + 1).to_string(), "b");
    }
    let (c, mut rx) = coordinator(store.clone(), fixture.clone(), &[SourceKind::ContentStream], 1);

    let report = completed(&c).await;
    let reqs = fixture.requests();
    assert_eq!(reqs.len(), 1, "both sources share one fetch");
    assert_eq!(reqs[0].cursor, FetchCursor::Since(id("50")));

    // Backfill size 1 would have trimmed bob to one item; cursor mode does not.
    assert_eq!(report.emitted(), 4);
    let events = drain(&mut rx);
    let bob: Vec<&str> = events
        .iter()
        .filter(|e| e.source_id == "b")
        .map(|e| e.item_id.as_str())
        .collect();
    assert_eq!(bob, vec!["52", "61"]);
    assert_eq!(store.get_watermark("a").await.unwrap(), Some(id("60")));
    assert_eq!(store.get_watermark("b").await.unwrap(), Some(id("61")));
}

#[tokio::test]
async fn first_time_sources_are_backfilled_one_identity_at_a_time() {
    let store = Arc::new(MemoryStore::new());
    for (sid, ext) in [("a", "alice"), ("b", "bob")] {
        store
            .upsert_source(Source::new(sid, ext, SourceKind::ContentStream))
            .await
            .unwrap();
    }
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    for i in 1000..1030 {
        fixture.push("alice", &i.to_string(), "busy");
    }
    for i in 1..=3 {
        fixture.push("bob", &i.to_string(), "quiet");
    }
    let (c, mut rx) = coordinator(store.clone(), fixture.clone(), &[SourceKind::ContentStream], 10);

    assert_eq!(completed(&c).await.emitted(), 13);
    let reqs = fixture.requests();
    assert_eq!(reqs.len(), 2);
    assert!(reqs.iter().all(|r| r.external_ids.len() == 1
        && r.cursor == FetchCursor::Backfill { per_source: 10 }));
    let bob = drain(&mut rx).into_iter().filter(|e| e.source_id == "b").count();
    assert_eq!(bob, 3);
    assert_eq!(store.get_watermark("b").await.unwrap(), Some(id("3")));
}

#[tokio::test]
async fn failed_fetch_leaves_state_identical_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream).with_watermark(id("7")))
        .await
        .unwrap();
    store.mark_processed("7", "7", "a").await.unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    fixture.push("alice", "8", "x");
    fixture.fail_next(Error::ProviderRateLimited {
        endpoint: "timeline".into(),
    });
    let (c, mut rx) = coordinator(store.clone(), fixture.clone(), &[SourceKind::ContentStream], 10);

    let before = store.snapshot();
    let report = completed(&c).await;
    assert_eq!(report.aborted(), 1);
    match &report.batches[0].outcome {
        BatchOutcome::Aborted { error_kind, .. } => assert_eq!(*error_kind, "provider_rate_limited"),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(store.snapshot(), before);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(fixture.request_count(), 1, "no inline retry");

    let next = completed(&c).await;
    assert_eq!(next.emitted(), 1);
    assert_eq!(store.get_watermark("a").await.unwrap(), Some(id("8")));
}

/// Delegates to a `MemoryStore` but refuses ledger inserts once its budget runs out.
struct FlakyLedgerStore {
    inner: MemoryStore,
    marks_left: Mutex<Option<usize>>,
}

#[async_trait]
impl SourceRegistry for FlakyLedgerStore {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        self.inner.list_sources().await
    }
    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        self.inner.get_source(id).await
    }
    async fn upsert_source(&self, source: Source) -> Result<()> {
        self.inner.upsert_source(source).await
    }
    async fn set_active(&self, id: &str, active: bool) -> Result<bool> {
        self.inner.set_active(id, active).await
    }
    async fn remove_source(&self, id: &str) -> Result<bool> {
        self.inner.remove_source(id).await
    }
}

#[async_trait]
impl WatermarkStore for FlakyLedgerStore {
    async fn get_watermark(&self, source_id: &str) -> Result<Option<ItemId>> {
        self.inner.get_watermark(source_id).await
    }
    async fn commit_watermark(&self, source_id: &str, new_id: &ItemId) -> Result<bool> {
        self.inner.commit_watermark(source_id, new_id).await
    }
}

#[async_trait]
impl DedupLedger for FlakyLedgerStore {
    async fn is_processed(&self, item_id: &str, match_key: &str) -> Result<bool> {
        self.inner.is_processed(item_id, match_key).await
    }
    async fn mark_processed(&self, item_id: &str, match_key: &str, source_id: &str) -> Result<()> {
        {
            let mut left = self.marks_left.lock();
            if let Some(n) = left.as_mut() {
                if *n == 0 {
                    return Err(Error::Persistence("disk full".into()));
                }
                *n -= 1;
            }
        }
        self.inner.mark_processed(item_id, match_key, source_id).await
    }
    async fn prune_processed(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.prune_processed(cutoff).await
    }
}

#[tokio::test]
async fn persistence_failure_mid_batch_commits_no_watermark() {
    let store = Arc::new(FlakyLedgerStore {
        inner: MemoryStore::new(),
        marks_left: Mutex::new(Some(2)),
    });
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    for i in 1..=5 {
        fixture.push("alice", &i.to_string(), "x");
    }
    let (c, mut rx) = coordinator(store.clone(), fixture, &[SourceKind::ContentStream], 10);

    let report = completed(&c).await;
    assert_eq!(report.aborted(), 1);
    assert_eq!(store.get_watermark("a").await.unwrap(), None);
    // Items 1 and 2 were marked; item 3 was dispatched before its mark failed.
    assert_eq!(drain(&mut rx).len(), 3);

    *store.marks_left.lock() = None;
    let next = completed(&c).await;
    assert_eq!(next.aborted(), 0);
    let ids: Vec<String> = drain(&mut rx).into_iter().map(|e| e.item_id).collect();
    assert_eq!(ids, vec!["3", "4", "5"]);
    assert_eq!(store.get_watermark("a").await.unwrap(), Some(id("5")));
}

#[tokio::test]
async fn priority_sources_emit_priority_events() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("p", "vip", SourceKind::PriorityStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "search"));
    fixture.push("vip", "9", &format!("launching {MINT_B}"));
    let (c, mut rx) = coordinator(store, fixture, &[SourceKind::PriorityStream], 10);

    assert_eq!(completed(&c).await.emitted(), 1);
    let ev = drain(&mut rx).remove(0);
    assert!(ev.is_priority());
    assert_eq!(ev.match_key, MINT_B);
}

#[tokio::test]
async fn sources_sharing_an_identity_emit_once() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a1", "Alice", SourceKind::ContentStream))
        .await
        .unwrap();
    store
        .upsert_source(Source::new("a2", "alice", SourceKind::ContentStream))
        .await
        .unwrap();
    let fixture = Arc::new(FixtureProvider::new("fixture", "timeline"));
    fixture.push("Alice", "1", "hi");
    let (c, mut rx) = coordinator(store.clone(), fixture.clone(), &[SourceKind::ContentStream], 10);

    assert_eq!(completed(&c).await.emitted(), 1);
    assert_eq!(fixture.requests()[0].external_ids, vec!["Alice".to_string()]);
    assert_eq!(drain(&mut rx).len(), 1);
    // Both sources still advance past the shared item.
    assert_eq!(store.get_watermark("a1").await.unwrap(), Some(id("1")));
    assert_eq!(store.get_watermark("a2").await.unwrap(), Some(id("1")));
}

/// Blocks every fetch until released.
struct GatedProvider {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl FeedProvider for GatedProvider {
    async fn fetch(&self, _req: &FetchRequest) -> Result<Vec<FetchedItem>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "gated"
    }

    fn endpoint_key(&self) -> &str {
        "timeline"
    }
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_source(Source::new("a", "alice", SourceKind::ContentStream))
        .await
        .unwrap();
    let gate = Arc::new(GatedProvider {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (c, _rx) = coordinator(store, gate.clone(), &[SourceKind::ContentStream], 10);
    let c = Arc::new(c);

    let first = tokio::spawn({
        let c = c.clone();
        async move { c.tick().await }
    });
    gate.entered.notified().await;
    assert!(c.is_running());
    assert_eq!(c.tick().await, TickOutcome::Skipped);

    gate.release.notify_one();
    assert!(matches!(first.await.unwrap(), TickOutcome::Completed(_)));
    assert!(!c.is_running());

    // Pre-release so the next fetch passes straight through.
    gate.release.notify_one();
    assert!(matches!(c.tick().await, TickOutcome::Completed(_)));
}
