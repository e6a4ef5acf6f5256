// src/coordinator/mod.rs
//! Poll cycle orchestration.
//!
//! A cycle walks `Idle -> Batching -> (Fetching -> Reconciling -> Committing)* -> Idle`.
//! A failure anywhere inside a batch aborts that batch only: its watermarks are
//! not committed and the next tick retries it. Nothing is retried inline.
//! Cycles never overlap; a tick that finds one running is skipped.

pub mod batch;
pub mod reconcile;

pub use batch::{plan_batches, Batch, BatchLimits};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::emit::{emit_once, EmitOutcome};
use crate::error::Result;
use crate::ids::{max_id, ItemId};
use crate::ingest::FeedProvider;
use crate::matcher::MatcherPlugin;
use crate::notify::{NotificationDispatcher, ProcessedItemEvent};
use crate::ratelimit::RateLimitScheduler;
use crate::source::SourceKind;
use crate::store::{DedupLedger, SourceRegistry, StateStore, WatermarkStore};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!("poll_cycles_total", "Poll cycles started.");
        metrics::describe_counter!(
            "poll_batches_aborted_total",
            "Batches skipped because fetch, reconcile or commit failed."
        );
        metrics::describe_counter!("events_emitted_total", "Events handed to the dispatcher.");
        metrics::describe_gauge!("poll_last_cycle_ts", "Unix ts when the last poll cycle finished.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Batching,
    Fetching,
    Reconciling,
    Committing,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub backfill_size: usize,
    pub limits: BatchLimits,
    /// Ledger entries older than this are pruned at the start of each cycle.
    pub ledger_retention: Option<chrono::Duration>,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &crate::config::AppConfig) -> Self {
        Self {
            backfill_size: cfg.backfill_size,
            limits: BatchLimits {
                max_sources: cfg.batch_size_cap,
                max_query_len: cfg.max_query_len,
            },
            ledger_retention: cfg.ledger_retention(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            backfill_size: 10,
            limits: BatchLimits {
                max_sources: 25,
                max_query_len: 512,
            },
            ledger_retention: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Committed {
        emitted: usize,
        /// Sources whose watermark moved forward.
        advanced: Vec<String>,
    },
    Aborted {
        error_kind: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub kind: SourceKind,
    pub endpoint: String,
    pub source_ids: Vec<String>,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub active_sources: usize,
    pub batches: Vec<BatchReport>,
    /// Set when the cycle aborted before batching (e.g. the registry was unreadable).
    pub error: Option<String>,
}

impl CycleReport {
    pub fn emitted(&self) -> usize {
        self.batches
            .iter()
            .map(|b| match &b.outcome {
                BatchOutcome::Committed { emitted, .. } => *emitted,
                BatchOutcome::Aborted { .. } => 0,
            })
            .sum()
    }

    pub fn aborted(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b.outcome, BatchOutcome::Aborted { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another cycle was still running.
    Skipped,
    Completed(CycleReport),
}

pub struct PollCycleCoordinator {
    store: Arc<dyn StateStore>,
    scheduler: Arc<RateLimitScheduler>,
    providers: HashMap<SourceKind, Arc<dyn FeedProvider>>,
    matcher: Arc<dyn MatcherPlugin>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    settings: CoordinatorSettings,
    state: Mutex<CycleState>,
    running: AtomicBool,
}

/// Clears the running flag and returns to `Idle` however the cycle ends,
/// including when the cycle future is dropped mid-flight.
struct CycleGuard<'a> {
    coordinator: &'a PollCycleCoordinator,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *self.coordinator.state.lock() = CycleState::Idle;
        self.coordinator.running.store(false, Ordering::Release);
    }
}

impl PollCycleCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        scheduler: Arc<RateLimitScheduler>,
        matcher: Arc<dyn MatcherPlugin>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            scheduler,
            providers: HashMap::new(),
            matcher,
            dispatcher,
            settings,
            state: Mutex::new(CycleState::Idle),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_provider(mut self, kind: SourceKind, provider: Arc<dyn FeedProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn matcher_version(&self) -> &'static str {
        self.matcher.version()
    }

    fn transition(&self, next: CycleState) {
        let mut st = self.state.lock();
        tracing::trace!(target: "poll", from = ?*st, to = ?next, "state transition");
        *st = next;
    }

    /// Run one poll cycle unless one is already in flight.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(target: "poll", "previous cycle still running; tick skipped");
            return TickOutcome::Skipped;
        }
        let _guard = CycleGuard { coordinator: self };
        TickOutcome::Completed(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> CycleReport {
        ensure_metrics_described();
        counter!("poll_cycles_total").increment(1);
        let started_at = Utc::now();
        self.transition(CycleState::Batching);

        let sources = match self.store.active_sources().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(target: "poll", error = %e, "cannot load sources; cycle aborted");
                return CycleReport {
                    started_at,
                    active_sources: 0,
                    batches: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        if let Some(retention) = self.settings.ledger_retention {
            match self.store.prune_processed(started_at - retention).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(target: "poll", pruned = n, "ledger pruned"),
                Err(e) => tracing::warn!(target: "poll", error = %e, "ledger prune failed"),
            }
        }

        let active_sources = sources.len();
        let batches = plan_batches(
            sources,
            |kind| self.providers.get(&kind).cloned(),
            self.settings.limits,
        );

        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            let Some(provider) = self.providers.get(&batch.kind).cloned() else {
                continue;
            };
            let outcome = match self.run_batch(&batch, provider.as_ref()).await {
                Ok((emitted, advanced)) => BatchOutcome::Committed { emitted, advanced },
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(
                            target: "poll",
                            kind = batch.kind.as_str(),
                            provider = provider.name(),
                            endpoint = provider.endpoint_key(),
                            sources = ?batch.source_ids(),
                            error = %e,
                            "batch aborted; retrying next tick"
                        );
                    } else {
                        // Bad upstream data; the next tick will likely fail the same way.
                        tracing::error!(
                            target: "poll",
                            kind = batch.kind.as_str(),
                            provider = provider.name(),
                            endpoint = provider.endpoint_key(),
                            sources = ?batch.source_ids(),
                            error = %e,
                            "batch aborted on unusable upstream data"
                        );
                    }
                    counter!("poll_batches_aborted_total", "reason" => e.kind()).increment(1);
                    BatchOutcome::Aborted {
                        error_kind: e.kind(),
                        reason: e.to_string(),
                    }
                }
            };
            reports.push(BatchReport {
                kind: batch.kind,
                endpoint: provider.endpoint_key().to_string(),
                source_ids: batch.source_ids(),
                outcome,
            });
        }

        let report = CycleReport {
            started_at,
            active_sources,
            batches: reports,
            error: None,
        };
        gauge!("poll_last_cycle_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "poll",
            sources = report.active_sources,
            batches = report.batches.len(),
            aborted = report.aborted(),
            emitted = report.emitted(),
            "poll cycle finished"
        );
        report
    }

    /// Fetch, reconcile and commit one batch. Returns (emitted, advanced source ids).
    async fn run_batch(
        &self,
        batch: &Batch,
        provider: &dyn FeedProvider,
    ) -> Result<(usize, Vec<String>)> {
        self.transition(CycleState::Fetching);
        let req = batch.request(self.settings.backfill_size);
        let items = self
            .scheduler
            .schedule_request(provider.endpoint_key(), || provider.fetch(&req))
            .await?;
        tracing::debug!(
            target: "poll",
            kind = batch.kind.as_str(),
            provider = provider.name(),
            cursor = ?req.cursor,
            fetched = items.len(),
            "batch fetched"
        );

        self.transition(CycleState::Reconciling);
        let (groups, stats) =
            reconcile::partition(&batch.sources, items, &req.cursor, self.settings.backfill_size);
        if stats.unmatched > 0 || stats.below_watermark > 0 {
            tracing::debug!(
                target: "poll",
                unmatched = stats.unmatched,
                below_watermark = stats.below_watermark,
                "fetched items dropped before processing"
            );
        }

        let mut emitted = 0usize;
        let mut pending: Vec<(String, ItemId)> = Vec::new();
        for group in &groups {
            let mut highest: Option<ItemId> = None;
            for item in &group.items {
                for match_key in reconcile::match_keys(&group.source, item, self.matcher.as_ref()) {
                    let event = ProcessedItemEvent {
                        source_id: group.source.id.clone(),
                        item_id: item.id.to_string(),
                        match_key,
                        kind: group.source.kind.event_kind(),
                        payload: serde_json::json!({
                            "external_id": item.source_external_id,
                            "text": item.text,
                            "raw": item.payload,
                        }),
                        detected_at: Utc::now(),
                    };
                    if emit_once(self.store.as_ref(), self.dispatcher.as_ref(), &event).await?
                        == EmitOutcome::Emitted
                    {
                        emitted += 1;
                    }
                }
                highest = Some(max_id(highest.as_ref(), &item.id));
            }
            if let Some(seen) = highest {
                let next = max_id(group.source.watermark.as_ref(), &seen);
                pending.push((group.source.id.clone(), next));
            }
        }

        self.transition(CycleState::Committing);
        let mut advanced = Vec::new();
        for (source_id, wm) in pending {
            if self.store.commit_watermark(&source_id, &wm).await? {
                tracing::debug!(target: "poll", source_id = %source_id, watermark = %wm, "watermark committed");
                advanced.push(source_id);
            }
        }
        Ok((emitted, advanced))
    }
}

/// Drive `tick` on a fixed interval until `shutdown` flips to true.
///
/// Shutdown is only observed between cycles, so an in-flight cycle always
/// finishes (or aborts) on its own terms.
pub fn spawn_poll_loop(
    coordinator: Arc<PollCycleCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let TickOutcome::Skipped = coordinator.tick().await {
                tracing::debug!(target: "poll", "tick skipped");
            }
        }
        tracing::info!(target: "poll", "poll loop stopped");
    })
}

