// src/notify/mod.rs
//! Outbound side of the pipeline. Dispatchers are best-effort sinks: they log
//! their own failures and never report them back, so the core can treat a
//! `dispatch` call as the emission point.

pub mod discord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::source::EventKind;

pub use discord::DiscordDispatcher;

/// A uniquely emitted (item, match) event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedItemEvent {
    pub source_id: String,
    pub item_id: String,
    /// Equals `item_id` for plain content; otherwise the matched token.
    pub match_key: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

impl ProcessedItemEvent {
    pub fn is_priority(&self) -> bool {
        self.kind == EventKind::Priority
    }
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, event: &ProcessedItemEvent);
    fn name(&self) -> &'static str;
}

/// Writes every event to the log. The default sink when nothing else is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, event: &ProcessedItemEvent) {
        tracing::info!(
            target: "notify",
            source_id = %event.source_id,
            item_id = %event.item_id,
            match_key = %event.match_key,
            kind = ?event.kind,
            "event"
        );
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Hands events to an in-process consumer through a bounded queue.
/// A full queue drops the event with a warning instead of stalling the cycle.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<ProcessedItemEvent>,
}

impl ChannelDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProcessedItemEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationDispatcher for ChannelDispatcher {
    async fn dispatch(&self, event: &ProcessedItemEvent) {
        if let Err(e) = self.tx.try_send(event.clone()) {
            tracing::warn!(
                target: "notify",
                item_id = %event.item_id,
                error = %e,
                "channel dispatcher dropped event"
            );
            counter!("notify_dropped_total", "sink" => "channel").increment(1);
        }
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Fan-out to several sinks, in registration order.
#[derive(Clone, Default)]
pub struct DispatcherMux {
    sinks: Vec<Arc<dyn NotificationDispatcher>>,
}

impl DispatcherMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationDispatcher>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Log sink always; Discord when `DISCORD_WEBHOOK_URL` is set.
    pub fn from_env() -> Self {
        let mut mux = Self::new().with(Arc::new(LogDispatcher));
        if let Ok(url) = std::env::var("DISCORD_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                mux = mux.with(Arc::new(DiscordDispatcher::new(url)));
            }
        }
        mux
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl NotificationDispatcher for DispatcherMux {
    async fn dispatch(&self, event: &ProcessedItemEvent) {
        for sink in &self.sinks {
            tracing::trace!(target: "notify", sink = sink.name(), item_id = %event.item_id, "dispatch");
            sink.dispatch(event).await;
        }
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}
