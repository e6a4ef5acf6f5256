// src/webhook.rs
//! Push-delivered provider events (e.g. enhanced transaction webhooks).
//!
//! No watermark is involved: providers redeliver freely, so the transaction
//! signature is used directly as the dedup key. Each event in a delivery stands
//! alone; a malformed or failing event never affects its siblings.

use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::emit::{emit_once, EmitOutcome};
use crate::error::{Error, Result};
use crate::notify::{NotificationDispatcher, ProcessedItemEvent};
use crate::source::EventKind;
use crate::store::StateStore;

/// Source id used when an event names no account.
pub const FALLBACK_SOURCE_ID: &str = "webhook";

static SIGNATURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{64,88}$").expect("signature regex"));

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!(
            "webhook_events_dropped_total",
            "Webhook events dropped as malformed or failed."
        );
        metrics::describe_counter!(
            "webhook_duplicates_total",
            "Webhook events already processed (redeliveries)."
        );
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub signature: String,
    pub account: Option<String>,
    pub tx_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub raw: Value,
}

impl WebhookEvent {
    pub fn parse(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::MalformedPayload("event is not an object".into()))?;
        let signature = obj
            .get("signature")
            .and_then(Value::as_str)
            .map(str::trim)
            .ok_or_else(|| Error::MalformedPayload("missing signature".into()))?;
        if !SIGNATURE.is_match(signature) {
            return Err(Error::MalformedPayload(format!(
                "signature is not base58 of plausible length: {signature}"
            )));
        }
        let account = ["feePayer", "account"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let tx_type = obj
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        Ok(Self {
            signature: signature.to_string(),
            account,
            tx_type,
            timestamp,
            raw: raw.clone(),
        })
    }

    fn into_event(self) -> ProcessedItemEvent {
        ProcessedItemEvent {
            source_id: self
                .account
                .clone()
                .unwrap_or_else(|| FALLBACK_SOURCE_ID.to_string()),
            item_id: self.signature.clone(),
            match_key: self.signature,
            kind: EventKind::Transaction,
            payload: serde_json::json!({
                "type": self.tx_type,
                "timestamp": self.timestamp,
                "raw": self.raw,
            }),
            detected_at: Utc::now(),
        }
    }
}

/// Split a delivery into its events. Accepts a bare array or `{"events": [...]}`.
/// Only a delivery whose envelope is unusable fails as a whole.
pub fn split_delivery(body: &Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(v) => Ok(v.clone()),
        Value::Object(m) => match m.get("events") {
            Some(Value::Array(v)) => Ok(v.clone()),
            Some(_) => Err(Error::MalformedPayload("'events' is not an array".into())),
            // A single bare event.
            None if m.contains_key("signature") => Ok(vec![body.clone()]),
            None => Err(Error::MalformedPayload("no events in delivery".into())),
        },
        _ => Err(Error::MalformedPayload("delivery is not JSON object/array".into())),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub received: usize,
    pub emitted: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct WebhookIngest {
    store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    /// Signatures currently being handled by some delivery.
    in_flight: Mutex<HashSet<String>>,
}

/// Releases an in-flight claim when the event is done, however it ends.
struct Claim<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

impl WebhookIngest {
    pub fn new(store: Arc<dyn StateStore>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, key: &str) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock();
        if !set.insert(key.to_string()) {
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            key: key.to_string(),
        })
    }

    /// Process one delivery. Never fails because of a single bad event.
    pub async fn ingest(&self, body: &Value) -> Result<DeliveryReport> {
        ensure_metrics_described();
        let raw_events = split_delivery(body)?;
        let mut report = DeliveryReport {
            received: raw_events.len(),
            ..DeliveryReport::default()
        };

        for raw in &raw_events {
            let ev = match WebhookEvent::parse(raw) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::warn!(target: "webhook", reason = %e, "dropping malformed event");
                    counter!("webhook_events_dropped_total", "reason" => "malformed").increment(1);
                    report.dropped += 1;
                    continue;
                }
            };

            let Some(_claim) = self.claim(&ev.signature) else {
                tracing::debug!(target: "webhook", signature = %ev.signature, "concurrent redelivery");
                counter!("webhook_duplicates_total").increment(1);
                report.duplicates += 1;
                continue;
            };

            let signature = ev.signature.clone();
            let event = ev.into_event();
            match emit_once(self.store.as_ref(), self.dispatcher.as_ref(), &event).await {
                Ok(EmitOutcome::Emitted) => report.emitted += 1,
                Ok(EmitOutcome::Duplicate) => {
                    counter!("webhook_duplicates_total").increment(1);
                    report.duplicates += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "webhook",
                        signature = %signature,
                        error = %e,
                        "event failed; provider redelivery will retry"
                    );
                    counter!("webhook_events_dropped_total", "reason" => e.kind()).increment(1);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            target: "webhook",
            received = report.received,
            emitted = report.emitted,
            duplicates = report.duplicates,
            dropped = report.dropped,
            failed = report.failed,
            "delivery processed"
        );
        Ok(report)
    }
}
