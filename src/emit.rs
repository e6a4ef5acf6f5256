// src/emit.rs
//! The one place where an event crosses from "seen" to "surfaced".
//!
//! Order is check, dispatch, mark. A crash between dispatch and mark is the
//! only window in which the same pair could be dispatched twice.

use metrics::counter;

use crate::error::Result;
use crate::notify::{NotificationDispatcher, ProcessedItemEvent};
use crate::store::DedupLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Emitted,
    Duplicate,
}

pub async fn emit_once<L, D>(ledger: &L, dispatcher: &D, event: &ProcessedItemEvent) -> Result<EmitOutcome>
where
    L: DedupLedger + ?Sized,
    D: NotificationDispatcher + ?Sized,
{
    if ledger.is_processed(&event.item_id, &event.match_key).await? {
        tracing::trace!(
            item_id = %event.item_id,
            match_key = %event.match_key,
            "already processed"
        );
        return Ok(EmitOutcome::Duplicate);
    }

    dispatcher.dispatch(event).await;
    ledger
        .mark_processed(&event.item_id, &event.match_key, &event.source_id)
        .await?;

    counter!("events_emitted_total", "kind" => format!("{:?}", event.kind).to_lowercase())
        .increment(1);
    tracing::debug!(
        source_id = %event.source_id,
        item_id = %event.item_id,
        match_key = %event.match_key,
        "event emitted"
    );
    Ok(EmitOutcome::Emitted)
}
