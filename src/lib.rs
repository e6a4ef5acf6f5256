// src/lib.rs
// Public library surface for the service binary and integration tests.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod emit;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod matcher;
pub mod metrics;
pub mod notify;
pub mod ratelimit;
pub mod source;
pub mod store;
pub mod webhook;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::coordinator::{CycleReport, PollCycleCoordinator, TickOutcome};
pub use crate::error::{Error, Result};
pub use crate::ids::ItemId;
pub use crate::notify::{NotificationDispatcher, ProcessedItemEvent};
pub use crate::ratelimit::RateLimitScheduler;
pub use crate::source::{EventKind, Source, SourceKind};
