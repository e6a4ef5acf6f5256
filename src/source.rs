// src/source.rs
//! Monitored sources and the per-kind behavior table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ids::ItemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Every new item is itself the event.
    ContentStream,
    /// Items are scanned for structured tokens; each token is an event.
    PatternScan,
    /// Same as `PatternScan`, dispatched with priority.
    PriorityStream,
}

/// What gets dispatched for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Content,
    PatternMatch,
    Priority,
    Transaction,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::ContentStream,
        SourceKind::PatternScan,
        SourceKind::PriorityStream,
    ];

    pub fn uses_matcher(self) -> bool {
        match self {
            SourceKind::ContentStream => false,
            SourceKind::PatternScan | SourceKind::PriorityStream => true,
        }
    }

    pub fn event_kind(self) -> EventKind {
        match self {
            SourceKind::ContentStream => EventKind::Content,
            SourceKind::PatternScan => EventKind::PatternMatch,
            SourceKind::PriorityStream => EventKind::Priority,
        }
    }

    /// Rate-limit key used when no provider config overrides it.
    pub fn default_endpoint(self) -> &'static str {
        match self {
            SourceKind::ContentStream => "timeline",
            SourceKind::PatternScan | SourceKind::PriorityStream => "search",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::ContentStream => "content_stream",
            SourceKind::PatternScan => "pattern_scan",
            SourceKind::PriorityStream => "priority_stream",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "content_stream" => Ok(SourceKind::ContentStream),
            "pattern_scan" => Ok(SourceKind::PatternScan),
            "priority_stream" => Ok(SourceKind::PriorityStream),
            other => Err(Error::Config(format!("unknown source kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    /// Provider-side identity (account handle, address, ...).
    pub external_id: String,
    pub kind: SourceKind,
    pub watermark: Option<ItemId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn new(id: impl Into<String>, external_id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            external_id: external_id.into(),
            kind,
            watermark: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_watermark(mut self, watermark: ItemId) -> Self {
        self.watermark = Some(watermark);
        self
    }
}
