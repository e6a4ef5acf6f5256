// src/coordinator/batch.rs
//! Grouping active sources into combined provider fetches.

use std::collections::BTreeMap;

use crate::ingest::{FeedProvider, FetchCursor, FetchRequest};
use crate::source::{Source, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_sources: usize,
    pub max_query_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub kind: SourceKind,
    pub sources: Vec<Source>,
}

impl Batch {
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }

    /// Distinct provider identities, in source order.
    pub fn external_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.sources.len());
        for s in &self.sources {
            if !out.iter().any(|e| e.eq_ignore_ascii_case(&s.external_id)) {
                out.push(s.external_id.clone());
            }
        }
        out
    }

    /// Highest committed watermark in the batch, so one fetch covers every source.
    ///
    /// Sources without a watermark only get backfill when the whole batch is
    /// unset; next to a watermarked source they inherit its cursor.
    pub fn cursor(&self, backfill_size: usize) -> FetchCursor {
        match self.sources.iter().filter_map(|s| s.watermark.as_ref()).max() {
            Some(max) => FetchCursor::Since(max.clone()),
            None => FetchCursor::Backfill {
                per_source: backfill_size.max(1),
            },
        }
    }

    pub fn request(&self, backfill_size: usize) -> FetchRequest {
        FetchRequest {
            external_ids: self.external_ids(),
            cursor: self.cursor(backfill_size),
        }
    }
}

/// Split sources into batches per kind, respecting the source-count cap and the
/// provider's query-length budget. A source whose identity alone exceeds the
/// query budget still gets a batch of its own.
///
/// A batch where no source has a watermark is then split per identity: one
/// busy identity can fill a combined backfill page and starve the others of
/// their first `backfill_size` items. Mixed batches stay combined and ride the
/// max cursor.
pub fn plan_batches(
    sources: Vec<Source>,
    provider_for: impl Fn(SourceKind) -> Option<std::sync::Arc<dyn FeedProvider>>,
    limits: BatchLimits,
) -> Vec<Batch> {
    let mut by_kind: BTreeMap<SourceKind, Vec<Source>> = BTreeMap::new();
    for s in sources {
        by_kind.entry(s.kind).or_default().push(s);
    }

    let max_sources = limits.max_sources.max(1);
    let mut packed = Vec::new();
    for (kind, mut group) in by_kind {
        let Some(provider) = provider_for(kind) else {
            tracing::warn!(
                target: "poll",
                kind = kind.as_str(),
                sources = group.len(),
                "no provider configured for kind; sources skipped"
            );
            continue;
        };
        group.sort_by(|a, b| a.id.cmp(&b.id));

        let mut current: Vec<Source> = Vec::new();
        let mut current_len = 0usize;
        for s in group {
            let cost = provider.query_cost(&s.external_id);
            let full = current.len() >= max_sources
                || (!current.is_empty() && current_len + cost > limits.max_query_len);
            if full {
                packed.push(Batch {
                    kind,
                    sources: std::mem::take(&mut current),
                });
                current_len = 0;
            }
            if cost > limits.max_query_len {
                tracing::warn!(
                    target: "poll",
                    source_id = %s.id,
                    cost,
                    max = limits.max_query_len,
                    "source identity exceeds query budget on its own"
                );
            }
            current_len += cost;
            current.push(s);
        }
        if !current.is_empty() {
            packed.push(Batch {
                kind,
                sources: current,
            });
        }
    }

    let mut batches = Vec::with_capacity(packed.len());
    for batch in packed {
        if batch.sources.iter().any(|s| s.watermark.is_some()) || batch.external_ids().len() < 2 {
            batches.push(batch);
            continue;
        }
        let kind = batch.kind;
        let mut by_identity: BTreeMap<String, Vec<Source>> = BTreeMap::new();
        for s in batch.sources {
            by_identity
                .entry(s.external_id.to_ascii_lowercase())
                .or_default()
                .push(s);
        }
        batches.extend(
            by_identity
                .into_values()
                .map(|sources| Batch { kind, sources }),
        );
    }
    batches
}
