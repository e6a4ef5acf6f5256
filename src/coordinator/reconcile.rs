// src/coordinator/reconcile.rs
//! Turning one combined fetch back into per-source, ascending work lists.

use crate::ingest::{FetchCursor, FetchedItem};
use crate::matcher::MatcherPlugin;
use crate::source::Source;

#[derive(Debug, Clone)]
pub struct SourceItems {
    pub source: Source,
    /// Strictly ascending, no duplicate ids, all above the source's own watermark.
    pub items: Vec<FetchedItem>,
}

/// Items that matched no source in the batch are counted and dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PartitionStats {
    pub unmatched: usize,
    pub below_watermark: usize,
}

pub fn partition(
    sources: &[Source],
    items: Vec<FetchedItem>,
    cursor: &FetchCursor,
    backfill_size: usize,
) -> (Vec<SourceItems>, PartitionStats) {
    let unmatched = items
        .iter()
        .filter(|it| {
            !sources
                .iter()
                .any(|s| s.external_id.eq_ignore_ascii_case(&it.source_external_id))
        })
        .count();
    let mut stats = PartitionStats {
        unmatched,
        below_watermark: 0,
    };

    let groups: Vec<SourceItems> = sources
        .iter()
        .map(|source| {
            let mut mine: Vec<FetchedItem> = Vec::new();
            for it in items
                .iter()
                .filter(|it| source.external_id.eq_ignore_ascii_case(&it.source_external_id))
            {
                if source.watermark.as_ref().is_some_and(|wm| &it.id <= wm) {
                    stats.below_watermark += 1;
                    continue;
                }
                mine.push(it.clone());
            }
            // Upstream order is not trusted.
            mine.sort_by(|a, b| a.id.cmp(&b.id));
            mine.dedup_by(|a, b| a.id == b.id);

            if let FetchCursor::Backfill { .. } = cursor {
                let keep = backfill_size.max(1);
                if mine.len() > keep {
                    mine.drain(..mine.len() - keep);
                }
            }
            SourceItems {
                source: source.clone(),
                items: mine,
            }
        })
        .collect();

    (groups, stats)
}

/// Dedup keys an item contributes: itself for plain content, otherwise each
/// distinct matcher candidate.
pub fn match_keys(source: &Source, item: &FetchedItem, matcher: &dyn MatcherPlugin) -> Vec<String> {
    if !source.kind.uses_matcher() {
        return vec![item.id.to_string()];
    }
    let mut keys = matcher.detect_patterns(&item.text);
    let mut seen = std::collections::HashSet::new();
    keys.retain(|k| seen.insert(k.clone()));
    keys
}
