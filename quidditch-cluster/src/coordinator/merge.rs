//! Global merge of per-shard partial results: hits through the shared
//! ranking comparator (min-heap of `from + size`), aggregations through
//! the partial merge algebra. Both are deterministic given the shard
//! results.

use crate::error::{ClusterError, Result};
use quidditch::aggregations::{render, AggPartial, Aggregation};
use quidditch::types::{PartialSearchResult, RankKey, ShardHit, SortClause};
use std::collections::{BinaryHeap, BTreeMap};

pub struct MergedHits {
    pub hits: Vec<ShardHit>,
    pub total: u64,
    pub max_score: Option<f32>,
}

struct MergeEntry {
    key: RankKey,
    hit: ShardHit,
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MergeEntry {}

/// Merge shard hit lists into the global page `[from, from + size)`.
/// Each shard must have sent its own top `from + size`; the heap keeps
/// that many and the page is cut after the global order is known.
pub fn merge_hits(
    partials: Vec<PartialSearchResult>,
    from: usize,
    size: usize,
    sort: &[SortClause],
) -> MergedHits {
    let mut total = 0u64;
    let mut max_score: Option<f32> = None;
    let mut heap: BinaryHeap<MergeEntry> = BinaryHeap::new();

    for partial in partials {
        total += partial.total;
        if let Some(shard_max) = partial.max_score {
            max_score = Some(max_score.map_or(shard_max, |m| m.max(shard_max)));
        }
        for hit in partial.hits {
            let key = RankKey::new(sort, &hit.sort_key, hit.score, hit.shard_id, hit.global_doc);
            heap.push(MergeEntry { key, hit });
            if heap.len() > from + size {
                heap.pop();
            }
        }
    }

    let hits = heap
        .into_sorted_vec()
        .into_iter()
        .map(|entry| entry.hit)
        .skip(from)
        .take(size)
        .collect();

    MergedHits {
        hits,
        total,
        max_score,
    }
}

/// Merge aggregation partials across shards, shard order first to last.
pub fn merge_aggregations(
    partials: Vec<BTreeMap<String, AggPartial>>,
) -> Result<BTreeMap<String, AggPartial>> {
    let mut merged: BTreeMap<String, AggPartial> = BTreeMap::new();
    for shard_partials in partials {
        for (name, partial) in shard_partials {
            match merged.get_mut(&name) {
                Some(existing) => existing
                    .merge(partial)
                    .map_err(|e| ClusterError::Internal(e.to_string()))?,
                None => {
                    merged.insert(name, partial);
                }
            }
        }
    }
    Ok(merged)
}

/// Render merged partials into the response `aggregations` object.
pub fn render_aggregations(
    specs: &BTreeMap<String, Aggregation>,
    merged: &BTreeMap<String, AggPartial>,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut out = serde_json::Map::new();
    for (name, spec) in specs {
        let partial = match merged.get(name) {
            Some(p) => render(spec, p),
            None => render(spec, &AggPartial::empty_for(&spec.spec)),
        }
        .map_err(|e| ClusterError::Internal(e.to_string()))?;
        out.insert(name.clone(), partial);
    }
    Ok(out)
}
