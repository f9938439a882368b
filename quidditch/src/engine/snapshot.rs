//! Point-in-time view of a shard's segment list. A snapshot pins its
//! segments via `Arc`, so commits and merges publishing a new list never
//! disturb searches already in flight; a retired segment is freed only
//! when the last snapshot holding it drops.

use super::segment::Segment;
use crate::types::{GlobalDocId, LocalDocId};
use std::sync::Arc;

pub struct SegmentSnapshot {
    pub segments: Vec<Arc<Segment>>,
    /// `doc_bases[ord]` is the global id of segment `ord`'s local doc 0.
    pub doc_bases: Vec<GlobalDocId>,
}

impl SegmentSnapshot {
    pub fn new(segments: Vec<Arc<Segment>>) -> Self {
        let mut doc_bases = Vec::with_capacity(segments.len());
        let mut base: GlobalDocId = 0;
        for segment in &segments {
            doc_bases.push(base);
            base += segment.doc_count();
        }
        Self {
            segments,
            doc_bases,
        }
    }

    pub fn total_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count() as u64).sum()
    }

    pub fn global(&self, ord: usize, local: LocalDocId) -> GlobalDocId {
        self.doc_bases[ord] + local
    }

    /// Translate a global doc id back to `(segment_ord, localDocId)`.
    /// Stored-field access must go through this; indexing segment 0 with a
    /// global id is the classic corruption bug this API shape prevents.
    pub fn resolve(&self, global: GlobalDocId) -> Option<(usize, LocalDocId)> {
        if self.segments.is_empty() {
            return None;
        }
        let ord = self.doc_bases.partition_point(|&base| base <= global) - 1;
        let local = global - self.doc_bases[ord];
        (local < self.segments[ord].doc_count()).then_some((ord, local))
    }
}
