//! The per-shard search engine: a mutable write buffer plus a list of
//! immutable segments. Searches run against an `Arc`-pinned snapshot of
//! the segment list; commits and merges publish a new list under a brief
//! write lock and never block in-flight searches.

pub mod buffer;
pub mod postings;
pub mod search;
pub mod segment;
pub mod snapshot;

pub use search::Bm25Params;
pub use segment::{Segment, SegmentId};
pub use snapshot::SegmentSnapshot;

use crate::aggregations::{collect_partial, AggPartial, Aggregation};
use crate::error::Result;
use crate::expr::ExprRegistry;
use crate::query::QueryAst;
use crate::schema::IndexMeta;
use crate::types::{
    Document, LocalDocId, PartialSearchResult, RankKey, ShardHit, ShardId, SortClause, SortValue,
};
use buffer::IndexBuffer;
use parking_lot::RwLock;
use search::{evaluate, intersect_left, EvalContext, Scored};
use segment::Column;
use std::collections::{BinaryHeap, BTreeMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub bm25: Bm25Params,
    /// A sealed segment whose deleted ratio exceeds this becomes a merge
    /// candidate.
    pub merge_delete_ratio: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bm25: Bm25Params::default(),
            merge_delete_ratio: 0.2,
        }
    }
}

/// One shard-level search call, as produced by the coordinator.
#[derive(Debug, Clone)]
pub struct ShardSearchRequest {
    pub ast: QueryAst,
    /// Conjunctive filters extracted by the coordinator, evaluated natively
    /// here and intersected with the main query.
    pub pushed_filters: Vec<QueryAst>,
    /// Per-shard top-k: the coordinator's `from + size`.
    pub from_plus_size: usize,
    pub sort: Vec<SortClause>,
    pub aggs: BTreeMap<String, Aggregation>,
}

struct EngineInner {
    buffer: IndexBuffer,
    segments: Vec<Arc<Segment>>,
    next_segment_id: SegmentId,
}

pub struct ShardEngine {
    index_name: String,
    shard_id: ShardId,
    dir: PathBuf,
    meta: RwLock<IndexMeta>,
    config: EngineConfig,
    expr: Option<Arc<ExprRegistry>>,
    inner: RwLock<EngineInner>,
}

impl ShardEngine {
    /// Open (or create) the shard at `dir`, loading any segments already on
    /// disk. Opening an existing directory is idempotent.
    pub fn open(
        dir: impl AsRef<Path>,
        index_name: impl Into<String>,
        shard_id: ShardId,
        meta: IndexMeta,
        config: EngineConfig,
        expr: Option<Arc<ExprRegistry>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut segments: Vec<Arc<Segment>> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix("seg_")
                .and_then(|rest| rest.strip_suffix(".bin"))
                .and_then(|id| id.parse::<SegmentId>().ok())
            else {
                continue;
            };
            let bytes = std::fs::read(entry.path())?;
            let segment = Segment::from_persisted(bincode::deserialize(&bytes)?)?;
            let del_path = dir.join(format!("seg_{}.del", id));
            if del_path.exists() {
                let locals: Vec<u32> = bincode::deserialize(&std::fs::read(&del_path)?)?;
                segment.overlay_deletes(&locals);
            }
            segments.push(Arc::new(segment));
        }
        segments.sort_by_key(|s| s.id);
        let next_segment_id = segments.last().map(|s| s.id + 1).unwrap_or(0);

        Ok(Self {
            index_name: index_name.into(),
            shard_id,
            dir,
            meta: RwLock::new(meta),
            config,
            expr,
            inner: RwLock::new(EngineInner {
                buffer: IndexBuffer::new(),
                segments,
                next_segment_id,
            }),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn meta(&self) -> IndexMeta {
        self.meta.read().clone()
    }

    pub fn update_meta(&self, meta: IndexMeta) {
        *self.meta.write() = meta;
    }

    /// Index a document. Any prior copy of the same user doc id, buffered
    /// or committed, is tombstoned first (last-writer-wins at the primary).
    pub fn index_document(&self, doc: &Document) -> Result<()> {
        let meta = self.meta.read().clone();
        let mut inner = self.inner.write();
        self.tombstone_committed(&inner, &doc.id)?;
        inner.buffer.add_document(&doc.id, doc.fields.clone(), &meta)?;
        Ok(())
    }

    /// Delete by user doc id. Returns whether a live copy existed.
    pub fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let in_buffer = inner.buffer.tombstone(doc_id);
        let in_segments = self.tombstone_committed(&inner, doc_id)?;
        Ok(in_buffer || in_segments)
    }

    fn tombstone_committed(&self, inner: &EngineInner, doc_id: &str) -> Result<bool> {
        let mut found = false;
        for segment in &inner.segments {
            if segment.tombstone(doc_id).is_some() {
                found = true;
                // Deletes are durable as soon as they are acked.
                self.persist_deletes(segment)?;
            }
        }
        Ok(found)
    }

    /// Fetch the live latest copy of a document: buffer first, then
    /// segments newest-to-oldest.
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let inner = self.inner.read();
        if let Some(local) = inner.buffer.live_local(doc_id) {
            if let Some(fields) = inner.buffer.stored_fields(local) {
                return Ok(Some(Document::new(doc_id, fields.clone())));
            }
        }
        for segment in inner.segments.iter().rev() {
            if let Some(local) = segment.live_local(doc_id) {
                if let Some(fields) = segment.stored_fields(local) {
                    return Ok(Some(Document::new(doc_id, fields.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Flush the write buffer into a new immutable segment. Returns `None`
    /// when the buffer was empty. Concurrent searches keep their snapshot.
    pub fn commit(&self) -> Result<Option<SegmentId>> {
        let mut inner = self.inner.write();
        if inner.buffer.is_empty() {
            return Ok(None);
        }
        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let segment = inner.buffer.seal(id);
        self.persist_segment(&segment)?;
        debug!(
            index = %self.index_name,
            shard = self.shard_id,
            segment = id,
            docs = segment.doc_count(),
            "committed segment"
        );
        inner.segments.push(Arc::new(segment));
        Ok(Some(id))
    }

    /// Merge the given segments into one successor, dropping tombstones.
    /// Old segments are unlinked from the list and from disk; snapshots
    /// still holding them keep them alive until dropped.
    pub fn merge(&self, segment_ids: &[SegmentId]) -> Result<Option<SegmentId>> {
        if segment_ids.is_empty() {
            return Ok(None);
        }
        let mut inner = self.inner.write();
        let sources: Vec<Arc<Segment>> = inner
            .segments
            .iter()
            .filter(|s| segment_ids.contains(&s.id))
            .cloned()
            .collect();
        if sources.is_empty() {
            return Ok(None);
        }
        let id = inner.next_segment_id;
        inner.next_segment_id += 1;
        let refs: Vec<&Segment> = sources.iter().map(|s| s.as_ref()).collect();
        let merged = Segment::merged(id, &refs);
        self.persist_segment(&merged)?;

        inner.segments.retain(|s| !segment_ids.contains(&s.id));
        inner.segments.push(Arc::new(merged));
        drop(inner);

        for old in &sources {
            let _ = std::fs::remove_file(self.segment_path(old.id));
            let _ = std::fs::remove_file(self.deletes_path(old.id));
        }
        debug!(
            index = %self.index_name,
            shard = self.shard_id,
            merged_into = id,
            sources = ?segment_ids,
            "merged segments"
        );
        Ok(Some(id))
    }

    /// Merge every segment whose deleted ratio exceeds the configured
    /// threshold. Returns the successor id if a merge ran.
    pub fn maybe_merge(&self) -> Result<Option<SegmentId>> {
        let candidates: Vec<SegmentId> = {
            let inner = self.inner.read();
            inner
                .segments
                .iter()
                .filter(|s| s.delete_ratio() > self.config.merge_delete_ratio)
                .map(|s| s.id)
                .collect()
        };
        if candidates.is_empty() {
            return Ok(None);
        }
        self.merge(&candidates)
    }

    /// Live document count and estimated byte size, for heartbeats.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.read();
        let docs = inner.buffer.live_count()
            + inner.segments.iter().map(|s| s.live_count()).sum::<u64>();
        let bytes = inner.segments.iter().map(|s| s.estimated_bytes()).sum();
        (docs, bytes)
    }

    /// Open a point-in-time snapshot of the committed segments.
    pub fn snapshot(&self) -> SegmentSnapshot {
        SegmentSnapshot::new(self.inner.read().segments.clone())
    }

    /// Execute a search against the current snapshot.
    pub fn search(&self, req: &ShardSearchRequest) -> Result<PartialSearchResult> {
        let snapshot = self.snapshot();
        let meta = self.meta.read().clone();
        let ctx = EvalContext {
            snapshot: &snapshot,
            meta: &meta,
            params: self.config.bm25,
            expr: self.expr.as_deref(),
        };

        let mut aggregations: BTreeMap<String, AggPartial> = req
            .aggs
            .iter()
            .map(|(name, agg)| (name.clone(), AggPartial::empty_for(&agg.spec)))
            .collect();

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut total = 0u64;
        let mut max_score: Option<f32> = None;

        for (ord, seg) in snapshot.segments.iter().enumerate() {
            let matched = Self::matched_docs(seg, req, &ctx)?;
            total += matched.len() as u64;

            if !req.aggs.is_empty() {
                let docs: Vec<LocalDocId> = matched.iter().map(|s| s.doc).collect();
                let filter_eval =
                    |ast: &QueryAst, candidates: &[LocalDocId]| -> Result<Vec<LocalDocId>> {
                        let mut matches = evaluate(seg, ast, &ctx)?;
                        matches.retain(|s| seg.is_live(s.doc));
                        let members: roaring::RoaringBitmap =
                            matches.iter().map(|s| s.doc).collect();
                        Ok(candidates
                            .iter()
                            .copied()
                            .filter(|doc| members.contains(*doc))
                            .collect())
                    };
                for (name, agg) in &req.aggs {
                    let partial = collect_partial(agg, seg.as_ref(), &docs, &filter_eval)?;
                    aggregations
                        .get_mut(name)
                        .expect("prepopulated above")
                        .merge(partial)?;
                }
            }

            for m in &matched {
                max_score = Some(max_score.map_or(m.score, |s| s.max(m.score)));
                if req.from_plus_size == 0 {
                    continue;
                }
                let sort_key = Self::sort_values(seg, m.doc, m.score, &req.sort);
                let key = RankKey::new(
                    &req.sort,
                    &sort_key,
                    m.score,
                    self.shard_id,
                    snapshot.global(ord, m.doc),
                );
                heap.push(Candidate { key, sort_key, score: m.score });
                if heap.len() > req.from_plus_size {
                    heap.pop();
                }
            }
        }

        let mut hits = Vec::with_capacity(heap.len());
        for candidate in heap.into_sorted_vec() {
            let global = candidate.key.global;
            // Global ids are only meaningful through this snapshot's
            // translation; never index a segment with them directly.
            let Some((ord, local)) = snapshot.resolve(global) else {
                warn!(global, "search hit resolved to no segment; dropping");
                continue;
            };
            let segment = &snapshot.segments[ord];
            if !segment.is_live(local) {
                continue;
            }
            let Some(doc_id) = segment.doc_id(local) else {
                warn!(global, "search hit has no doc id; dropping");
                continue;
            };
            hits.push(ShardHit {
                doc_id: doc_id.to_string(),
                score: candidate.score,
                shard_id: self.shard_id,
                global_doc: global,
                sort_key: candidate.sort_key,
                source: segment.stored_fields(local).cloned(),
            });
        }

        Ok(PartialSearchResult {
            hits,
            total,
            max_score,
            aggregations,
        })
    }

    /// Count matching live docs without collecting hits or aggregations.
    pub fn count(&self, ast: &QueryAst, pushed_filters: &[QueryAst]) -> Result<u64> {
        let snapshot = self.snapshot();
        let meta = self.meta.read().clone();
        let ctx = EvalContext {
            snapshot: &snapshot,
            meta: &meta,
            params: self.config.bm25,
            expr: self.expr.as_deref(),
        };
        let req = ShardSearchRequest {
            ast: ast.clone(),
            pushed_filters: pushed_filters.to_vec(),
            from_plus_size: 0,
            sort: Vec::new(),
            aggs: BTreeMap::new(),
        };
        let mut total = 0u64;
        for seg in &snapshot.segments {
            total += Self::matched_docs(seg, &req, &ctx)?.len() as u64;
        }
        Ok(total)
    }

    fn matched_docs(
        seg: &Arc<Segment>,
        req: &ShardSearchRequest,
        ctx: &EvalContext,
    ) -> Result<Vec<Scored>> {
        let mut matched = evaluate(seg, &req.ast, ctx)?;
        matched.retain(|s| seg.is_live(s.doc));
        for filter in &req.pushed_filters {
            let filter_matches = evaluate(seg, filter, ctx)?;
            matched = intersect_left(&matched, &filter_matches);
        }
        Ok(matched)
    }

    fn sort_values(
        seg: &Segment,
        local: LocalDocId,
        score: f32,
        sort: &[SortClause],
    ) -> Vec<SortValue> {
        sort.iter()
            .map(|clause| {
                if clause.is_score() {
                    return SortValue::F64(score as f64);
                }
                match seg.column(&clause.field) {
                    Some(Column::I64(v)) => v
                        .get(local as usize)
                        .copied()
                        .flatten()
                        .map_or(SortValue::Null, SortValue::I64),
                    Some(Column::F64(v)) => v
                        .get(local as usize)
                        .copied()
                        .flatten()
                        .map_or(SortValue::Null, SortValue::F64),
                    Some(Column::Keyword(v)) => v
                        .get(local as usize)
                        .cloned()
                        .flatten()
                        .map_or(SortValue::Null, SortValue::Str),
                    Some(Column::Bool(v)) => v
                        .get(local as usize)
                        .copied()
                        .flatten()
                        .map_or(SortValue::Null, |b| SortValue::I64(b as i64)),
                    None => SortValue::Null,
                }
            })
            .collect()
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(format!("seg_{}.bin", id))
    }

    fn deletes_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(format!("seg_{}.del", id))
    }

    fn persist_segment(&self, segment: &Segment) -> Result<()> {
        let bytes = bincode::serialize(&segment.to_persisted())?;
        std::fs::write(self.segment_path(segment.id), bytes)?;
        Ok(())
    }

    fn persist_deletes(&self, segment: &Segment) -> Result<()> {
        let locals: Vec<u32> = segment.deleted_bitmap().iter().collect();
        let bytes = bincode::serialize(&locals)?;
        std::fs::write(self.deletes_path(segment.id), bytes)?;
        Ok(())
    }
}

/// Heap entry for per-shard top-k collection. The heap is a max-heap over
/// "ranks later", so the worst candidate sits on top and `pop` evicts it.
struct Candidate {
    key: RankKey,
    sort_key: Vec<SortValue>,
    score: f32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Candidate {}
