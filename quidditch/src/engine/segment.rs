//! An immutable index segment: term dictionary with positional postings,
//! stored fields addressed by segment-local doc id, per-field doc-value
//! columns and a tombstone bitmap. Everything but the tombstones is frozen
//! once the segment is sealed from the write buffer.

use crate::aggregations::DocValues;
use crate::types::LocalDocId;
use crate::error::Result;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Unique segment identifier, monotonic per shard.
pub type SegmentId = u64;

/// Postings list for one term in one field: ascending local doc ids with
/// parallel in-document positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Postings {
    pub docs: Vec<LocalDocId>,
    pub positions: Vec<Vec<u32>>,
}

impl Postings {
    pub fn push(&mut self, doc: LocalDocId, position: u32) {
        match self.docs.last() {
            Some(&last) if last == doc => {
                self.positions
                    .last_mut()
                    .expect("positions parallel to docs")
                    .push(position);
            }
            _ => {
                self.docs.push(doc);
                self.positions.push(vec![position]);
            }
        }
    }

    pub fn doc_freq(&self) -> u32 {
        self.docs.len() as u32
    }
}

/// One doc-value column. Index is the local doc id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    I64(Vec<Option<i64>>),
    F64(Vec<Option<f64>>),
    Keyword(Vec<Option<String>>),
    Bool(Vec<Option<bool>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::I64(v) => v.len(),
            Column::F64(v) => v.len(),
            Column::Keyword(v) => v.len(),
            Column::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type JsonMap = serde_json::Map<String, serde_json::Value>;

pub struct Segment {
    pub id: SegmentId,
    doc_count: u32,
    /// field -> term -> postings.
    terms: BTreeMap<String, BTreeMap<String, Postings>>,
    /// Stored source by local doc id; `None` for unstored docs.
    stored: Vec<Option<JsonMap>>,
    /// local doc id -> user doc id.
    doc_ids: Vec<String>,
    id_to_local: HashMap<String, LocalDocId>,
    columns: BTreeMap<String, Column>,
    /// Token count per doc for each text field (BM25 length norm).
    field_lengths: BTreeMap<String, Vec<u32>>,
    /// Sum of token counts per text field.
    total_tokens: BTreeMap<String, u64>,
    /// Local doc ids whose documents are deleted. Mutable after sealing;
    /// everything else is immutable.
    deleted: RwLock<RoaringBitmap>,
}

/// Serializable segment state for the on-disk `seg_<id>.bin` file. Stored
/// sources are kept as serialized JSON documents so the binary container
/// stays free of self-describing values.
#[derive(Serialize, Deserialize)]
pub struct PersistedSegment {
    pub id: SegmentId,
    pub doc_count: u32,
    pub terms: BTreeMap<String, BTreeMap<String, Postings>>,
    pub stored: Vec<Option<String>>,
    pub doc_ids: Vec<String>,
    pub columns: BTreeMap<String, Column>,
    pub field_lengths: BTreeMap<String, Vec<u32>>,
    pub total_tokens: BTreeMap<String, u64>,
    pub deleted: Vec<u32>,
}

impl Segment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: SegmentId,
        doc_count: u32,
        terms: BTreeMap<String, BTreeMap<String, Postings>>,
        stored: Vec<Option<JsonMap>>,
        doc_ids: Vec<String>,
        columns: BTreeMap<String, Column>,
        field_lengths: BTreeMap<String, Vec<u32>>,
        total_tokens: BTreeMap<String, u64>,
        deleted: RoaringBitmap,
    ) -> Self {
        let id_to_local = doc_ids
            .iter()
            .enumerate()
            .map(|(local, doc_id)| (doc_id.clone(), local as LocalDocId))
            .collect();
        Self {
            id,
            doc_count,
            terms,
            stored,
            doc_ids,
            id_to_local,
            columns,
            field_lengths,
            total_tokens,
            deleted: RwLock::new(deleted),
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    pub fn live_count(&self) -> u64 {
        self.doc_count as u64 - self.deleted.read().len()
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted.read().len()
    }

    pub fn delete_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.deleted_count() as f64 / self.doc_count as f64
        }
    }

    pub fn is_live(&self, local: LocalDocId) -> bool {
        local < self.doc_count && !self.deleted.read().contains(local)
    }

    /// Local id of the given user doc id, if that copy is still live.
    pub fn live_local(&self, doc_id: &str) -> Option<LocalDocId> {
        let local = *self.id_to_local.get(doc_id)?;
        self.is_live(local).then_some(local)
    }

    /// Tombstone the live copy of a user doc id. Returns the local id that
    /// was marked, if any.
    pub fn tombstone(&self, doc_id: &str) -> Option<LocalDocId> {
        let local = *self.id_to_local.get(doc_id)?;
        let mut deleted = self.deleted.write();
        if deleted.contains(local) {
            None
        } else {
            deleted.insert(local);
            Some(local)
        }
    }

    pub fn doc_id(&self, local: LocalDocId) -> Option<&str> {
        self.doc_ids.get(local as usize).map(|s| s.as_str())
    }

    pub fn stored_fields(&self, local: LocalDocId) -> Option<&JsonMap> {
        self.stored.get(local as usize)?.as_ref()
    }

    pub fn postings(&self, field: &str, term: &str) -> Option<&Postings> {
        self.terms.get(field)?.get(term)
    }

    /// All terms of a field, dictionary order.
    pub fn field_terms(
        &self,
        field: &str,
    ) -> impl Iterator<Item = (&String, &Postings)> {
        self.terms.get(field).into_iter().flat_map(|m| m.iter())
    }

    /// Terms of a field starting with the given prefix, dictionary order.
    pub fn terms_with_prefix<'a>(
        &'a self,
        field: &str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Postings)> {
        self.terms
            .get(field)
            .into_iter()
            .flat_map(move |m| {
                m.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                    .take_while(move |(term, _)| term.starts_with(prefix))
            })
    }

    pub fn column(&self, field: &str) -> Option<&Column> {
        self.columns.get(field)
    }

    pub fn total_tokens(&self, field: &str) -> u64 {
        self.total_tokens.get(field).copied().unwrap_or(0)
    }

    pub fn field_length(&self, field: &str, local: LocalDocId) -> u32 {
        self.field_lengths
            .get(field)
            .and_then(|lengths| lengths.get(local as usize))
            .copied()
            .unwrap_or(0)
    }

    /// Rough in-memory footprint, reported through heartbeats.
    pub fn estimated_bytes(&self) -> u64 {
        let mut bytes = 0u64;
        for field_terms in self.terms.values() {
            for (term, postings) in field_terms {
                bytes += term.len() as u64;
                bytes += postings.docs.len() as u64 * 4;
                bytes += postings.positions.iter().map(|p| p.len() as u64 * 4).sum::<u64>();
            }
        }
        for source in self.stored.iter().flatten() {
            bytes += serde_json::to_vec(source).map(|v| v.len() as u64).unwrap_or(0);
        }
        for column in self.columns.values() {
            bytes += column.len() as u64 * 8;
        }
        bytes
    }

    pub fn deleted_bitmap(&self) -> RoaringBitmap {
        self.deleted.read().clone()
    }

    /// Overlay a persisted tombstone set, used when loading a segment whose
    /// sidecar delete file is newer than the segment file itself.
    pub fn overlay_deletes(&self, locals: &[u32]) {
        let mut deleted = self.deleted.write();
        for &local in locals {
            deleted.insert(local);
        }
    }

    /// Merge segments into one successor, dropping tombstoned docs and
    /// remapping the survivors onto dense local ids. Source segments are
    /// left untouched; the caller retires them once no snapshot holds them.
    pub fn merged(new_id: SegmentId, sources: &[&Segment]) -> Segment {
        // Old (ord, local) -> new local, in segment order, so remapped
        // postings stay ascending.
        let mut remap: Vec<HashMap<LocalDocId, LocalDocId>> = Vec::with_capacity(sources.len());
        let mut doc_ids = Vec::new();
        let mut stored = Vec::new();
        let mut next: LocalDocId = 0;
        for source in sources {
            let mut map = HashMap::new();
            for local in 0..source.doc_count {
                if source.is_live(local) {
                    map.insert(local, next);
                    doc_ids.push(source.doc_ids[local as usize].clone());
                    stored.push(source.stored[local as usize].clone());
                    next += 1;
                }
            }
            remap.push(map);
        }
        let doc_count = next;

        let mut terms: BTreeMap<String, BTreeMap<String, Postings>> = BTreeMap::new();
        for (ord, source) in sources.iter().enumerate() {
            for (field, field_terms) in &source.terms {
                let merged_field = terms.entry(field.clone()).or_default();
                for (term, postings) in field_terms {
                    let merged_postings = merged_field.entry(term.clone()).or_default();
                    for (i, &doc) in postings.docs.iter().enumerate() {
                        if let Some(&new_local) = remap[ord].get(&doc) {
                            for &position in &postings.positions[i] {
                                merged_postings.push(new_local, position);
                            }
                        }
                    }
                }
            }
        }
        // Drop terms whose postings emptied out entirely.
        for field_terms in terms.values_mut() {
            field_terms.retain(|_, postings| !postings.docs.is_empty());
        }
        terms.retain(|_, field_terms| !field_terms.is_empty());

        let mut columns: BTreeMap<String, Column> = BTreeMap::new();
        let field_names: std::collections::BTreeSet<String> = sources
            .iter()
            .flat_map(|s| s.columns.keys().cloned())
            .collect();
        for field in field_names {
            // One mapping governs every segment, so the first occurrence
            // fixes the column kind.
            let mut column = match sources.iter().find_map(|s| s.columns.get(&field)) {
                Some(Column::I64(_)) => Column::I64(Vec::new()),
                Some(Column::F64(_)) => Column::F64(Vec::new()),
                Some(Column::Keyword(_)) => Column::Keyword(Vec::new()),
                Some(Column::Bool(_)) => Column::Bool(Vec::new()),
                None => continue,
            };
            for (ord, source) in sources.iter().enumerate() {
                let slot = source.columns.get(&field);
                for local in 0..source.doc_count {
                    if !remap[ord].contains_key(&local) {
                        continue;
                    }
                    match (&mut column, slot) {
                        (Column::I64(v), Some(Column::I64(src))) => {
                            v.push(src.get(local as usize).copied().flatten())
                        }
                        (Column::F64(v), Some(Column::F64(src))) => {
                            v.push(src.get(local as usize).copied().flatten())
                        }
                        (Column::Keyword(v), Some(Column::Keyword(src))) => {
                            v.push(src.get(local as usize).cloned().flatten())
                        }
                        (Column::Bool(v), Some(Column::Bool(src))) => {
                            v.push(src.get(local as usize).copied().flatten())
                        }
                        (Column::I64(v), _) => v.push(None),
                        (Column::F64(v), _) => v.push(None),
                        (Column::Keyword(v), _) => v.push(None),
                        (Column::Bool(v), _) => v.push(None),
                    }
                }
            }
            columns.insert(field, column);
        }

        let mut field_lengths: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        let mut total_tokens: BTreeMap<String, u64> = BTreeMap::new();
        let length_fields: std::collections::BTreeSet<String> = sources
            .iter()
            .flat_map(|s| s.field_lengths.keys().cloned())
            .collect();
        for field in length_fields {
            let mut lengths = Vec::with_capacity(doc_count as usize);
            let mut total = 0u64;
            for (ord, source) in sources.iter().enumerate() {
                for local in 0..source.doc_count {
                    if remap[ord].contains_key(&local) {
                        let len = source.field_length(&field, local);
                        lengths.push(len);
                        total += len as u64;
                    }
                }
            }
            field_lengths.insert(field.clone(), lengths);
            total_tokens.insert(field, total);
        }

        Segment::from_parts(
            new_id,
            doc_count,
            terms,
            stored,
            doc_ids,
            columns,
            field_lengths,
            total_tokens,
            RoaringBitmap::new(),
        )
    }

    pub fn to_persisted(&self) -> PersistedSegment {
        PersistedSegment {
            id: self.id,
            doc_count: self.doc_count,
            terms: self.terms.clone(),
            stored: self
                .stored
                .iter()
                .map(|source| {
                    source
                        .as_ref()
                        .and_then(|fields| serde_json::to_string(fields).ok())
                })
                .collect(),
            doc_ids: self.doc_ids.clone(),
            columns: self.columns.clone(),
            field_lengths: self.field_lengths.clone(),
            total_tokens: self.total_tokens.clone(),
            deleted: self.deleted.read().iter().collect(),
        }
    }

    pub fn from_persisted(p: PersistedSegment) -> Result<Self> {
        let mut deleted = RoaringBitmap::new();
        for local in p.deleted {
            deleted.insert(local);
        }
        let stored = p
            .stored
            .into_iter()
            .map(|source| {
                source
                    .map(|raw| serde_json::from_str::<JsonMap>(&raw))
                    .transpose()
            })
            .collect::<std::result::Result<Vec<Option<JsonMap>>, _>>()?;
        Ok(Self::from_parts(
            p.id,
            p.doc_count,
            p.terms,
            stored,
            p.doc_ids,
            p.columns,
            p.field_lengths,
            p.total_tokens,
            deleted,
        ))
    }
}

impl DocValues for Segment {
    fn numeric(&self, field: &str, doc: LocalDocId) -> Option<f64> {
        match self.columns.get(field)? {
            Column::I64(v) => v.get(doc as usize)?.map(|x| x as f64),
            Column::F64(v) => *v.get(doc as usize)?,
            _ => None,
        }
    }

    fn integer(&self, field: &str, doc: LocalDocId) -> Option<i64> {
        match self.columns.get(field)? {
            Column::I64(v) => *v.get(doc as usize)?,
            Column::F64(v) => v.get(doc as usize)?.map(|x| x as i64),
            _ => None,
        }
    }

    fn label(&self, field: &str, doc: LocalDocId) -> Option<String> {
        match self.columns.get(field)? {
            Column::Keyword(v) => v.get(doc as usize)?.clone(),
            Column::Bool(v) => v.get(doc as usize)?.map(|b| b.to_string()),
            Column::I64(v) => v.get(doc as usize)?.map(|x| x.to_string()),
            Column::F64(v) => v.get(doc as usize)?.map(|x| x.to_string()),
        }
    }

    fn has_value(&self, field: &str, doc: LocalDocId) -> bool {
        match self.columns.get(field) {
            Some(Column::I64(v)) => v.get(doc as usize).map_or(false, |x| x.is_some()),
            Some(Column::F64(v)) => v.get(doc as usize).map_or(false, |x| x.is_some()),
            Some(Column::Keyword(v)) => v.get(doc as usize).map_or(false, |x| x.is_some()),
            Some(Column::Bool(v)) => v.get(doc as usize).map_or(false, |x| x.is_some()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::buffer::IndexBuffer;
    use crate::schema::{FieldMapping, FieldType, IndexMeta, IndexSettings};
    use serde_json::json;

    fn test_meta() -> IndexMeta {
        IndexMeta::new(
            IndexSettings::default(),
            [
                ("title".to_string(), FieldMapping::text()),
                ("category".to_string(), FieldMapping::keyword()),
                ("price".to_string(), FieldMapping::new(FieldType::F64)),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn build_segment() -> Segment {
        let meta = test_meta();
        let mut buffer = IndexBuffer::new();
        for (id, title, category, price) in [
            ("a", "red laptop", "tech", 999.0),
            ("b", "blue laptop bag", "bags", 49.0),
            ("c", "red shoes", "wear", 89.0),
        ] {
            let source = json!({"title": title, "category": category, "price": price});
            buffer
                .add_document(id, source.as_object().unwrap().clone(), &meta)
                .unwrap();
        }
        buffer.seal(7)
    }

    #[test]
    fn test_postings_positions() {
        let seg = build_segment();
        let postings = seg.postings("title", "laptop").unwrap();
        assert_eq!(postings.docs, vec![0, 1]);
        assert_eq!(postings.positions[0], vec![1]);
        assert_eq!(postings.doc_freq(), 2);
    }

    #[test]
    fn test_tombstone_and_liveness() {
        let seg = build_segment();
        assert_eq!(seg.live_count(), 3);
        let local = seg.tombstone("b").unwrap();
        assert_eq!(local, 1);
        assert!(!seg.is_live(1));
        assert_eq!(seg.live_count(), 2);
        // Double delete is a no-op.
        assert!(seg.tombstone("b").is_none());
        assert!(seg.live_local("b").is_none());
        assert!(seg.live_local("a").is_some());
    }

    #[test]
    fn test_doc_values() {
        let seg = build_segment();
        assert_eq!(seg.numeric("price", 0), Some(999.0));
        assert_eq!(seg.label("category", 2).as_deref(), Some("wear"));
        assert!(seg.has_value("price", 1));
        assert_eq!(seg.numeric("category", 0), None);
    }

    #[test]
    fn test_prefix_scan() {
        let seg = build_segment();
        let terms: Vec<&str> = seg
            .terms_with_prefix("title", "la")
            .map(|(t, _)| t.as_str())
            .collect();
        assert_eq!(terms, vec!["laptop"]);
        let terms: Vec<&str> = seg
            .terms_with_prefix("title", "b")
            .map(|(t, _)| t.as_str())
            .collect();
        assert_eq!(terms, vec!["bag", "blue"]);
    }

    #[test]
    fn test_persistence_roundtrip_keeps_tombstones() {
        let seg = build_segment();
        seg.tombstone("a");
        let bytes = bincode::serialize(&seg.to_persisted()).unwrap();
        let restored =
            Segment::from_persisted(bincode::deserialize(&bytes).unwrap()).unwrap();
        assert_eq!(restored.id, 7);
        assert_eq!(restored.doc_count(), 3);
        assert_eq!(restored.live_count(), 2);
        assert!(restored.live_local("a").is_none());
        assert_eq!(
            restored.stored_fields(1).unwrap()["title"],
            json!("blue laptop bag")
        );
    }

    #[test]
    fn test_merged_drops_tombstones_and_remaps() {
        let meta = test_meta();
        let first = build_segment(); // docs a(0), b(1), c(2)
        first.tombstone("b");

        let mut buffer = IndexBuffer::new();
        buffer
            .add_document(
                "d",
                json!({"title": "red laptop stand", "category": "tech", "price": 25.0})
                    .as_object()
                    .unwrap()
                    .clone(),
                &meta,
            )
            .unwrap();
        let second = buffer.seal(8);

        let merged = Segment::merged(9, &[&first, &second]);
        assert_eq!(merged.doc_count(), 3);
        assert_eq!(merged.live_count(), 3);
        assert!(merged.live_local("b").is_none());
        // Survivors keep segment order: a -> 0, c -> 1, d -> 2.
        assert_eq!(merged.live_local("a"), Some(0));
        assert_eq!(merged.live_local("c"), Some(1));
        assert_eq!(merged.live_local("d"), Some(2));
        // Postings remapped: "red" was in a(0), c(2), d(0 of seg 2).
        let red = merged.postings("title", "red").unwrap();
        assert_eq!(red.docs, vec![0, 1, 2]);
        // Tombstoned doc's terms disappear.
        assert!(merged.postings("title", "bag").is_none());
        // Doc values follow the remap.
        use crate::aggregations::DocValues;
        assert_eq!(merged.numeric("price", 2), Some(25.0));
        // BM25 lengths recomputed over survivors.
        assert_eq!(merged.total_tokens("title"), 2 + 2 + 3);
    }

    #[test]
    fn test_field_lengths_for_bm25() {
        let seg = build_segment();
        assert_eq!(seg.field_length("title", 0), 2);
        assert_eq!(seg.field_length("title", 1), 3);
        assert_eq!(seg.total_tokens("title"), 7);
    }
}
