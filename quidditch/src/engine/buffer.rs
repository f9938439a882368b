//! The mutable in-memory write buffer. Documents accumulate here until a
//! commit seals the buffer into an immutable segment.

use super::segment::{Column, Postings, Segment, SegmentId};
use crate::analysis::Analyzer;
use crate::error::{Error, Result};
use crate::schema::{parse_date, validate_document, FieldType, IndexMeta};
use crate::types::LocalDocId;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};

type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Default)]
pub struct IndexBuffer {
    terms: BTreeMap<String, BTreeMap<String, Postings>>,
    stored: Vec<Option<JsonMap>>,
    doc_ids: Vec<String>,
    id_to_local: HashMap<String, LocalDocId>,
    columns: BTreeMap<String, Column>,
    field_lengths: BTreeMap<String, Vec<u32>>,
    total_tokens: BTreeMap<String, u64>,
    deleted: RoaringBitmap,
}

impl IndexBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_ids.len() as u32
    }

    pub fn live_count(&self) -> u64 {
        self.doc_ids.len() as u64 - self.deleted.len()
    }

    /// Add a document; an earlier buffered copy with the same id is
    /// tombstoned (last-writer-wins).
    pub fn add_document(
        &mut self,
        doc_id: &str,
        source: JsonMap,
        meta: &IndexMeta,
    ) -> Result<LocalDocId> {
        validate_document(meta, &source)?;

        if let Some(&old) = self.id_to_local.get(doc_id) {
            self.deleted.insert(old);
        }

        let local = self.doc_ids.len() as LocalDocId;
        for (field, value) in &source {
            if value.is_null() {
                continue;
            }
            let mapping = meta
                .field(field)
                .ok_or_else(|| Error::schema(field.clone(), "field is not mapped"))?;
            if !mapping.indexed {
                continue;
            }
            match mapping.field_type {
                FieldType::Text => {
                    let text = value.as_str().unwrap_or_default();
                    let analyzer = Analyzer::by_name(mapping.analyzer.as_deref());
                    let tokens = analyzer.analyze(text);
                    let postings = self.terms.entry(field.clone()).or_default();
                    for token in &tokens {
                        postings
                            .entry(token.term.clone())
                            .or_default()
                            .push(local, token.position);
                    }
                    let lengths = self.field_lengths.entry(field.clone()).or_default();
                    pad_to(lengths, local as usize, 0);
                    lengths.push(tokens.len() as u32);
                    *self.total_tokens.entry(field.clone()).or_insert(0) += tokens.len() as u64;
                }
                FieldType::Keyword => {
                    let keyword = value.as_str().unwrap_or_default().to_string();
                    self.terms
                        .entry(field.clone())
                        .or_default()
                        .entry(keyword.clone())
                        .or_default()
                        .push(local, 0);
                    self.push_column(field, local, ColumnValue::Keyword(keyword));
                }
                FieldType::Bool => {
                    let flag = value.as_bool().unwrap_or_default();
                    self.terms
                        .entry(field.clone())
                        .or_default()
                        .entry(flag.to_string())
                        .or_default()
                        .push(local, 0);
                    self.push_column(field, local, ColumnValue::Bool(flag));
                }
                FieldType::I64 => {
                    let v = value
                        .as_i64()
                        .ok_or_else(|| Error::schema(field.clone(), "integer out of i64 range"))?;
                    self.push_column(field, local, ColumnValue::I64(v));
                }
                FieldType::F64 => {
                    let v = value
                        .as_f64()
                        .ok_or_else(|| Error::schema(field.clone(), "not a number"))?;
                    self.push_column(field, local, ColumnValue::F64(v));
                }
                FieldType::Date => {
                    let millis = parse_date(field, value)?;
                    self.push_column(field, local, ColumnValue::I64(millis));
                }
                FieldType::Object => {}
            }
        }

        let stored: JsonMap = source
            .iter()
            .filter(|(name, _)| meta.field(name).map(|m| m.stored).unwrap_or(false))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        self.stored.push(Some(stored));
        self.doc_ids.push(doc_id.to_string());
        self.id_to_local.insert(doc_id.to_string(), local);
        Ok(local)
    }

    fn push_column(&mut self, field: &str, local: LocalDocId, value: ColumnValue) {
        let column = self.columns.entry(field.to_string()).or_insert_with(|| {
            match &value {
                ColumnValue::I64(_) => Column::I64(Vec::new()),
                ColumnValue::F64(_) => Column::F64(Vec::new()),
                ColumnValue::Keyword(_) => Column::Keyword(Vec::new()),
                ColumnValue::Bool(_) => Column::Bool(Vec::new()),
            }
        });
        match (column, value) {
            (Column::I64(v), ColumnValue::I64(x)) => {
                pad_to(v, local as usize, None);
                v.push(Some(x));
            }
            (Column::F64(v), ColumnValue::F64(x)) => {
                pad_to(v, local as usize, None);
                v.push(Some(x));
            }
            (Column::Keyword(v), ColumnValue::Keyword(x)) => {
                pad_to(v, local as usize, None);
                v.push(Some(x));
            }
            (Column::Bool(v), ColumnValue::Bool(x)) => {
                pad_to(v, local as usize, None);
                v.push(Some(x));
            }
            // Mapping validation makes a kind switch unreachable.
            _ => {}
        }
    }

    /// Whether the buffer holds a live copy of the document.
    pub fn live_local(&self, doc_id: &str) -> Option<LocalDocId> {
        let local = *self.id_to_local.get(doc_id)?;
        (!self.deleted.contains(local)).then_some(local)
    }

    pub fn stored_fields(&self, local: LocalDocId) -> Option<&JsonMap> {
        self.stored.get(local as usize)?.as_ref()
    }

    /// Tombstone the buffered copy, if one is live.
    pub fn tombstone(&mut self, doc_id: &str) -> bool {
        match self.id_to_local.get(doc_id) {
            Some(&local) if !self.deleted.contains(local) => {
                self.deleted.insert(local);
                true
            }
            _ => false,
        }
    }

    /// Freeze the buffer into an immutable segment, leaving the buffer
    /// empty.
    pub fn seal(&mut self, id: SegmentId) -> Segment {
        let doc_count = self.doc_ids.len();
        for column in self.columns.values_mut() {
            match column {
                Column::I64(v) => pad_to(v, doc_count, None),
                Column::F64(v) => pad_to(v, doc_count, None),
                Column::Keyword(v) => pad_to(v, doc_count, None),
                Column::Bool(v) => pad_to(v, doc_count, None),
            }
        }
        for lengths in self.field_lengths.values_mut() {
            pad_to(lengths, doc_count, 0);
        }
        let buffer = std::mem::take(self);
        Segment::from_parts(
            id,
            doc_count as u32,
            buffer.terms,
            buffer.stored,
            buffer.doc_ids,
            buffer.columns,
            buffer.field_lengths,
            buffer.total_tokens,
            buffer.deleted,
        )
    }
}

enum ColumnValue {
    I64(i64),
    F64(f64),
    Keyword(String),
    Bool(bool),
}

fn pad_to<T: Clone>(v: &mut Vec<T>, len: usize, fill: T) {
    while v.len() < len {
        v.push(fill.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldMapping, IndexSettings};
    use serde_json::json;

    fn meta() -> IndexMeta {
        IndexMeta::new(
            IndexSettings::default(),
            [
                ("title".to_string(), FieldMapping::text()),
                ("price".to_string(), FieldMapping::new(FieldType::F64)),
                ("secret".to_string(), {
                    let mut m = FieldMapping::keyword();
                    m.stored = false;
                    m
                }),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn obj(v: serde_json::Value) -> JsonMap {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_rewrite_tombstones_old_copy() {
        let meta = meta();
        let mut buffer = IndexBuffer::new();
        buffer
            .add_document("a", obj(json!({"title": "first"})), &meta)
            .unwrap();
        buffer
            .add_document("a", obj(json!({"title": "second"})), &meta)
            .unwrap();
        assert_eq!(buffer.doc_count(), 2);
        assert_eq!(buffer.live_count(), 1);
        let local = buffer.live_local("a").unwrap();
        assert_eq!(local, 1);
        assert_eq!(
            buffer.stored_fields(local).unwrap()["title"],
            json!("second")
        );
    }

    #[test]
    fn test_unstored_field_dropped_from_source() {
        let meta = meta();
        let mut buffer = IndexBuffer::new();
        let local = buffer
            .add_document("a", obj(json!({"title": "x", "secret": "hide"})), &meta)
            .unwrap();
        let stored = buffer.stored_fields(local).unwrap();
        assert!(stored.contains_key("title"));
        assert!(!stored.contains_key("secret"));
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let meta = meta();
        let mut buffer = IndexBuffer::new();
        let err = buffer
            .add_document("a", obj(json!({"price": "free"})), &meta)
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_seal_resets_buffer() {
        use crate::aggregations::DocValues;
        let meta = meta();
        let mut buffer = IndexBuffer::new();
        buffer
            .add_document("a", obj(json!({"title": "x", "price": 1.0})), &meta)
            .unwrap();
        let segment = buffer.seal(3);
        assert!(buffer.is_empty());
        assert_eq!(segment.id, 3);
        assert_eq!(segment.doc_count(), 1);
        assert_eq!(segment.numeric("price", 0), Some(1.0));
    }

    #[test]
    fn test_tombstone_in_buffer() {
        let meta = meta();
        let mut buffer = IndexBuffer::new();
        buffer
            .add_document("a", obj(json!({"title": "x"})), &meta)
            .unwrap();
        assert!(buffer.tombstone("a"));
        assert!(!buffer.tombstone("a"));
        assert!(buffer.live_local("a").is_none());
    }
}
