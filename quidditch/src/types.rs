//! Shared document and result types.

use crate::aggregations::AggPartial;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub type ShardId = u32;
pub type LocalDocId = u32;
pub type GlobalDocId = u32;

/// A user document: string id plus JSON source fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One sort clause; `field == "_score"` sorts on relevance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortClause {
    pub field: String,
    pub order: SortOrder,
}

impl SortClause {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn is_score(&self) -> bool {
        self.field == "_score"
    }
}

/// A materialized sort-key component carried alongside each hit so the
/// coordinator can apply the exact same comparator at merge time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortValue {
    I64(i64),
    F64(f64),
    Str(String),
    /// Missing field value; sorts after every present value.
    Null,
}

impl SortValue {
    /// Total order over sort values. Mixed numeric kinds compare as f64;
    /// `Null` is greater than everything else so missing values land last
    /// under ascending order.
    pub fn compare(&self, other: &SortValue) -> Ordering {
        use SortValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
            (I64(a), I64(b)) => a.cmp(b),
            (F64(a), F64(b)) => a.total_cmp(b),
            (I64(a), F64(b)) => (*a as f64).total_cmp(b),
            (F64(a), I64(b)) => a.total_cmp(&(*b as f64)),
            (Str(a), Str(b)) => a.cmp(b),
            (Str(_), _) => Ordering::Greater,
            (_, Str(_)) => Ordering::Less,
        }
    }
}

/// A scored hit local to one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardHit {
    pub doc_id: String,
    pub score: f32,
    pub shard_id: ShardId,
    pub global_doc: GlobalDocId,
    /// One entry per requested sort clause, in clause order.
    pub sort_key: Vec<SortValue>,
    pub source: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Per-shard output of a search: top `from+size` hits, the exact matched
/// live-doc total and the shard's aggregation partials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSearchResult {
    pub hits: Vec<ShardHit>,
    pub total: u64,
    pub max_score: Option<f32>,
    pub aggregations: BTreeMap<String, AggPartial>,
}

impl PartialSearchResult {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            total: 0,
            max_score: None,
            aggregations: BTreeMap::new(),
        }
    }
}

/// Ranking key for top-k heaps: sort clauses first, then score descending,
/// then `(shard_id, globalDocId)` ascending. `Ordering::Less` means "ranks
/// earlier". The per-shard collector and the coordinator's global merge
/// both order through this one type, which is what makes cross-shard
/// pagination deterministic.
#[derive(Debug, Clone)]
pub struct RankKey {
    parts: Vec<(SortValue, SortOrder)>,
    score: f32,
    pub shard: ShardId,
    pub global: GlobalDocId,
}

impl RankKey {
    pub fn new(
        sort: &[SortClause],
        sort_key: &[SortValue],
        score: f32,
        shard: ShardId,
        global: GlobalDocId,
    ) -> Self {
        let parts = sort
            .iter()
            .zip(sort_key.iter())
            .map(|(clause, value)| (value.clone(), clause.order))
            .collect();
        Self {
            parts,
            score,
            shard,
            global,
        }
    }
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((av, order), (bv, _)) in self.parts.iter().zip(&other.parts) {
            let ord = av.compare(bv);
            let ord = match order {
                SortOrder::Asc => ord,
                // Null stays last regardless of direction.
                SortOrder::Desc => match (av, bv) {
                    (SortValue::Null, _) | (_, SortValue::Null) => ord,
                    _ => ord.reverse(),
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.shard.cmp(&other.shard))
            .then_with(|| self.global.cmp(&other.global))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RankKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RankKey {}

/// Deterministic ranking comparator; see [`RankKey`].
pub fn compare_ranked(
    a: (&[SortValue], f32, ShardId, GlobalDocId),
    b: (&[SortValue], f32, ShardId, GlobalDocId),
    sort: &[SortClause],
) -> Ordering {
    RankKey::new(sort, a.0, a.1, a.2, a.3).cmp(&RankKey::new(sort, b.0, b.1, b.2, b.3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_value_ordering() {
        assert_eq!(
            SortValue::I64(1).compare(&SortValue::F64(2.0)),
            Ordering::Less
        );
        assert_eq!(
            SortValue::Null.compare(&SortValue::I64(i64::MIN)),
            Ordering::Greater
        );
        assert_eq!(
            SortValue::F64(f64::NEG_INFINITY).compare(&SortValue::F64(0.0)),
            Ordering::Less
        );
    }

    #[test]
    fn test_compare_ranked_score_tiebreak() {
        // Equal scores break ties on (shard, doc) ascending.
        let ord = compare_ranked((&[], 1.0, 0, 5), (&[], 1.0, 0, 3), &[]);
        assert_eq!(ord, Ordering::Greater);
        let ord = compare_ranked((&[], 2.0, 1, 5), (&[], 1.0, 0, 3), &[]);
        assert_eq!(ord, Ordering::Less);
    }

    #[test]
    fn test_compare_ranked_field_desc() {
        let sort = vec![SortClause::desc("price")];
        let a = vec![SortValue::F64(10.0)];
        let b = vec![SortValue::F64(20.0)];
        let ord = compare_ranked((&a, 0.0, 0, 0), (&b, 0.0, 0, 1), &sort);
        assert_eq!(ord, Ordering::Greater);
    }

    #[test]
    fn test_nulls_sort_last_both_directions() {
        let a = vec![SortValue::Null];
        let b = vec![SortValue::F64(1.0)];
        for order in [SortOrder::Asc, SortOrder::Desc] {
            let sort = vec![SortClause {
                field: "f".to_string(),
                order,
            }];
            let ord = compare_ranked((&a, 0.0, 0, 0), (&b, 0.0, 0, 1), &sort);
            assert_eq!(ord, Ordering::Greater);
        }
    }
}
