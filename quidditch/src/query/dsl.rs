//! Serde types for the JSON search DSL. These mirror the wire shapes the
//! OpenSearch-compatible surface accepts; translation and validation into
//! the typed AST live in [`super::translate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Root search request body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchBody {
    #[serde(default)]
    pub query: Option<DslQuery>,

    #[serde(default)]
    pub from: Option<usize>,

    #[serde(default)]
    pub size: Option<usize>,

    #[serde(default)]
    pub sort: Option<Vec<DslSortClause>>,

    #[serde(default, alias = "aggregations")]
    pub aggs: Option<BTreeMap<String, DslAggregation>>,

    #[serde(default)]
    pub track_total_hits: Option<bool>,

    /// Per-request timeout override, milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DslQuery {
    MatchAll(MatchAllBody),

    Term(BTreeMap<String, TermValue>),

    Match(BTreeMap<String, MatchValue>),

    #[serde(alias = "match_phrase")]
    Phrase(BTreeMap<String, PhraseValue>),

    Range(BTreeMap<String, RangeParams>),

    Prefix(BTreeMap<String, AffixValue>),

    Wildcard(BTreeMap<String, AffixValue>),

    Fuzzy(BTreeMap<String, FuzzyValue>),

    Bool(BoolBody),

    /// Opaque predicate evaluated by a registered expression module.
    UserDefined(UserDefinedBody),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MatchAllBody {}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TermValue {
    Simple(Value),
    Object { value: Value },
}

impl TermValue {
    pub fn value(&self) -> &Value {
        match self {
            TermValue::Simple(v) => v,
            TermValue::Object { value } => value,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MatchValue {
    Simple(String),
    Object { query: String },
}

impl MatchValue {
    pub fn query(&self) -> &str {
        match self {
            MatchValue::Simple(s) => s,
            MatchValue::Object { query } => query,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PhraseValue {
    Simple(String),
    Object {
        query: String,
        #[serde(default)]
        slop: Option<u32>,
    },
}

impl PhraseValue {
    pub fn query(&self) -> &str {
        match self {
            PhraseValue::Simple(s) => s,
            PhraseValue::Object { query, .. } => query,
        }
    }

    pub fn slop(&self) -> u32 {
        match self {
            PhraseValue::Simple(_) => 0,
            PhraseValue::Object { slop, .. } => slop.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RangeParams {
    #[serde(default)]
    pub gte: Option<Value>,
    #[serde(default)]
    pub gt: Option<Value>,
    #[serde(default)]
    pub lte: Option<Value>,
    #[serde(default)]
    pub lt: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AffixValue {
    Simple(String),
    Object { value: String },
}

impl AffixValue {
    pub fn value(&self) -> &str {
        match self {
            AffixValue::Simple(s) => s,
            AffixValue::Object { value } => value,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FuzzyValue {
    Simple(String),
    Object {
        value: String,
        #[serde(default)]
        fuzziness: Option<Value>,
    },
}

impl FuzzyValue {
    pub fn value(&self) -> &str {
        match self {
            FuzzyValue::Simple(s) => s,
            FuzzyValue::Object { value, .. } => value,
        }
    }

    pub fn fuzziness(&self) -> Option<&Value> {
        match self {
            FuzzyValue::Simple(_) => None,
            FuzzyValue::Object { fuzziness, .. } => fuzziness.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BoolBody {
    #[serde(default)]
    pub must: Option<ClauseList>,
    #[serde(default)]
    pub should: Option<ClauseList>,
    #[serde(default)]
    pub must_not: Option<ClauseList>,
    #[serde(default)]
    pub filter: Option<ClauseList>,
    #[serde(default)]
    pub minimum_should_match: Option<u32>,
}

/// A bool clause position accepts either one query or an array of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClauseList {
    One(Box<DslQuery>),
    Many(Vec<DslQuery>),
}

impl ClauseList {
    pub fn into_vec(self) -> Vec<DslQuery> {
        match self {
            ClauseList::One(q) => vec![*q],
            ClauseList::Many(qs) => qs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserDefinedBody {
    pub module: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DslSortClause {
    Field(String),
    Object(BTreeMap<String, DslSortOrder>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DslSortOrder {
    Simple(String),
    Object { order: String },
}

impl DslSortOrder {
    pub fn order(&self) -> &str {
        match self {
            DslSortOrder::Simple(s) => s,
            DslSortOrder::Object { order } => order,
        }
    }
}

/// One aggregation body. Exactly one kind key must be present; `aggs`
/// nests sub-aggregations under bucket kinds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DslAggregation {
    #[serde(default)]
    pub terms: Option<TermsAggBody>,
    #[serde(default)]
    pub histogram: Option<HistogramAggBody>,
    #[serde(default)]
    pub date_histogram: Option<DateHistogramAggBody>,
    #[serde(default)]
    pub range: Option<RangeAggBody>,
    #[serde(default)]
    pub filters: Option<FiltersAggBody>,
    #[serde(default)]
    pub avg: Option<FieldAggBody>,
    #[serde(default)]
    pub min: Option<FieldAggBody>,
    #[serde(default)]
    pub max: Option<FieldAggBody>,
    #[serde(default)]
    pub sum: Option<FieldAggBody>,
    #[serde(default)]
    pub value_count: Option<FieldAggBody>,
    #[serde(default)]
    pub stats: Option<FieldAggBody>,
    #[serde(default)]
    pub extended_stats: Option<FieldAggBody>,
    #[serde(default)]
    pub percentiles: Option<PercentilesAggBody>,
    #[serde(default)]
    pub cardinality: Option<FieldAggBody>,
    #[serde(default, alias = "aggregations")]
    pub aggs: Option<BTreeMap<String, DslAggregation>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldAggBody {
    pub field: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TermsAggBody {
    pub field: String,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistogramAggBody {
    pub field: String,
    pub interval: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateHistogramAggBody {
    pub field: String,
    #[serde(default)]
    pub calendar_interval: Option<String>,
    #[serde(default)]
    pub fixed_interval_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeAggBody {
    pub field: String,
    pub ranges: Vec<RangeAggBound>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RangeAggBound {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub from: Option<f64>,
    #[serde(default)]
    pub to: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FiltersAggBody {
    pub filters: BTreeMap<String, DslQuery>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PercentilesAggBody {
    pub field: String,
    #[serde(default)]
    pub percents: Option<Vec<f64>>,
}
