//! Per-segment collection of aggregation partials from matched documents.

use super::partial::{AggPartial, BucketPartial, StatsPartial};
use super::sketch::{CardinalitySketch, QuantileSketch};
use super::types::{Aggregation, AggregationSpec};
use crate::error::Result;
use crate::query::QueryAst;
use crate::types::LocalDocId;
use std::collections::BTreeMap;

/// Doc-value access the collectors need from a segment.
pub trait DocValues {
    /// Numeric value (i64, f64 or date millis) widened to f64.
    fn numeric(&self, field: &str, doc: LocalDocId) -> Option<f64>;
    /// Integer value (i64 or date millis) without widening.
    fn integer(&self, field: &str, doc: LocalDocId) -> Option<i64>;
    /// Bucket label for keyword/bool fields, or a formatted numeric.
    fn label(&self, field: &str, doc: LocalDocId) -> Option<String>;
    /// Whether the document carries any value for the field.
    fn has_value(&self, field: &str, doc: LocalDocId) -> bool;
}

/// Evaluates a filter query against the segment, restricted to the given
/// candidate docs. Supplied by the engine so `filters` buckets reuse the
/// normal query evaluation path.
pub type FilterEval<'a> = &'a dyn Fn(&QueryAst, &[LocalDocId]) -> Result<Vec<LocalDocId>>;

/// Build one aggregation's partial from this segment's matched docs.
pub fn collect_partial(
    agg: &Aggregation,
    values: &dyn DocValues,
    docs: &[LocalDocId],
    filter_eval: FilterEval,
) -> Result<AggPartial> {
    let partial = match &agg.spec {
        AggregationSpec::Terms { field, size } => {
            let mut groups: BTreeMap<String, Vec<LocalDocId>> = BTreeMap::new();
            for &doc in docs {
                if let Some(label) = values.label(field, doc) {
                    groups.entry(label).or_default().push(doc);
                }
            }
            let mut buckets = collect_grouped(agg, values, groups, filter_eval)?;
            trim_terms(&mut buckets, AggregationSpec::shard_size(*size));
            AggPartial::Terms(buckets)
        }
        AggregationSpec::Histogram { field, interval } => {
            let mut groups: BTreeMap<i64, Vec<LocalDocId>> = BTreeMap::new();
            for &doc in docs {
                if let Some(v) = values.numeric(field, doc) {
                    if v.is_nan() {
                        continue;
                    }
                    let idx = (v / interval).floor() as i64;
                    groups.entry(idx).or_default().push(doc);
                }
            }
            AggPartial::Histogram(collect_grouped(agg, values, groups, filter_eval)?)
        }
        AggregationSpec::DateHistogram { field, interval } => {
            let mut groups: BTreeMap<i64, Vec<LocalDocId>> = BTreeMap::new();
            for &doc in docs {
                if let Some(ms) = values.integer(field, doc) {
                    groups
                        .entry(interval.bucket_start(ms))
                        .or_default()
                        .push(doc);
                }
            }
            AggPartial::DateHistogram(collect_grouped(agg, values, groups, filter_eval)?)
        }
        AggregationSpec::Range { field, ranges } => {
            let mut buckets = Vec::with_capacity(ranges.len());
            for bounds in ranges {
                let members: Vec<LocalDocId> = docs
                    .iter()
                    .copied()
                    .filter(|&doc| {
                        values
                            .numeric(field, doc)
                            .map(|v| bounds.contains(v))
                            .unwrap_or(false)
                    })
                    .collect();
                buckets.push(make_bucket(agg, values, &members, filter_eval)?);
            }
            AggPartial::Range(buckets)
        }
        AggregationSpec::Filters { filters } => {
            let mut buckets = BTreeMap::new();
            for (name, query) in filters {
                let members = filter_eval(query, docs)?;
                buckets.insert(name.clone(), make_bucket(agg, values, &members, filter_eval)?);
            }
            AggPartial::Filters(buckets)
        }
        AggregationSpec::Avg { field } | AggregationSpec::Stats { field } => {
            let mut stats = StatsPartial::default();
            for &doc in docs {
                if let Some(v) = values.numeric(field, doc) {
                    stats.observe(v);
                }
            }
            if matches!(agg.spec, AggregationSpec::Avg { .. }) {
                AggPartial::Avg(stats)
            } else {
                AggPartial::Stats(stats)
            }
        }
        AggregationSpec::Min { field } => {
            AggPartial::Min(fold_numeric(values, field, docs, f64::min))
        }
        AggregationSpec::Max { field } => {
            AggPartial::Max(fold_numeric(values, field, docs, f64::max))
        }
        AggregationSpec::Sum { field } => {
            let mut sum = 0.0;
            for &doc in docs {
                if let Some(v) = values.numeric(field, doc) {
                    sum += v;
                }
            }
            AggPartial::Sum(sum)
        }
        AggregationSpec::ValueCount { field } => {
            let count = docs
                .iter()
                .filter(|&&doc| values.has_value(field, doc))
                .count() as u64;
            AggPartial::ValueCount(count)
        }
        AggregationSpec::ExtendedStats { field } => {
            let mut stats = StatsPartial::default();
            let mut sum_of_squares = 0.0;
            for &doc in docs {
                if let Some(v) = values.numeric(field, doc) {
                    stats.observe(v);
                    sum_of_squares += v * v;
                }
            }
            AggPartial::ExtendedStats {
                stats,
                sum_of_squares,
            }
        }
        AggregationSpec::Percentiles { field, .. } => {
            let mut sketch = QuantileSketch::new();
            for &doc in docs {
                if let Some(v) = values.numeric(field, doc) {
                    sketch.add(v);
                }
            }
            AggPartial::Percentiles(sketch)
        }
        AggregationSpec::Cardinality { field } => {
            let mut sketch = CardinalitySketch::new();
            for &doc in docs {
                if let Some(label) = values.label(field, doc) {
                    sketch.add_str(&label);
                }
            }
            AggPartial::Cardinality(sketch)
        }
    };
    Ok(partial)
}

fn fold_numeric(
    values: &dyn DocValues,
    field: &str,
    docs: &[LocalDocId],
    fold: fn(f64, f64) -> f64,
) -> Option<f64> {
    let mut acc: Option<f64> = None;
    for &doc in docs {
        if let Some(v) = values.numeric(field, doc) {
            acc = Some(match acc {
                Some(a) => fold(a, v),
                None => v,
            });
        }
    }
    acc
}

fn collect_grouped<K: Ord>(
    agg: &Aggregation,
    values: &dyn DocValues,
    groups: BTreeMap<K, Vec<LocalDocId>>,
    filter_eval: FilterEval,
) -> Result<BTreeMap<K, BucketPartial>> {
    let mut buckets = BTreeMap::new();
    for (key, members) in groups {
        buckets.insert(key, make_bucket(agg, values, &members, filter_eval)?);
    }
    Ok(buckets)
}

fn make_bucket(
    agg: &Aggregation,
    values: &dyn DocValues,
    members: &[LocalDocId],
    filter_eval: FilterEval,
) -> Result<BucketPartial> {
    let mut subs = BTreeMap::new();
    for (name, sub) in &agg.subs {
        subs.insert(
            name.clone(),
            collect_partial(sub, values, members, filter_eval)?,
        );
    }
    Ok(BucketPartial {
        doc_count: members.len() as u64,
        subs,
    })
}

fn trim_terms(buckets: &mut BTreeMap<String, BucketPartial>, shard_size: usize) {
    if buckets.len() <= shard_size {
        return;
    }
    let mut order: Vec<(String, u64)> = buckets
        .iter()
        .map(|(k, b)| (k.clone(), b.doc_count))
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (key, _) in order.into_iter().skip(shard_size) {
        buckets.remove(&key);
    }
}
