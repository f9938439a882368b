//! Per-shard aggregation partials and their merge rules. Every kind merges
//! from components that keep the global result exact where the algebra
//! allows it: `avg` merges `(sum, count)`, `extended_stats` re-derives
//! variance from merged moments, the approximate kinds merge sketch state.

use super::sketch::{CardinalitySketch, QuantileSketch};
use super::types::{Aggregation, AggregationSpec};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// One bucket of a bucket aggregation: count plus recursively-merged
/// sub-aggregation partials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketPartial {
    pub doc_count: u64,
    #[serde(default)]
    pub subs: BTreeMap<String, AggPartial>,
}

impl BucketPartial {
    pub fn merge(&mut self, other: BucketPartial) -> Result<()> {
        self.doc_count += other.doc_count;
        for (name, partial) in other.subs {
            match self.subs.get_mut(&name) {
                Some(existing) => existing.merge(partial)?,
                None => {
                    self.subs.insert(name, partial);
                }
            }
        }
        Ok(())
    }
}

/// Running stats components; the basis for `stats`, `extended_stats` and
/// the exact `avg` merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPartial {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for StatsPartial {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl StatsPartial {
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &StatsPartial) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Per-shard partial state, one variant per aggregation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggPartial {
    /// term -> bucket; trimmed to the shard size, merged by summing counts.
    Terms(BTreeMap<String, BucketPartial>),
    /// bucket ordinal (floor(value / interval)) -> bucket.
    Histogram(BTreeMap<i64, BucketPartial>),
    /// bucket start millis -> bucket.
    DateHistogram(BTreeMap<i64, BucketPartial>),
    /// Ordinal buckets; bounds are identical on every shard.
    Range(Vec<BucketPartial>),
    /// filter name -> bucket.
    Filters(BTreeMap<String, BucketPartial>),
    Avg(StatsPartial),
    Min(Option<f64>),
    Max(Option<f64>),
    Sum(f64),
    ValueCount(u64),
    Stats(StatsPartial),
    ExtendedStats {
        stats: StatsPartial,
        sum_of_squares: f64,
    },
    Percentiles(QuantileSketch),
    Cardinality(CardinalitySketch),
}

fn merge_bucket_map(
    into: &mut BTreeMap<String, BucketPartial>,
    from: BTreeMap<String, BucketPartial>,
) -> Result<()> {
    for (key, bucket) in from {
        match into.get_mut(&key) {
            Some(existing) => existing.merge(bucket)?,
            None => {
                into.insert(key, bucket);
            }
        }
    }
    Ok(())
}

fn merge_keyed_map(
    into: &mut BTreeMap<i64, BucketPartial>,
    from: BTreeMap<i64, BucketPartial>,
) -> Result<()> {
    for (key, bucket) in from {
        match into.get_mut(&key) {
            Some(existing) => existing.merge(bucket)?,
            None => {
                into.insert(key, bucket);
            }
        }
    }
    Ok(())
}

impl AggPartial {
    /// Merge another shard's partial into this one. Merging is commutative
    /// and associative for every exact kind.
    pub fn merge(&mut self, other: AggPartial) -> Result<()> {
        use AggPartial::*;
        match (self, other) {
            (Terms(a), Terms(b)) => merge_bucket_map(a, b),
            (Histogram(a), Histogram(b)) => merge_keyed_map(a, b),
            (DateHistogram(a), DateHistogram(b)) => merge_keyed_map(a, b),
            (Range(a), Range(b)) => {
                if a.len() != b.len() {
                    return Err(Error::Internal(
                        "range aggregation partials disagree on bucket count".to_string(),
                    ));
                }
                for (x, y) in a.iter_mut().zip(b) {
                    x.merge(y)?;
                }
                Ok(())
            }
            (Filters(a), Filters(b)) => merge_bucket_map(a, b),
            (Avg(a), Avg(b)) => {
                a.merge(&b);
                Ok(())
            }
            (Min(a), Min(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.min(y)),
                    (x, y) => x.or(y),
                };
                Ok(())
            }
            (Max(a), Max(b)) => {
                *a = match (*a, b) {
                    (Some(x), Some(y)) => Some(x.max(y)),
                    (x, y) => x.or(y),
                };
                Ok(())
            }
            (Sum(a), Sum(b)) => {
                *a += b;
                Ok(())
            }
            (ValueCount(a), ValueCount(b)) => {
                *a += b;
                Ok(())
            }
            (Stats(a), Stats(b)) => {
                a.merge(&b);
                Ok(())
            }
            (
                ExtendedStats {
                    stats: a,
                    sum_of_squares: asq,
                },
                ExtendedStats {
                    stats: b,
                    sum_of_squares: bsq,
                },
            ) => {
                a.merge(&b);
                *asq += bsq;
                Ok(())
            }
            (Percentiles(a), Percentiles(b)) => {
                a.merge(&b);
                Ok(())
            }
            (Cardinality(a), Cardinality(b)) => {
                a.merge(&b);
                Ok(())
            }
            _ => Err(Error::Internal(
                "mismatched aggregation partial kinds".to_string(),
            )),
        }
    }

    /// Empty partial for a spec, so shards with no matches still contribute
    /// well-formed zero state.
    pub fn empty_for(spec: &AggregationSpec) -> AggPartial {
        match spec {
            AggregationSpec::Terms { .. } => AggPartial::Terms(BTreeMap::new()),
            AggregationSpec::Histogram { .. } => AggPartial::Histogram(BTreeMap::new()),
            AggregationSpec::DateHistogram { .. } => AggPartial::DateHistogram(BTreeMap::new()),
            AggregationSpec::Range { ranges, .. } => {
                AggPartial::Range(vec![BucketPartial::default(); ranges.len()])
            }
            AggregationSpec::Filters { filters } => AggPartial::Filters(
                filters
                    .keys()
                    .map(|k| (k.clone(), BucketPartial::default()))
                    .collect(),
            ),
            AggregationSpec::Avg { .. } => AggPartial::Avg(StatsPartial::default()),
            AggregationSpec::Min { .. } => AggPartial::Min(None),
            AggregationSpec::Max { .. } => AggPartial::Max(None),
            AggregationSpec::Sum { .. } => AggPartial::Sum(0.0),
            AggregationSpec::ValueCount { .. } => AggPartial::ValueCount(0),
            AggregationSpec::Stats { .. } => AggPartial::Stats(StatsPartial::default()),
            AggregationSpec::ExtendedStats { .. } => AggPartial::ExtendedStats {
                stats: StatsPartial::default(),
                sum_of_squares: 0.0,
            },
            AggregationSpec::Percentiles { .. } => AggPartial::Percentiles(QuantileSketch::new()),
            AggregationSpec::Cardinality { .. } => {
                AggPartial::Cardinality(CardinalitySketch::new())
            }
        }
    }
}

/// Render a merged partial into response JSON, ES-shaped.
pub fn render(agg: &Aggregation, partial: &AggPartial) -> Result<Value> {
    let value = match (&agg.spec, partial) {
        (AggregationSpec::Terms { size, .. }, AggPartial::Terms(map)) => {
            let mut entries: Vec<(&String, &BucketPartial)> = map.iter().collect();
            entries.sort_by(|a, b| b.1.doc_count.cmp(&a.1.doc_count).then_with(|| a.0.cmp(b.0)));
            entries.truncate(*size);
            let buckets = entries
                .into_iter()
                .map(|(key, bucket)| render_bucket(json!(key), bucket, agg))
                .collect::<Result<Vec<_>>>()?;
            json!({ "buckets": buckets })
        }
        (AggregationSpec::Histogram { interval, .. }, AggPartial::Histogram(map)) => {
            let buckets = map
                .iter()
                .map(|(idx, bucket)| render_bucket(json!(*idx as f64 * interval), bucket, agg))
                .collect::<Result<Vec<_>>>()?;
            json!({ "buckets": buckets })
        }
        (AggregationSpec::DateHistogram { .. }, AggPartial::DateHistogram(map)) => {
            let buckets = map
                .iter()
                .map(|(start, bucket)| render_bucket(json!(start), bucket, agg))
                .collect::<Result<Vec<_>>>()?;
            json!({ "buckets": buckets })
        }
        (AggregationSpec::Range { ranges, .. }, AggPartial::Range(buckets)) => {
            let rendered = ranges
                .iter()
                .zip(buckets)
                .map(|(bounds, bucket)| {
                    let mut value = render_bucket(json!(bounds.label()), bucket, agg)?;
                    if let Value::Object(obj) = &mut value {
                        if let Some(from) = bounds.from {
                            obj.insert("from".to_string(), json!(from));
                        }
                        if let Some(to) = bounds.to {
                            obj.insert("to".to_string(), json!(to));
                        }
                    }
                    Ok(value)
                })
                .collect::<Result<Vec<_>>>()?;
            json!({ "buckets": rendered })
        }
        (AggregationSpec::Filters { .. }, AggPartial::Filters(map)) => {
            let mut buckets = serde_json::Map::new();
            for (name, bucket) in map {
                buckets.insert(name.clone(), render_bucket(json!(name), bucket, agg)?);
            }
            json!({ "buckets": buckets })
        }
        (AggregationSpec::Avg { .. }, AggPartial::Avg(stats)) => json!({ "value": stats.avg() }),
        (AggregationSpec::Min { .. }, AggPartial::Min(v)) => json!({ "value": v }),
        (AggregationSpec::Max { .. }, AggPartial::Max(v)) => json!({ "value": v }),
        (AggregationSpec::Sum { .. }, AggPartial::Sum(v)) => json!({ "value": v }),
        (AggregationSpec::ValueCount { .. }, AggPartial::ValueCount(v)) => json!({ "value": v }),
        (AggregationSpec::Stats { .. }, AggPartial::Stats(stats)) => render_stats(stats),
        (
            AggregationSpec::ExtendedStats { .. },
            AggPartial::ExtendedStats {
                stats,
                sum_of_squares,
            },
        ) => {
            let mut value = render_stats(stats);
            if let Value::Object(obj) = &mut value {
                obj.insert("sum_of_squares".to_string(), json!(sum_of_squares));
                let (variance, std_dev) = if stats.count > 0 {
                    let n = stats.count as f64;
                    let mean = stats.sum / n;
                    let variance = (sum_of_squares / n - mean * mean).max(0.0);
                    (Some(variance), Some(variance.sqrt()))
                } else {
                    (None, None)
                };
                obj.insert("variance".to_string(), json!(variance));
                obj.insert("std_deviation".to_string(), json!(std_dev));
            }
            value
        }
        (AggregationSpec::Percentiles { percents, .. }, AggPartial::Percentiles(sketch)) => {
            let mut values = serde_json::Map::new();
            for p in percents {
                values.insert(format!("{:.1}", p), json!(sketch.quantile(p / 100.0)));
            }
            json!({ "values": values })
        }
        (AggregationSpec::Cardinality { .. }, AggPartial::Cardinality(sketch)) => {
            json!({ "value": sketch.estimate() })
        }
        _ => {
            return Err(Error::Internal(
                "aggregation partial does not match its spec".to_string(),
            ))
        }
    };
    Ok(value)
}

fn render_bucket(key: Value, bucket: &BucketPartial, agg: &Aggregation) -> Result<Value> {
    let mut obj = serde_json::Map::new();
    obj.insert("key".to_string(), key);
    obj.insert("doc_count".to_string(), json!(bucket.doc_count));
    for (name, sub_agg) in &agg.subs {
        let sub_partial = match bucket.subs.get(name) {
            Some(p) => render(sub_agg, p)?,
            None => render(sub_agg, &AggPartial::empty_for(&sub_agg.spec))?,
        };
        obj.insert(name.clone(), sub_partial);
    }
    Ok(Value::Object(obj))
}

fn render_stats(stats: &StatsPartial) -> Value {
    if stats.count == 0 {
        json!({
            "count": 0,
            "min": Value::Null,
            "max": Value::Null,
            "sum": 0.0,
            "avg": Value::Null,
        })
    } else {
        json!({
            "count": stats.count,
            "min": stats.min,
            "max": stats.max,
            "sum": stats.sum,
            "avg": stats.avg(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(count: u64) -> BucketPartial {
        BucketPartial {
            doc_count: count,
            subs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_terms_merge_sums_counts() {
        let mut a = AggPartial::Terms(
            [("x".to_string(), bucket(4)), ("y".to_string(), bucket(1))]
                .into_iter()
                .collect(),
        );
        let b = AggPartial::Terms(
            [("x".to_string(), bucket(2)), ("z".to_string(), bucket(7))]
                .into_iter()
                .collect(),
        );
        a.merge(b).unwrap();
        match a {
            AggPartial::Terms(map) => {
                assert_eq!(map["x"].doc_count, 6);
                assert_eq!(map["y"].doc_count, 1);
                assert_eq!(map["z"].doc_count, 7);
            }
            _ => panic!("expected terms"),
        }
    }

    #[test]
    fn test_avg_merges_sum_and_count() {
        // (10+20)/2 merged with (40)/1 must be 70/3, not avg-of-avgs 27.5.
        let mut a = AggPartial::Avg(StatsPartial {
            count: 2,
            sum: 30.0,
            min: 10.0,
            max: 20.0,
        });
        let b = AggPartial::Avg(StatsPartial {
            count: 1,
            sum: 40.0,
            min: 40.0,
            max: 40.0,
        });
        a.merge(b).unwrap();
        match a {
            AggPartial::Avg(stats) => {
                assert_eq!(stats.count, 3);
                assert!((stats.avg().unwrap() - 70.0 / 3.0).abs() < 1e-12);
            }
            _ => panic!("expected avg"),
        }
    }

    #[test]
    fn test_extended_stats_variance_from_moments() {
        let mut stats = StatsPartial::default();
        let mut sq = 0.0;
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.observe(v);
            sq += v * v;
        }
        let partial = AggPartial::ExtendedStats {
            stats,
            sum_of_squares: sq,
        };
        let agg = Aggregation::new(AggregationSpec::ExtendedStats {
            field: "f".to_string(),
        });
        let rendered = render(&agg, &partial).unwrap();
        assert!((rendered["variance"].as_f64().unwrap() - 4.0).abs() < 1e-9);
        assert!((rendered["std_deviation"].as_f64().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_range_length_mismatch_rejected() {
        let mut a = AggPartial::Range(vec![bucket(1)]);
        let b = AggPartial::Range(vec![bucket(1), bucket(2)]);
        assert!(a.merge(b).is_err());
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut a = AggPartial::Sum(1.0);
        assert!(a.merge(AggPartial::ValueCount(1)).is_err());
    }

    #[test]
    fn test_render_terms_orders_and_truncates() {
        let agg = Aggregation::new(AggregationSpec::Terms {
            field: "cat".to_string(),
            size: 2,
        });
        let partial = AggPartial::Terms(
            [
                ("a".to_string(), bucket(6)),
                ("b".to_string(), bucket(2)),
                ("c".to_string(), bucket(6)),
                ("d".to_string(), bucket(1)),
            ]
            .into_iter()
            .collect(),
        );
        let rendered = render(&agg, &partial).unwrap();
        let buckets = rendered["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        // Equal counts break ties on key ascending.
        assert_eq!(buckets[0]["key"], "a");
        assert_eq!(buckets[1]["key"], "c");
    }

    #[test]
    fn test_empty_stats_render() {
        let rendered = render_stats(&StatsPartial::default());
        assert_eq!(rendered["count"], 0);
        assert!(rendered["min"].is_null());
        assert!(rendered["avg"].is_null());
    }

    #[test]
    fn test_nested_bucket_merge() {
        let mut inner = BTreeMap::new();
        inner.insert("s".to_string(), AggPartial::Sum(5.0));
        let mut a = AggPartial::Terms(
            [(
                "x".to_string(),
                BucketPartial {
                    doc_count: 1,
                    subs: inner.clone(),
                },
            )]
            .into_iter()
            .collect(),
        );
        let b = AggPartial::Terms(
            [(
                "x".to_string(),
                BucketPartial {
                    doc_count: 2,
                    subs: inner,
                },
            )]
            .into_iter()
            .collect(),
        );
        a.merge(b).unwrap();
        match a {
            AggPartial::Terms(map) => {
                assert_eq!(map["x"].doc_count, 3);
                assert_eq!(map["x"].subs["s"], AggPartial::Sum(10.0));
            }
            _ => panic!("expected terms"),
        }
    }
}
