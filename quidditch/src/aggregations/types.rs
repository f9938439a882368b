use crate::error::{Error, Result};
use crate::query::QueryAst;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One aggregation node: its kind plus nested sub-aggregations (bucket
/// kinds only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub spec: AggregationSpec,
    #[serde(default)]
    pub subs: BTreeMap<String, Aggregation>,
}

impl Aggregation {
    pub fn new(spec: AggregationSpec) -> Self {
        Self {
            spec,
            subs: BTreeMap::new(),
        }
    }

    pub fn with_subs(spec: AggregationSpec, subs: BTreeMap<String, Aggregation>) -> Result<Self> {
        if !subs.is_empty() && !spec.is_bucket() {
            return Err(Error::parse(
                "aggs",
                "sub-aggregations are only valid under bucket aggregations",
            ));
        }
        Ok(Self { spec, subs })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationSpec {
    Terms {
        field: String,
        size: usize,
    },
    Histogram {
        field: String,
        interval: f64,
    },
    DateHistogram {
        field: String,
        interval: DateInterval,
    },
    Range {
        field: String,
        ranges: Vec<RangeBucketBounds>,
    },
    Filters {
        filters: BTreeMap<String, QueryAst>,
    },
    Avg {
        field: String,
    },
    Min {
        field: String,
    },
    Max {
        field: String,
    },
    Sum {
        field: String,
    },
    ValueCount {
        field: String,
    },
    Stats {
        field: String,
    },
    ExtendedStats {
        field: String,
    },
    Percentiles {
        field: String,
        percents: Vec<f64>,
    },
    Cardinality {
        field: String,
    },
}

impl AggregationSpec {
    pub fn is_bucket(&self) -> bool {
        matches!(
            self,
            AggregationSpec::Terms { .. }
                | AggregationSpec::Histogram { .. }
                | AggregationSpec::DateHistogram { .. }
                | AggregationSpec::Range { .. }
                | AggregationSpec::Filters { .. }
        )
    }

    /// How many terms a shard ships for a top-N terms aggregation. Shipping
    /// more than N reduces (but cannot eliminate) shadowed-term error.
    pub fn shard_size(size: usize) -> usize {
        (size.saturating_mul(3)).max(size + 10)
    }
}

/// Date-histogram bucketing interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateInterval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
    /// Fixed duration in milliseconds.
    FixedMillis(i64),
}

impl DateInterval {
    pub fn parse(calendar: Option<&str>, fixed_ms: Option<i64>) -> Result<DateInterval> {
        if let Some(ms) = fixed_ms {
            if ms <= 0 {
                return Err(Error::parse("aggs", "fixed interval must be positive"));
            }
            return Ok(DateInterval::FixedMillis(ms));
        }
        match calendar {
            Some("minute") | Some("1m") => Ok(DateInterval::Minute),
            Some("hour") | Some("1h") => Ok(DateInterval::Hour),
            Some("day") | Some("1d") => Ok(DateInterval::Day),
            Some("week") | Some("1w") => Ok(DateInterval::Week),
            Some("month") | Some("1M") => Ok(DateInterval::Month),
            Some("quarter") | Some("1q") => Ok(DateInterval::Quarter),
            Some("year") | Some("1y") => Ok(DateInterval::Year),
            Some(other) => Err(Error::parse(
                "aggs",
                format!("unknown calendar_interval `{}`", other),
            )),
            None => Err(Error::parse(
                "aggs",
                "date_histogram requires calendar_interval or fixed_interval",
            )),
        }
    }

    /// Bucket start (epoch millis) for a timestamp, in UTC.
    pub fn bucket_start(&self, millis: i64) -> i64 {
        use chrono::{Datelike, TimeZone, Utc};
        match self {
            DateInterval::FixedMillis(ms) => millis.div_euclid(*ms) * ms,
            DateInterval::Minute => millis.div_euclid(60_000) * 60_000,
            DateInterval::Hour => millis.div_euclid(3_600_000) * 3_600_000,
            DateInterval::Day => millis.div_euclid(86_400_000) * 86_400_000,
            DateInterval::Week => {
                // ISO weeks start on Monday; epoch day 0 was a Thursday.
                let day = millis.div_euclid(86_400_000);
                let week_day = (day + 3).rem_euclid(7);
                (day - week_day) * 86_400_000
            }
            DateInterval::Month | DateInterval::Quarter | DateInterval::Year => {
                let dt = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH);
                let (year, month) = match self {
                    DateInterval::Month => (dt.year(), dt.month()),
                    DateInterval::Quarter => (dt.year(), ((dt.month() - 1) / 3) * 3 + 1),
                    _ => (dt.year(), 1),
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .map(|d| d.timestamp_millis())
                    .unwrap_or(0)
            }
        }
    }
}

/// One explicit bucket of a `range` aggregation. `from` is inclusive,
/// `to` exclusive, either side open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeBucketBounds {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub from: Option<f64>,
    #[serde(default)]
    pub to: Option<f64>,
}

impl RangeBucketBounds {
    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        if let Some(from) = self.from {
            if value < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if value >= to {
                return false;
            }
        }
        true
    }

    pub fn label(&self) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }
        let fmt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string());
        format!("{}-{}", fmt(self.from), fmt(self.to))
    }
}
