//! Aggregations: per-shard partial computation and the cross-shard merge
//! algebra. A shard emits an [`AggPartial`] per requested aggregation; the
//! coordinator merges partials pairwise (deterministically) and renders the
//! merged state into response JSON.

mod collect;
mod partial;
mod sketch;
mod types;

pub use collect::{collect_partial, DocValues, FilterEval};
pub use partial::{render, AggPartial, BucketPartial, StatsPartial};
pub use sketch::{CardinalitySketch, QuantileSketch};
pub use types::{Aggregation, AggregationSpec, DateInterval, RangeBucketBounds};
