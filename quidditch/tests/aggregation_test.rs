//! Engine-level aggregation tests: partial computation over matched docs
//! and rendering of merged state.

use quidditch::aggregations::{
    render, AggPartial, Aggregation, AggregationSpec, DateInterval, RangeBucketBounds,
};
use quidditch::engine::{EngineConfig, ShardEngine, ShardSearchRequest};
use quidditch::query::QueryAst;
use quidditch::schema::{FieldMapping, FieldType, IndexMeta, IndexSettings};
use quidditch::types::Document;
use serde_json::json;
use std::collections::BTreeMap;

fn meta() -> IndexMeta {
    IndexMeta::new(
        IndexSettings::default(),
        [
            ("title".to_string(), FieldMapping::text()),
            ("category".to_string(), FieldMapping::keyword()),
            ("price".to_string(), FieldMapping::new(FieldType::F64)),
            ("added".to_string(), FieldMapping::new(FieldType::Date)),
        ]
        .into_iter()
        .collect(),
    )
}

const PRICES: [f64; 8] = [79.99, 99.99, 199.99, 249.99, 399.99, 499.99, 999.99, 1499.99];

fn engine_with_prices(dir: &std::path::Path) -> ShardEngine {
    let engine =
        ShardEngine::open(dir, "products", 0, meta(), EngineConfig::default(), None).unwrap();
    for (i, price) in PRICES.iter().enumerate() {
        let category = if i < 6 { "A" } else { "B" };
        let day = format!("2024-03-{:02}T12:00:00Z", i + 1);
        let source = json!({
            "title": format!("product {}", i),
            "category": category,
            "price": price,
            "added": day,
        });
        engine
            .index_document(&Document::new(
                format!("p{}", i),
                source.as_object().unwrap().clone(),
            ))
            .unwrap();
    }
    engine.commit().unwrap();
    engine
}

fn run_aggs(
    engine: &ShardEngine,
    aggs: BTreeMap<String, Aggregation>,
) -> BTreeMap<String, AggPartial> {
    let req = ShardSearchRequest {
        ast: QueryAst::MatchAll,
        pushed_filters: Vec::new(),
        from_plus_size: 0,
        sort: Vec::new(),
        aggs,
    };
    engine.search(&req).unwrap().aggregations
}

fn one(name: &str, agg: Aggregation) -> BTreeMap<String, Aggregation> {
    [(name.to_string(), agg)].into_iter().collect()
}

#[test]
fn test_stats_over_prices() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::Stats {
        field: "price".to_string(),
    });
    let partials = run_aggs(&engine, one("p", agg.clone()));
    let rendered = render(&agg, &partials["p"]).unwrap();

    assert_eq!(rendered["count"], 8);
    assert_eq!(rendered["min"].as_f64().unwrap(), 79.99);
    assert_eq!(rendered["max"].as_f64().unwrap(), 1499.99);
    let sum = rendered["sum"].as_f64().unwrap();
    assert!((sum - 4029.92).abs() < 1e-9, "sum {}", sum);
    let avg = rendered["avg"].as_f64().unwrap();
    assert!((avg - 503.74).abs() < 1e-9, "avg {}", avg);
}

#[test]
fn test_terms_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::Terms {
        field: "category".to_string(),
        size: 10,
    });
    let partials = run_aggs(&engine, one("cats", agg.clone()));
    let rendered = render(&agg, &partials["cats"]).unwrap();
    let buckets = rendered["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0]["key"], "A");
    assert_eq!(buckets[0]["doc_count"], 6);
    assert_eq!(buckets[1]["key"], "B");
    assert_eq!(buckets[1]["doc_count"], 2);
}

#[test]
fn test_histogram_buckets() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::Histogram {
        field: "price".to_string(),
        interval: 500.0,
    });
    let partials = run_aggs(&engine, one("h", agg.clone()));
    let rendered = render(&agg, &partials["h"]).unwrap();
    let buckets = rendered["buckets"].as_array().unwrap();
    // [0,500): six prices; [500,1000): two (499.99 is below 500); check.
    assert_eq!(buckets[0]["key"].as_f64().unwrap(), 0.0);
    assert_eq!(buckets[0]["doc_count"], 6);
    assert_eq!(buckets[1]["key"].as_f64().unwrap(), 500.0);
    assert_eq!(buckets[1]["doc_count"], 1);
    assert_eq!(buckets[2]["key"].as_f64().unwrap(), 1000.0);
    assert_eq!(buckets[2]["doc_count"], 1);
}

#[test]
fn test_date_histogram_daily() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::DateHistogram {
        field: "added".to_string(),
        interval: DateInterval::Day,
    });
    let partials = run_aggs(&engine, one("daily", agg.clone()));
    match &partials["daily"] {
        AggPartial::DateHistogram(map) => {
            assert_eq!(map.len(), 8);
            assert!(map.values().all(|b| b.doc_count == 1));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_range_buckets_with_sub_agg() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::with_subs(
        AggregationSpec::Range {
            field: "price".to_string(),
            ranges: vec![
                RangeBucketBounds {
                    key: Some("cheap".to_string()),
                    from: None,
                    to: Some(200.0),
                },
                RangeBucketBounds {
                    key: Some("rest".to_string()),
                    from: Some(200.0),
                    to: None,
                },
            ],
        },
        [(
            "avg_price".to_string(),
            Aggregation::new(AggregationSpec::Avg {
                field: "price".to_string(),
            }),
        )]
        .into_iter()
        .collect(),
    )
    .unwrap();
    let partials = run_aggs(&engine, one("bands", agg.clone()));
    let rendered = render(&agg, &partials["bands"]).unwrap();
    let buckets = rendered["buckets"].as_array().unwrap();
    assert_eq!(buckets[0]["key"], "cheap");
    // `to` is exclusive, so 199.99 still lands in "cheap".
    assert_eq!(buckets[0]["doc_count"], 3);
    assert_eq!(buckets[1]["doc_count"], 5);
    let cheap_avg = buckets[0]["avg_price"]["value"].as_f64().unwrap();
    assert!((cheap_avg - (79.99 + 99.99 + 199.99) / 3.0).abs() < 1e-9);
}

#[test]
fn test_filters_aggregation() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let mut filters = BTreeMap::new();
    filters.insert(
        "cat_a".to_string(),
        QueryAst::Term {
            field: "category".to_string(),
            value: "A".to_string(),
        },
    );
    filters.insert(
        "pricey".to_string(),
        QueryAst::Range {
            field: "price".to_string(),
            bounds: quidditch::query::RangeBounds::F64(quidditch::query::NumericRange {
                lower: Some(400.0),
                upper: None,
                include_lower: true,
                include_upper: true,
            }),
        },
    );
    let agg = Aggregation::new(AggregationSpec::Filters { filters });
    let partials = run_aggs(&engine, one("f", agg.clone()));
    match &partials["f"] {
        AggPartial::Filters(map) => {
            assert_eq!(map["cat_a"].doc_count, 6);
            assert_eq!(map["pricey"].doc_count, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_metric_aggregations() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let mut aggs = BTreeMap::new();
    for (name, spec) in [
        ("min", AggregationSpec::Min { field: "price".to_string() }),
        ("max", AggregationSpec::Max { field: "price".to_string() }),
        ("sum", AggregationSpec::Sum { field: "price".to_string() }),
        ("n", AggregationSpec::ValueCount { field: "price".to_string() }),
        ("card", AggregationSpec::Cardinality { field: "category".to_string() }),
    ] {
        aggs.insert(name.to_string(), Aggregation::new(spec));
    }
    let partials = run_aggs(&engine, aggs);
    assert_eq!(partials["min"], AggPartial::Min(Some(79.99)));
    assert_eq!(partials["max"], AggPartial::Max(Some(1499.99)));
    assert_eq!(partials["n"], AggPartial::ValueCount(8));
    match &partials["sum"] {
        AggPartial::Sum(v) => assert!((v - 4029.92).abs() < 1e-9),
        other => panic!("unexpected {:?}", other),
    }
    match &partials["card"] {
        AggPartial::Cardinality(sketch) => assert_eq!(sketch.estimate(), 2),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_percentiles_reasonable() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::Percentiles {
        field: "price".to_string(),
        percents: vec![0.0, 50.0, 100.0],
    });
    let partials = run_aggs(&engine, one("pct", agg));
    match &partials["pct"] {
        AggPartial::Percentiles(sketch) => {
            assert_eq!(sketch.quantile(0.0), Some(79.99));
            assert_eq!(sketch.quantile(1.0), Some(1499.99));
            let median = sketch.quantile(0.5).unwrap();
            assert!(median > 150.0 && median < 500.0, "median {}", median);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_empty_shard_zero_state() {
    let tmp = tempfile::tempdir().unwrap();
    let engine =
        ShardEngine::open(tmp.path(), "products", 0, meta(), EngineConfig::default(), None)
            .unwrap();
    let stats = Aggregation::new(AggregationSpec::Stats {
        field: "price".to_string(),
    });
    let terms = Aggregation::new(AggregationSpec::Terms {
        field: "category".to_string(),
        size: 5,
    });
    let mut aggs = BTreeMap::new();
    aggs.insert("s".to_string(), stats.clone());
    aggs.insert("t".to_string(), terms.clone());
    let partials = run_aggs(&engine, aggs);

    let rendered = render(&stats, &partials["s"]).unwrap();
    assert_eq!(rendered["count"], 0);
    assert!(rendered["avg"].is_null());

    let rendered = render(&terms, &partials["t"]).unwrap();
    assert!(rendered["buckets"].as_array().unwrap().is_empty());
}

#[test]
fn test_aggs_respect_query_scope() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine_with_prices(tmp.path());
    let agg = Aggregation::new(AggregationSpec::ValueCount {
        field: "price".to_string(),
    });
    let req = ShardSearchRequest {
        ast: QueryAst::Term {
            field: "category".to_string(),
            value: "B".to_string(),
        },
        pushed_filters: Vec::new(),
        from_plus_size: 0,
        sort: Vec::new(),
        aggs: one("n", agg),
    };
    let result = engine.search(&req).unwrap();
    assert_eq!(result.aggregations["n"], AggPartial::ValueCount(2));
}
