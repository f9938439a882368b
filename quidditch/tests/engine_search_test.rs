//! End-to-end shard engine tests: indexing, commits, the full query
//! surface and the doc-id translation edge cases.

use quidditch::engine::{EngineConfig, ShardEngine, ShardSearchRequest};
use quidditch::error::Error;
use quidditch::query::{NumericRange, QueryAst, RangeBounds};
use quidditch::schema::{FieldMapping, FieldType, IndexMeta, IndexSettings};
use quidditch::types::{Document, SortClause};
use serde_json::json;
use std::collections::BTreeMap;

fn meta() -> IndexMeta {
    IndexMeta::new(
        IndexSettings::default(),
        [
            ("title".to_string(), FieldMapping::text()),
            ("category".to_string(), FieldMapping::keyword()),
            ("price".to_string(), FieldMapping::new(FieldType::F64)),
            ("stock".to_string(), FieldMapping::new(FieldType::I64)),
        ]
        .into_iter()
        .collect(),
    )
}

fn engine(dir: &std::path::Path) -> ShardEngine {
    ShardEngine::open(dir, "items", 0, meta(), EngineConfig::default(), None).unwrap()
}

fn doc(id: &str, title: &str, category: &str, price: f64, stock: i64) -> Document {
    let source = json!({"title": title, "category": category, "price": price, "stock": stock});
    Document::new(id, source.as_object().unwrap().clone())
}

fn seed(engine: &ShardEngine) {
    for d in [
        doc("a", "red gaming laptop", "tech", 999.0, 3),
        doc("b", "blue laptop sleeve", "bags", 49.0, 12),
        doc("c", "red running shoes", "wear", 89.0, 7),
        doc("d", "mechanical keyboard", "tech", 159.0, 0),
    ] {
        engine.index_document(&d).unwrap();
    }
    engine.commit().unwrap();
}

fn search(engine: &ShardEngine, ast: QueryAst) -> Vec<String> {
    let req = ShardSearchRequest {
        ast,
        pushed_filters: Vec::new(),
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    engine
        .search(&req)
        .unwrap()
        .hits
        .into_iter()
        .map(|h| h.doc_id)
        .collect()
}

fn term(field: &str, value: &str) -> QueryAst {
    QueryAst::Term {
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[test]
fn test_term_and_match() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let hits = search(&engine, term("title", "laptop"));
    assert_eq!(hits.len(), 2);
    assert!(hits.contains(&"a".to_string()) && hits.contains(&"b".to_string()));

    // match analyzes the query text; multi-term is a disjunction.
    let hits = search(
        &engine,
        QueryAst::Match {
            field: "title".to_string(),
            text: "Red Keyboard".to_string(),
        },
    );
    assert_eq!(hits.len(), 3); // a, c (red), d (keyboard)
}

#[test]
fn test_term_ranking_prefers_shorter_field() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    // Both a and c contain "red"; equal tf and df, so the shorter title
    // ranks first under BM25 length normalization.
    let req = ShardSearchRequest {
        ast: term("title", "red"),
        pushed_filters: Vec::new(),
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    let result = engine.search(&req).unwrap();
    assert_eq!(result.total, 2);
    assert!(result.hits[0].score >= result.hits[1].score);
}

#[test]
fn test_phrase_in_order_only() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let hits = search(
        &engine,
        QueryAst::Phrase {
            field: "title".to_string(),
            text: "gaming laptop".to_string(),
            slop: 0,
        },
    );
    assert_eq!(hits, vec!["a".to_string()]);

    // Reversed order does not match.
    let hits = search(
        &engine,
        QueryAst::Phrase {
            field: "title".to_string(),
            text: "laptop gaming".to_string(),
            slop: 0,
        },
    );
    assert!(hits.is_empty());

    // "red laptop" has a one-token gap; slop 1 bridges it.
    let hits = search(
        &engine,
        QueryAst::Phrase {
            field: "title".to_string(),
            text: "red laptop".to_string(),
            slop: 1,
        },
    );
    assert_eq!(hits, vec!["a".to_string()]);
}

#[test]
fn test_bool_query() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let ast = QueryAst::Bool {
        must: vec![term("title", "red")],
        should: Vec::new(),
        must_not: vec![term("category", "wear")],
        filter: vec![QueryAst::Range {
            field: "price".to_string(),
            bounds: RangeBounds::F64(NumericRange {
                lower: Some(100.0),
                upper: None,
                include_lower: true,
                include_upper: true,
            }),
        }],
        minimum_should_match: None,
    };
    assert_eq!(search(&engine, ast), vec!["a".to_string()]);
}

#[test]
fn test_range_typed_queries() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let hits = search(
        &engine,
        QueryAst::Range {
            field: "stock".to_string(),
            bounds: RangeBounds::I64(NumericRange {
                lower: Some(1),
                upper: Some(10),
                include_lower: true,
                include_upper: true,
            }),
        },
    );
    assert_eq!(hits.len(), 2); // a (3), c (7)

    // Exclusive bounds.
    let hits = search(
        &engine,
        QueryAst::Range {
            field: "stock".to_string(),
            bounds: RangeBounds::I64(NumericRange {
                lower: Some(3),
                upper: Some(7),
                include_lower: false,
                include_upper: false,
            }),
        },
    );
    assert!(hits.is_empty());

    // Integer-typed bounds against the f64 column are a type error, not a
    // silent zero-hit scan.
    let req = ShardSearchRequest {
        ast: QueryAst::Range {
            field: "price".to_string(),
            bounds: RangeBounds::I64(NumericRange {
                lower: Some(100),
                upper: None,
                include_lower: true,
                include_upper: true,
            }),
        },
        pushed_filters: Vec::new(),
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    assert!(matches!(engine.search(&req), Err(Error::Type { .. })));
}

#[test]
fn test_range_full_f64_span_excludes_nothing_but_nan() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let hits = search(
        &engine,
        QueryAst::Range {
            field: "price".to_string(),
            bounds: RangeBounds::F64(NumericRange {
                lower: Some(f64::MIN),
                upper: Some(f64::MAX),
                include_lower: true,
                include_upper: true,
            }),
        },
    );
    assert_eq!(hits.len(), 4);
}

#[test]
fn test_prefix_wildcard_fuzzy() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let hits = search(
        &engine,
        QueryAst::Prefix {
            field: "title".to_string(),
            value: "lap".to_string(),
        },
    );
    assert_eq!(hits.len(), 2);

    // Leading-star wildcard is supported, just slower.
    let hits = search(
        &engine,
        QueryAst::Wildcard {
            field: "title".to_string(),
            pattern: "*board".to_string(),
        },
    );
    assert_eq!(hits, vec!["d".to_string()]);

    let hits = search(
        &engine,
        QueryAst::Wildcard {
            field: "title".to_string(),
            pattern: "l?ptop".to_string(),
        },
    );
    assert_eq!(hits.len(), 2);

    // One edit away.
    let hits = search(
        &engine,
        QueryAst::Fuzzy {
            field: "title".to_string(),
            value: "laptpo".to_string(),
            max_edits: 2,
        },
    );
    assert_eq!(hits.len(), 2);

    // Edit distance zero degenerates to an exact term query.
    let exact = search(&engine, term("title", "laptop"));
    let fuzzy0 = search(
        &engine,
        QueryAst::Fuzzy {
            field: "title".to_string(),
            value: "laptop".to_string(),
            max_edits: 0,
        },
    );
    assert_eq!(exact, fuzzy0);
}

#[test]
fn test_multi_segment_retrieval_one_doc_per_segment() {
    // The classic failure mode: using a global doc id directly against
    // segment 0. One doc per segment makes any translation mistake visible.
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    for (i, d) in [
        doc("s0", "alpha laptop", "tech", 1.0, 1),
        doc("s1", "bravo laptop", "tech", 2.0, 1),
        doc("s2", "charlie laptop", "tech", 3.0, 1),
    ]
    .iter()
    .enumerate()
    {
        engine.index_document(d).unwrap();
        assert_eq!(engine.commit().unwrap(), Some(i as u64));
    }

    let req = ShardSearchRequest {
        ast: term("title", "laptop"),
        pushed_filters: Vec::new(),
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    let result = engine.search(&req).unwrap();
    assert_eq!(result.total, 3);
    for hit in &result.hits {
        // Every hit resolves to its own stored source, not segment 0's.
        let source = hit.source.as_ref().unwrap();
        let title = source["title"].as_str().unwrap();
        assert!(title.starts_with(match hit.doc_id.as_str() {
            "s0" => "alpha",
            "s1" => "bravo",
            "s2" => "charlie",
            other => panic!("unexpected doc {}", other),
        }));
    }
    // Global ids are dense across segments.
    let mut globals: Vec<u32> = result.hits.iter().map(|h| h.global_doc).collect();
    globals.sort();
    assert_eq!(globals, vec![0, 1, 2]);
}

#[test]
fn test_delete_and_update_visibility() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    // Update: last writer wins across commits.
    engine
        .index_document(&doc("a", "renamed laptop", "tech", 899.0, 2))
        .unwrap();
    engine.commit().unwrap();
    let fetched = engine.get_document("a").unwrap().unwrap();
    assert_eq!(fetched.fields["title"], json!("renamed laptop"));

    // The old copy no longer matches searches.
    let hits = search(&engine, term("title", "gaming"));
    assert!(hits.is_empty());

    // Delete hides the doc from search and get.
    assert!(engine.delete_document("a").unwrap());
    assert!(!engine.delete_document("a").unwrap());
    assert!(engine.get_document("a").unwrap().is_none());
    let hits = search(&engine, term("title", "renamed"));
    assert!(hits.is_empty());
}

#[test]
fn test_get_reads_uncommitted_buffer() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    engine
        .index_document(&doc("x", "buffered", "tech", 1.0, 1))
        .unwrap();
    // Visible to get before any commit; not yet visible to search.
    assert!(engine.get_document("x").unwrap().is_some());
    let hits = search(&engine, term("title", "buffered"));
    assert!(hits.is_empty());
    engine.commit().unwrap();
    let hits = search(&engine, term("title", "buffered"));
    assert_eq!(hits, vec!["x".to_string()]);
}

#[test]
fn test_sort_by_field_and_pagination() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    for i in 1..=9 {
        engine
            .index_document(&doc(
                &format!("d{}", i),
                "widget",
                "tech",
                i as f64,
                i,
            ))
            .unwrap();
    }
    engine.commit().unwrap();

    let sort = vec![SortClause::desc("price")];
    let page = |from_plus_size: usize| -> Vec<String> {
        let req = ShardSearchRequest {
            ast: term("title", "widget"),
            pushed_filters: Vec::new(),
            from_plus_size,
            sort: sort.clone(),
            aggs: BTreeMap::new(),
        };
        engine
            .search(&req)
            .unwrap()
            .hits
            .into_iter()
            .map(|h| h.doc_id)
            .collect()
    };

    // Top 3 by price descending.
    assert_eq!(page(3), vec!["d9", "d8", "d7"]);
    // A larger k extends the same prefix (pagination invariant locally).
    assert_eq!(page(6)[..3], page(3)[..]);
}

#[test]
fn test_pushed_filters_intersect() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);

    let req = ShardSearchRequest {
        ast: term("title", "red"),
        pushed_filters: vec![term("category", "tech")],
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    let result = engine.search(&req).unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.hits[0].doc_id, "a");
}

#[test]
fn test_schema_mismatch_on_index() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    let bad = Document::new(
        "bad",
        json!({"price": "not a number"}).as_object().unwrap().clone(),
    );
    assert!(matches!(
        engine.index_document(&bad),
        Err(Error::SchemaMismatch { .. })
    ));
}

#[test]
fn test_empty_shard_search() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    let req = ShardSearchRequest {
        ast: QueryAst::MatchAll,
        pushed_filters: Vec::new(),
        from_plus_size: 10,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    let result = engine.search(&req).unwrap();
    assert_eq!(result.total, 0);
    assert!(result.hits.is_empty());
    assert_eq!(result.max_score, None);
}

#[test]
fn test_merge_drops_tombstones() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);
    engine
        .index_document(&doc("e", "spare laptop", "tech", 10.0, 1))
        .unwrap();
    engine.commit().unwrap();

    engine.delete_document("b").unwrap();
    engine.delete_document("c").unwrap();

    // Both segments now carry tombstones; merge them all.
    let merged = engine.merge(&[0, 1]).unwrap();
    assert!(merged.is_some());

    let (docs, _) = engine.stats();
    assert_eq!(docs, 3);
    let hits = search(&engine, term("title", "laptop"));
    assert_eq!(hits.len(), 2); // a and e survive, b was deleted
    assert!(engine.get_document("b").unwrap().is_none());
    assert!(engine.get_document("e").unwrap().is_some());
}

#[test]
fn test_count_matches_search_total() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    seed(&engine);
    let count = engine.count(&term("title", "laptop"), &[]).unwrap();
    let req = ShardSearchRequest {
        ast: term("title", "laptop"),
        pushed_filters: Vec::new(),
        from_plus_size: 1,
        sort: Vec::new(),
        aggs: BTreeMap::new(),
    };
    assert_eq!(count, engine.search(&req).unwrap().total);
}
