//! DSL → AST translation with mapping validation. Every rejection carries
//! the JSON path of the offending clause.

use super::ast::{NumericRange, QueryAst, RangeBounds};
use super::dsl::*;
use crate::aggregations::{Aggregation, AggregationSpec, DateInterval, RangeBucketBounds};
use crate::error::{Error, Result};
use crate::schema::{parse_date, FieldMapping, FieldType, IndexMeta};
use crate::types::{SortClause, SortOrder};
use serde_json::Value;
use std::collections::BTreeMap;

/// A fully-translated and validated search request.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    pub ast: QueryAst,
    pub sort: Vec<SortClause>,
    pub aggs: BTreeMap<String, Aggregation>,
    pub from: usize,
    pub size: usize,
    pub track_total_hits: bool,
}

pub fn translate_body(
    body: &SearchBody,
    meta: &IndexMeta,
    max_from_plus_size: usize,
) -> Result<TranslatedQuery> {
    let from = body.from.unwrap_or(0);
    let size = body.size.unwrap_or(10);
    if from + size > max_from_plus_size {
        return Err(Error::DeepPaginationExceeded {
            requested: from + size,
            limit: max_from_plus_size,
        });
    }

    let ast = match &body.query {
        Some(query) => translate_query(query, meta, "query")?,
        None => QueryAst::MatchAll,
    };

    let sort = match &body.sort {
        Some(clauses) => translate_sort(clauses, meta)?,
        None => Vec::new(),
    };

    let mut aggs = BTreeMap::new();
    if let Some(bodies) = &body.aggs {
        for (name, agg) in bodies {
            let path = format!("aggs.{}", name);
            aggs.insert(name.clone(), translate_agg(agg, meta, &path)?);
        }
    }

    Ok(TranslatedQuery {
        ast,
        sort,
        aggs,
        from,
        size,
        track_total_hits: body.track_total_hits.unwrap_or(true),
    })
}

pub fn translate_query(query: &DslQuery, meta: &IndexMeta, path: &str) -> Result<QueryAst> {
    match query {
        DslQuery::MatchAll(_) => Ok(QueryAst::MatchAll),

        DslQuery::Term(map) => {
            let (field, value) = single_entry(map, path)?;
            let mapping = mapped_field(meta, field, path)?;
            translate_term(field, mapping, value.value(), path)
        }

        DslQuery::Match(map) => {
            let (field, value) = single_entry(map, path)?;
            let mapping = mapped_field(meta, field, path)?;
            match mapping.field_type {
                FieldType::Text => Ok(QueryAst::Match {
                    field: field.clone(),
                    text: value.query().to_string(),
                }),
                FieldType::Keyword => Ok(QueryAst::Term {
                    field: field.clone(),
                    value: value.query().to_string(),
                }),
                other => Err(Error::type_mismatch(
                    format!("{}.{}", path, field),
                    format!("match requires a text field, found {:?}", other),
                )),
            }
        }

        DslQuery::Phrase(map) => {
            let (field, value) = single_entry(map, path)?;
            let mapping = mapped_field(meta, field, path)?;
            if mapping.field_type != FieldType::Text {
                return Err(Error::type_mismatch(
                    format!("{}.{}", path, field),
                    "phrase requires a text field",
                ));
            }
            Ok(QueryAst::Phrase {
                field: field.clone(),
                text: value.query().to_string(),
                slop: value.slop(),
            })
        }

        DslQuery::Range(map) => {
            let (field, params) = single_entry(map, path)?;
            let mapping = mapped_field(meta, field, path)?;
            let bounds = translate_range(field, mapping, params, path)?;
            Ok(QueryAst::Range {
                field: field.clone(),
                bounds,
            })
        }

        DslQuery::Prefix(map) => {
            let (field, value) = single_entry(map, path)?;
            require_string_field(meta, field, path, "prefix")?;
            Ok(QueryAst::Prefix {
                field: field.clone(),
                value: value.value().to_string(),
            })
        }

        DslQuery::Wildcard(map) => {
            let (field, value) = single_entry(map, path)?;
            require_string_field(meta, field, path, "wildcard")?;
            Ok(QueryAst::Wildcard {
                field: field.clone(),
                pattern: value.value().to_string(),
            })
        }

        DslQuery::Fuzzy(map) => {
            let (field, value) = single_entry(map, path)?;
            require_string_field(meta, field, path, "fuzzy")?;
            let max_edits = match value.fuzziness() {
                None => auto_fuzziness(value.value()),
                Some(Value::String(s)) if s.eq_ignore_ascii_case("auto") => {
                    auto_fuzziness(value.value())
                }
                Some(Value::Number(n)) => {
                    let edits = n.as_u64().ok_or_else(|| {
                        Error::parse(
                            format!("{}.{}", path, field),
                            "fuzziness must be a non-negative integer or AUTO",
                        )
                    })?;
                    if edits > 2 {
                        return Err(Error::parse(
                            format!("{}.{}", path, field),
                            "fuzziness above 2 is not supported",
                        ));
                    }
                    edits as u8
                }
                Some(other) => {
                    return Err(Error::parse(
                        format!("{}.{}", path, field),
                        format!("invalid fuzziness: {}", other),
                    ))
                }
            };
            Ok(QueryAst::Fuzzy {
                field: field.clone(),
                value: value.value().to_string(),
                max_edits,
            })
        }

        DslQuery::Bool(body) => {
            let clause = |list: &Option<ClauseList>, kind: &str| -> Result<Vec<QueryAst>> {
                match list {
                    None => Ok(Vec::new()),
                    Some(list) => list
                        .clone()
                        .into_vec()
                        .iter()
                        .enumerate()
                        .map(|(i, q)| {
                            translate_query(q, meta, &format!("{}.bool.{}[{}]", path, kind, i))
                        })
                        .collect(),
                }
            };
            Ok(QueryAst::Bool {
                must: clause(&body.must, "must")?,
                should: clause(&body.should, "should")?,
                must_not: clause(&body.must_not, "must_not")?,
                filter: clause(&body.filter, "filter")?,
                minimum_should_match: body.minimum_should_match,
            })
        }

        DslQuery::UserDefined(body) => Ok(QueryAst::UserDefined {
            module: body.module.clone(),
            payload: serde_json::to_vec(&body.params)?,
        }),
    }
}

fn translate_term(
    field: &str,
    mapping: &FieldMapping,
    value: &Value,
    path: &str,
) -> Result<QueryAst> {
    let field_path = format!("{}.{}", path, field);
    match mapping.field_type {
        FieldType::Text | FieldType::Keyword => {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(Error::type_mismatch(
                        field_path,
                        format!("term value must be scalar, got {}", other),
                    ))
                }
            };
            Ok(QueryAst::Term {
                field: field.to_string(),
                value,
            })
        }
        FieldType::Bool => match value {
            Value::Bool(b) => Ok(QueryAst::Term {
                field: field.to_string(),
                value: b.to_string(),
            }),
            other => Err(Error::type_mismatch(
                field_path,
                format!("expected boolean, got {}", other),
            )),
        },
        FieldType::I64 => {
            let v = integer_bound(value, &field_path)?;
            Ok(QueryAst::Range {
                field: field.to_string(),
                bounds: RangeBounds::I64(equal_range(v)),
            })
        }
        FieldType::F64 => {
            let v = float_bound(value, &field_path)?;
            Ok(QueryAst::Range {
                field: field.to_string(),
                bounds: RangeBounds::F64(equal_range(v)),
            })
        }
        FieldType::Date => {
            let millis = parse_date(&field_path, value)
                .map_err(|_| Error::type_mismatch(field_path.clone(), "expected a date value"))?;
            Ok(QueryAst::Range {
                field: field.to_string(),
                bounds: RangeBounds::Date(equal_range(millis)),
            })
        }
        FieldType::Object => Err(Error::type_mismatch(
            field_path,
            "term queries are not supported on object fields",
        )),
    }
}

fn translate_range(
    field: &str,
    mapping: &FieldMapping,
    params: &RangeParams,
    path: &str,
) -> Result<RangeBounds> {
    let field_path = format!("{}.{}", path, field);
    if params.gte.is_some() && params.gt.is_some() {
        return Err(Error::parse(field_path, "both gte and gt given"));
    }
    if params.lte.is_some() && params.lt.is_some() {
        return Err(Error::parse(field_path, "both lte and lt given"));
    }

    let include_lower = params.gt.is_none();
    let include_upper = params.lt.is_none();
    let lower = params.gte.as_ref().or(params.gt.as_ref());
    let upper = params.lte.as_ref().or(params.lt.as_ref());

    match mapping.field_type {
        FieldType::I64 => Ok(RangeBounds::I64(NumericRange {
            lower: lower.map(|v| integer_bound(v, &field_path)).transpose()?,
            upper: upper.map(|v| integer_bound(v, &field_path)).transpose()?,
            include_lower,
            include_upper,
        })),
        FieldType::F64 => Ok(RangeBounds::F64(NumericRange {
            lower: lower.map(|v| float_bound(v, &field_path)).transpose()?,
            upper: upper.map(|v| float_bound(v, &field_path)).transpose()?,
            include_lower,
            include_upper,
        })),
        FieldType::Date => Ok(RangeBounds::Date(NumericRange {
            lower: lower
                .map(|v| {
                    parse_date(&field_path, v).map_err(|_| {
                        Error::type_mismatch(field_path.clone(), "expected a date bound")
                    })
                })
                .transpose()?,
            upper: upper
                .map(|v| {
                    parse_date(&field_path, v).map_err(|_| {
                        Error::type_mismatch(field_path.clone(), "expected a date bound")
                    })
                })
                .transpose()?,
            include_lower,
            include_upper,
        })),
        other => Err(Error::type_mismatch(
            field_path,
            format!("range requires a numeric or date field, found {:?}", other),
        )),
    }
}

/// Integer bound for an i64 field. Fractional literals are a type error;
/// whole-number floats coerce.
fn integer_bound(value: &Value, path: &str) -> Result<i64> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(v);
            }
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    return Ok(f as i64);
                }
            }
            Err(Error::type_mismatch(
                path,
                format!("bound {} is not an integer", n),
            ))
        }
        other => Err(Error::type_mismatch(
            path,
            format!("expected integer bound, got {}", other),
        )),
    }
}

/// Float bound for an f64 field. Integer literals coerce losslessly.
fn float_bound(value: &Value, path: &str) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::type_mismatch(path, format!("bound {} is not numeric", n))),
        other => Err(Error::type_mismatch(
            path,
            format!("expected numeric bound, got {}", other),
        )),
    }
}

fn equal_range<T: Copy>(value: T) -> NumericRange<T> {
    NumericRange {
        lower: Some(value),
        upper: Some(value),
        include_lower: true,
        include_upper: true,
    }
}

fn translate_sort(clauses: &[DslSortClause], meta: &IndexMeta) -> Result<Vec<SortClause>> {
    let mut sort = Vec::with_capacity(clauses.len());
    for clause in clauses {
        match clause {
            DslSortClause::Field(field) => {
                sort.push(sort_clause(field, None, meta)?);
            }
            DslSortClause::Object(map) => {
                for (field, order) in map {
                    sort.push(sort_clause(field, Some(order.order()), meta)?);
                }
            }
        }
    }
    Ok(sort)
}

fn sort_clause(field: &str, order: Option<&str>, meta: &IndexMeta) -> Result<SortClause> {
    let order = match order {
        Some("asc") => SortOrder::Asc,
        Some("desc") => SortOrder::Desc,
        Some(other) => {
            return Err(Error::parse(
                format!("sort.{}", field),
                format!("unknown sort order `{}`", other),
            ))
        }
        // _score defaults to best-first; fields default ascending.
        None if field == "_score" => SortOrder::Desc,
        None => SortOrder::Asc,
    };
    if field != "_score" {
        let mapping = meta.field(field).ok_or_else(|| {
            Error::parse(format!("sort.{}", field), "unknown field")
        })?;
        if matches!(mapping.field_type, FieldType::Text | FieldType::Object) {
            return Err(Error::type_mismatch(
                format!("sort.{}", field),
                format!("cannot sort on a {:?} field", mapping.field_type),
            ));
        }
    }
    Ok(SortClause {
        field: field.to_string(),
        order,
    })
}

fn translate_agg(body: &DslAggregation, meta: &IndexMeta, path: &str) -> Result<Aggregation> {
    let mut spec: Option<AggregationSpec> = None;
    let mut set = |s: AggregationSpec| -> Result<()> {
        if spec.is_some() {
            return Err(Error::parse(path, "aggregation declares more than one kind"));
        }
        spec = Some(s);
        Ok(())
    };

    if let Some(terms) = &body.terms {
        require_agg_field(
            meta,
            &terms.field,
            path,
            &[
                FieldType::Keyword,
                FieldType::Bool,
                FieldType::I64,
                FieldType::Date,
            ],
        )?;
        set(AggregationSpec::Terms {
            field: terms.field.clone(),
            size: terms.size.unwrap_or(10),
        })?;
    }
    if let Some(histogram) = &body.histogram {
        require_numeric_agg_field(meta, &histogram.field, path)?;
        if histogram.interval <= 0.0 {
            return Err(Error::parse(path, "histogram interval must be positive"));
        }
        set(AggregationSpec::Histogram {
            field: histogram.field.clone(),
            interval: histogram.interval,
        })?;
    }
    if let Some(dh) = &body.date_histogram {
        require_agg_field(meta, &dh.field, path, &[FieldType::Date, FieldType::I64])?;
        let interval =
            DateInterval::parse(dh.calendar_interval.as_deref(), dh.fixed_interval_ms)?;
        set(AggregationSpec::DateHistogram {
            field: dh.field.clone(),
            interval,
        })?;
    }
    if let Some(range) = &body.range {
        require_numeric_agg_field(meta, &range.field, path)?;
        if range.ranges.is_empty() {
            return Err(Error::parse(path, "range aggregation needs at least one bucket"));
        }
        set(AggregationSpec::Range {
            field: range.field.clone(),
            ranges: range
                .ranges
                .iter()
                .map(|r| RangeBucketBounds {
                    key: r.key.clone(),
                    from: r.from,
                    to: r.to,
                })
                .collect(),
        })?;
    }
    if let Some(filters) = &body.filters {
        let mut translated = BTreeMap::new();
        for (name, query) in &filters.filters {
            translated.insert(
                name.clone(),
                translate_query(query, meta, &format!("{}.filters.{}", path, name))?,
            );
        }
        set(AggregationSpec::Filters {
            filters: translated,
        })?;
    }

    let metric_specs: [(&Option<FieldAggBody>, fn(String) -> AggregationSpec); 7] = [
        (&body.avg, |f| AggregationSpec::Avg { field: f }),
        (&body.min, |f| AggregationSpec::Min { field: f }),
        (&body.max, |f| AggregationSpec::Max { field: f }),
        (&body.sum, |f| AggregationSpec::Sum { field: f }),
        (&body.value_count, |f| AggregationSpec::ValueCount {
            field: f,
        }),
        (&body.stats, |f| AggregationSpec::Stats { field: f }),
        (&body.extended_stats, |f| AggregationSpec::ExtendedStats {
            field: f,
        }),
    ];
    for (field_body, make) in metric_specs {
        if let Some(fb) = field_body {
            require_numeric_agg_field(meta, &fb.field, path)?;
            set(make(fb.field.clone()))?;
        }
    }

    if let Some(p) = &body.percentiles {
        require_numeric_agg_field(meta, &p.field, path)?;
        set(AggregationSpec::Percentiles {
            field: p.field.clone(),
            percents: p
                .percents
                .clone()
                .unwrap_or_else(|| vec![1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0]),
        })?;
    }
    if let Some(c) = &body.cardinality {
        require_agg_field(
            meta,
            &c.field,
            path,
            &[
                FieldType::Keyword,
                FieldType::Bool,
                FieldType::I64,
                FieldType::F64,
                FieldType::Date,
            ],
        )?;
        set(AggregationSpec::Cardinality {
            field: c.field.clone(),
        })?;
    }

    let spec = spec.ok_or_else(|| Error::parse(path, "aggregation declares no kind"))?;

    let mut subs = BTreeMap::new();
    if let Some(nested) = &body.aggs {
        for (name, sub) in nested {
            subs.insert(
                name.clone(),
                translate_agg(sub, meta, &format!("{}.aggs.{}", path, name))?,
            );
        }
    }
    Aggregation::with_subs(spec, subs)
}

fn require_numeric_agg_field(meta: &IndexMeta, field: &str, path: &str) -> Result<()> {
    require_agg_field(
        meta,
        field,
        path,
        &[FieldType::I64, FieldType::F64, FieldType::Date],
    )
}

fn require_agg_field(
    meta: &IndexMeta,
    field: &str,
    path: &str,
    allowed: &[FieldType],
) -> Result<()> {
    let mapping = meta
        .field(field)
        .ok_or_else(|| Error::parse(format!("{}.{}", path, field), "unknown field"))?;
    if !allowed.contains(&mapping.field_type) {
        return Err(Error::type_mismatch(
            format!("{}.{}", path, field),
            format!(
                "aggregation does not support {:?} fields",
                mapping.field_type
            ),
        ));
    }
    Ok(())
}

fn single_entry<'a, V>(map: &'a BTreeMap<String, V>, path: &str) -> Result<(&'a String, &'a V)> {
    if map.len() != 1 {
        return Err(Error::parse(
            path,
            format!("expected exactly one field, got {}", map.len()),
        ));
    }
    map.iter()
        .next()
        .ok_or_else(|| Error::parse(path, "expected exactly one field"))
}

fn mapped_field<'a>(meta: &'a IndexMeta, field: &str, path: &str) -> Result<&'a FieldMapping> {
    meta.field(field)
        .ok_or_else(|| Error::parse(format!("{}.{}", path, field), "unknown field"))
}

fn require_string_field(meta: &IndexMeta, field: &str, path: &str, clause: &str) -> Result<()> {
    let mapping = mapped_field(meta, field, path)?;
    match mapping.field_type {
        FieldType::Text | FieldType::Keyword => Ok(()),
        other => Err(Error::type_mismatch(
            format!("{}.{}", path, field),
            format!("{} requires a string field, found {:?}", clause, other),
        )),
    }
}

/// Edit-distance budget matching the usual AUTO ramp: short terms match
/// exactly, mid-length allow one edit, longer allow two.
pub fn auto_fuzziness(term: &str) -> u8 {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}
