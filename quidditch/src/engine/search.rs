//! Query evaluation against one segment: BM25 term scoring, boolean
//! algebra, phrase positions, doc-value ranges and the expanding clauses
//! (prefix, wildcard, fuzzy). Corpus statistics come from the snapshot so
//! scores are consistent across all of a shard's segments.

use super::postings::TermIterator;
use super::segment::{Column, Segment};
use super::snapshot::SegmentSnapshot;
use crate::analysis::Analyzer;
use crate::error::{Error, Result};
use crate::expr::ExprRegistry;
use crate::query::{QueryAst, RangeBounds};
use crate::schema::IndexMeta;
use crate::types::LocalDocId;

/// BM25 free parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scored {
    pub doc: LocalDocId,
    pub score: f32,
}

pub(crate) struct EvalContext<'a> {
    pub snapshot: &'a SegmentSnapshot,
    pub meta: &'a IndexMeta,
    pub params: Bm25Params,
    pub expr: Option<&'a ExprRegistry>,
}

impl<'a> EvalContext<'a> {
    fn total_docs(&self) -> u64 {
        self.snapshot.total_docs()
    }

    fn doc_freq(&self, field: &str, term: &str) -> u64 {
        self.snapshot
            .segments
            .iter()
            .filter_map(|seg| seg.postings(field, term))
            .map(|p| p.doc_freq() as u64)
            .sum()
    }

    fn avg_field_length(&self, field: &str) -> f32 {
        let total = self.total_docs();
        if total == 0 {
            return 0.0;
        }
        let tokens: u64 = self
            .snapshot
            .segments
            .iter()
            .map(|seg| seg.total_tokens(field))
            .sum();
        tokens as f32 / total as f32
    }

    fn idf(&self, field: &str, term: &str) -> f32 {
        let n = self.total_docs() as f32;
        let df = self.doc_freq(field, term) as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

/// Evaluate a query against one segment. Deleted docs are *not* filtered
/// here; callers intersect with liveness once per matched set.
pub(crate) fn evaluate(seg: &Segment, ast: &QueryAst, ctx: &EvalContext) -> Result<Vec<Scored>> {
    match ast {
        QueryAst::MatchAll => Ok((0..seg.doc_count())
            .map(|doc| Scored { doc, score: 1.0 })
            .collect()),

        QueryAst::Term { field, value } => Ok(term_scored(seg, field, value, ctx)),

        QueryAst::Match { field, text } => {
            let analyzer = field_analyzer(ctx.meta, field);
            let lists: Vec<Vec<Scored>> = analyzer
                .analyze(text)
                .iter()
                .map(|token| term_scored(seg, field, &token.term, ctx))
                .collect();
            Ok(union_sum(lists))
        }

        QueryAst::Phrase { field, text, slop } => {
            let analyzer = field_analyzer(ctx.meta, field);
            let terms: Vec<String> = analyzer.analyze(text).into_iter().map(|t| t.term).collect();
            match terms.len() {
                0 => Ok(Vec::new()),
                1 => Ok(term_scored(seg, field, &terms[0], ctx)),
                _ => phrase_scored(seg, field, &terms, *slop, ctx),
            }
        }

        QueryAst::Range { field, bounds } => range_matches(seg, field, bounds),

        QueryAst::Prefix { field, value } => {
            let terms: Vec<String> = seg
                .terms_with_prefix(field, value)
                .map(|(term, _)| term.clone())
                .collect();
            Ok(union_sum(
                terms
                    .iter()
                    .map(|term| term_scored(seg, field, term, ctx))
                    .collect(),
            ))
        }

        QueryAst::Wildcard { field, pattern } => {
            let regex = wildcard_regex(pattern)?;
            // A literal prefix prunes the dictionary scan; a leading
            // wildcard falls back to the full field dictionary.
            let literal_prefix: String = pattern
                .chars()
                .take_while(|c| *c != '*' && *c != '?')
                .collect();
            let terms: Vec<String> = if literal_prefix.is_empty() {
                seg.field_terms(field)
                    .filter(|(term, _)| regex.is_match(term))
                    .map(|(term, _)| term.clone())
                    .collect()
            } else {
                seg.terms_with_prefix(field, &literal_prefix)
                    .filter(|(term, _)| regex.is_match(term))
                    .map(|(term, _)| term.clone())
                    .collect()
            };
            Ok(union_sum(
                terms
                    .iter()
                    .map(|term| term_scored(seg, field, term, ctx))
                    .collect(),
            ))
        }

        QueryAst::Fuzzy {
            field,
            value,
            max_edits,
        } => {
            if *max_edits == 0 {
                return Ok(term_scored(seg, field, value, ctx));
            }
            let max = *max_edits as usize;
            let terms: Vec<String> = seg
                .field_terms(field)
                .filter(|(term, _)| {
                    term.chars().count().abs_diff(value.chars().count()) <= max
                        && levenshtein_within(value, term, max)
                })
                .map(|(term, _)| term.clone())
                .collect();
            Ok(union_sum(
                terms
                    .iter()
                    .map(|term| term_scored(seg, field, term, ctx))
                    .collect(),
            ))
        }

        QueryAst::Bool {
            must,
            should,
            must_not,
            filter,
            minimum_should_match,
        } => eval_bool(
            seg,
            must,
            should,
            must_not,
            filter,
            *minimum_should_match,
            ctx,
        ),

        QueryAst::UserDefined { module, payload } => {
            let registry = ctx.expr.ok_or_else(|| {
                Error::parse("query.user_defined", "no expression modules registered")
            })?;
            let mut matched = Vec::new();
            let empty = serde_json::Map::new();
            registry.with_evaluator(module, |evaluator| {
                for doc in 0..seg.doc_count() {
                    let source = seg.stored_fields(doc).unwrap_or(&empty);
                    if evaluator.matches(payload, source)? {
                        matched.push(Scored { doc, score: 1.0 });
                    }
                }
                Ok(())
            })?;
            Ok(matched)
        }
    }
}

fn field_analyzer(meta: &IndexMeta, field: &str) -> Analyzer {
    Analyzer::by_name(meta.field(field).and_then(|m| m.analyzer.as_deref()))
}

/// BM25-scored postings walk for one term. A fresh iterator per call.
fn term_scored(seg: &Segment, field: &str, term: &str, ctx: &EvalContext) -> Vec<Scored> {
    let Some(postings) = seg.postings(field, term) else {
        return Vec::new();
    };
    let idf = ctx.idf(field, term);
    let avg_len = ctx.avg_field_length(field);
    let Bm25Params { k1, b } = ctx.params;

    let mut out = Vec::with_capacity(postings.doc_freq() as usize);
    let mut it = TermIterator::new(postings);
    while let Some(doc) = it.doc() {
        let tf = it.term_freq() as f32;
        let len = seg.field_length(field, doc) as f32;
        let norm = if avg_len > 0.0 {
            1.0 - b + b * (len / avg_len)
        } else {
            1.0
        };
        let score = idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
        out.push(Scored { doc, score });
        it.advance();
    }
    out
}

/// Positional conjunction: all terms in order, each within `slop` extra
/// positions of its predecessor.
fn phrase_scored(
    seg: &Segment,
    field: &str,
    terms: &[String],
    slop: u32,
    ctx: &EvalContext,
) -> Result<Vec<Scored>> {
    let mut postings = Vec::with_capacity(terms.len());
    for term in terms {
        match seg.postings(field, term) {
            Some(p) => postings.push(p),
            None => return Ok(Vec::new()),
        }
    }
    let mut iters: Vec<TermIterator> = postings.iter().map(|p| TermIterator::new(p)).collect();

    let mut out = Vec::new();
    'outer: loop {
        // Align all iterators on one candidate doc.
        let mut target = match iters[0].doc() {
            Some(doc) => doc,
            None => break,
        };
        loop {
            let mut aligned = true;
            for it in iters.iter_mut() {
                match it.seek(target) {
                    Some(doc) if doc == target => {}
                    Some(doc) => {
                        target = doc;
                        aligned = false;
                        break;
                    }
                    None => break 'outer,
                }
            }
            if aligned {
                break;
            }
        }

        let position_lists: Vec<&[u32]> = iters
            .iter()
            .map(|it| it.positions().unwrap_or(&[]))
            .collect();
        if phrase_positions_match(&position_lists, slop) {
            let score: f32 = terms
                .iter()
                .map(|term| ctx.idf(field, term))
                .sum();
            out.push(Scored { doc: target, score });
        }
        if iters[0].advance().is_none() {
            break;
        }
    }
    Ok(out)
}

fn phrase_positions_match(lists: &[&[u32]], slop: u32) -> bool {
    'starts: for &start in lists[0] {
        let mut prev = start;
        for positions in &lists[1..] {
            // First position strictly after prev, within the slop window.
            let idx = positions.partition_point(|&p| p <= prev);
            match positions.get(idx) {
                Some(&p) if p <= prev + 1 + slop => prev = p,
                _ => continue 'starts,
            }
        }
        return true;
    }
    false
}

/// Doc-value range scan. The bounds' numeric kind must agree with the
/// column's kind; a mismatch is a type error, never a silent zero-hit scan.
fn range_matches(seg: &Segment, field: &str, bounds: &RangeBounds) -> Result<Vec<Scored>> {
    let Some(column) = seg.column(field) else {
        return Ok(Vec::new());
    };
    let matched: Vec<Scored> = match (column, bounds) {
        (Column::I64(values), RangeBounds::I64(range))
        | (Column::I64(values), RangeBounds::Date(range)) => values
            .iter()
            .enumerate()
            .filter_map(|(doc, v)| {
                v.filter(|v| range.contains(*v)).map(|_| Scored {
                    doc: doc as LocalDocId,
                    score: 1.0,
                })
            })
            .collect(),
        (Column::F64(values), RangeBounds::F64(range)) => values
            .iter()
            .enumerate()
            .filter_map(|(doc, v)| {
                // NaN never matches any range.
                v.filter(|v| !v.is_nan() && range.contains(*v)).map(|_| Scored {
                    doc: doc as LocalDocId,
                    score: 1.0,
                })
            })
            .collect(),
        (Column::I64(_), RangeBounds::F64(_)) => {
            return Err(Error::type_mismatch(
                field,
                "float-typed range bounds against an integer field",
            ))
        }
        (Column::F64(_), RangeBounds::I64(_)) | (Column::F64(_), RangeBounds::Date(_)) => {
            return Err(Error::type_mismatch(
                field,
                "integer-typed range bounds against a float field",
            ))
        }
        _ => {
            return Err(Error::type_mismatch(
                field,
                "range query against a non-numeric field",
            ))
        }
    };
    Ok(matched)
}

#[allow(clippy::too_many_arguments)]
fn eval_bool(
    seg: &Segment,
    must: &[QueryAst],
    should: &[QueryAst],
    must_not: &[QueryAst],
    filter: &[QueryAst],
    minimum_should_match: Option<u32>,
    ctx: &EvalContext,
) -> Result<Vec<Scored>> {
    let mut base: Option<Vec<Scored>> = None;
    for clause in must {
        let matched = evaluate(seg, clause, ctx)?;
        base = Some(match base {
            Some(current) => intersect_sum(&current, &matched),
            None => matched,
        });
    }
    for clause in filter {
        let matched = evaluate(seg, clause, ctx)?;
        base = Some(match base {
            Some(current) => intersect_left(&current, &matched),
            None => matched.into_iter().map(|s| Scored { score: 0.0, ..s }).collect(),
        });
    }

    let msm = minimum_should_match.unwrap_or(if base.is_none() && !should.is_empty() {
        1
    } else {
        0
    });

    let mut result = if !should.is_empty() {
        let mut lists = Vec::with_capacity(should.len());
        for clause in should {
            lists.push(evaluate(seg, clause, ctx)?);
        }
        let unioned = union_counted(lists);
        match base {
            Some(current) => {
                // Optional clauses add to the score of required matches.
                let mut merged = Vec::with_capacity(current.len());
                let mut i = 0;
                for hit in current {
                    while i < unioned.len() && unioned[i].0.doc < hit.doc {
                        i += 1;
                    }
                    let (extra, count) = if i < unioned.len() && unioned[i].0.doc == hit.doc {
                        (unioned[i].0.score, unioned[i].1)
                    } else {
                        (0.0, 0)
                    };
                    if count >= msm {
                        merged.push(Scored {
                            doc: hit.doc,
                            score: hit.score + extra,
                        });
                    }
                }
                merged
            }
            None => unioned
                .into_iter()
                .filter(|(_, count)| *count >= msm)
                .map(|(s, _)| s)
                .collect(),
        }
    } else {
        match base {
            Some(current) => current,
            // Pure-negation bool: everything is a candidate, filter context.
            None => (0..seg.doc_count())
                .map(|doc| Scored { doc, score: 0.0 })
                .collect(),
        }
    };

    if !must_not.is_empty() {
        let mut excluded = roaring::RoaringBitmap::new();
        for clause in must_not {
            for s in evaluate(seg, clause, ctx)? {
                excluded.insert(s.doc);
            }
        }
        result.retain(|s| !excluded.contains(s.doc));
    }
    Ok(result)
}

/// Union of doc-sorted lists, summing scores of shared docs.
pub(crate) fn union_sum(lists: Vec<Vec<Scored>>) -> Vec<Scored> {
    union_counted(lists).into_iter().map(|(s, _)| s).collect()
}

/// Union of doc-sorted lists, tracking how many lists contained each doc.
fn union_counted(lists: Vec<Vec<Scored>>) -> Vec<(Scored, u32)> {
    let mut merged: std::collections::BTreeMap<LocalDocId, (f32, u32)> = Default::default();
    for list in lists {
        for s in list {
            let entry = merged.entry(s.doc).or_insert((0.0, 0));
            entry.0 += s.score;
            entry.1 += 1;
        }
    }
    merged
        .into_iter()
        .map(|(doc, (score, count))| (Scored { doc, score }, count))
        .collect()
}

/// Intersection of two doc-sorted lists, summing scores.
pub(crate) fn intersect_sum(a: &[Scored], b: &[Scored]) -> Vec<Scored> {
    merge_intersect(a, b, |x, y| x + y)
}

/// Intersection keeping only the left side's scores (filter context).
pub(crate) fn intersect_left(a: &[Scored], b: &[Scored]) -> Vec<Scored> {
    merge_intersect(a, b, |x, _| x)
}

fn merge_intersect(a: &[Scored], b: &[Scored], combine: fn(f32, f32) -> f32) -> Vec<Scored> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].doc.cmp(&b[j].doc) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(Scored {
                    doc: a[i].doc,
                    score: combine(a[i].score, b[j].score),
                });
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn wildcard_regex(pattern: &str) -> Result<regex::Regex> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
        .map_err(|e| Error::parse("query.wildcard", format!("invalid pattern: {}", e)))
}

/// Bounded Levenshtein check without materializing the full matrix tail.
pub(crate) fn levenshtein_within(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return false;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j] + cost)
                .min(prev[j + 1] + 1)
                .min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > max {
            return false;
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()] <= max
}
