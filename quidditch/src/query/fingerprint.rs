//! Plan-cache keys: a stable digest over the normalized query shape plus
//! everything that can invalidate a plan (index, shard layout version,
//! mapping version).

use super::ast::QueryAst;
use crate::aggregations::Aggregation;
use crate::types::SortClause;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub fn plan_fingerprint(
    index: &str,
    ast: &QueryAst,
    sort: &[SortClause],
    aggs: &BTreeMap<String, Aggregation>,
    routing_version: u64,
    mapping_version: u64,
) -> String {
    let normalized = ast.normalize();
    let mut hasher = Sha256::new();
    hasher.update(index.as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(&normalized).unwrap_or_default());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(sort).unwrap_or_default());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(aggs).unwrap_or_default());
    hasher.update([0]);
    hasher.update(routing_version.to_be_bytes());
    hasher.update(mapping_version.to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(field: &str, value: &str) -> QueryAst {
        QueryAst::Term {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_equivalent_bools_share_fingerprint() {
        let a = QueryAst::Bool {
            must: vec![term("x", "1"), term("y", "2")],
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        };
        let b = QueryAst::Bool {
            must: vec![term("y", "2"), term("x", "1")],
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        };
        let empty = BTreeMap::new();
        let fa = plan_fingerprint("items", &a, &[], &empty, 3, 1);
        let fb = plan_fingerprint("items", &b, &[], &empty, 3, 1);
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_versions_change_fingerprint() {
        let empty = BTreeMap::new();
        let base = plan_fingerprint("items", &QueryAst::MatchAll, &[], &empty, 3, 1);
        assert_ne!(
            base,
            plan_fingerprint("items", &QueryAst::MatchAll, &[], &empty, 4, 1)
        );
        assert_ne!(
            base,
            plan_fingerprint("items", &QueryAst::MatchAll, &[], &empty, 3, 2)
        );
        assert_ne!(
            base,
            plan_fingerprint("other", &QueryAst::MatchAll, &[], &empty, 3, 1)
        );
    }
}
