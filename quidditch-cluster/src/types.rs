//! RPC request/response types for shard-level operations. Core types that
//! already serialize (documents, partial results, aggregation partials)
//! travel as-is; the envelopes here add routing metadata every shard RPC
//! carries: the `(index, shard_id)` target and the routing-table version
//! the request was planned against.

use quidditch::aggregations::Aggregation;
use quidditch::query::QueryAst;
use quidditch::types::{Document, SortClause};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchShardRequest {
    pub index: String,
    pub shard_id: u32,
    /// Routing version this request was planned against; receivers that
    /// know strictly newer, incompatible state reject with StaleRouting.
    pub routing_version: u64,
    pub ast: QueryAst,
    /// Serialized conjunctive filters (bincode `Vec<QueryAst>`), evaluated
    /// natively by the shard.
    pub pushed_filter: Vec<u8>,
    /// Per-shard top-k: the coordinator's `from + size`.
    pub from_plus_size: usize,
    pub sort: Vec<SortClause>,
    pub aggs: BTreeMap<String, Aggregation>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountShardRequest {
    pub index: String,
    pub shard_id: u32,
    pub routing_version: u64,
    pub ast: QueryAst,
    pub pushed_filter: Vec<u8>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexShardRequest {
    pub index: String,
    pub shard_id: u32,
    pub routing_version: u64,
    pub doc: Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetShardRequest {
    pub index: String,
    pub shard_id: u32,
    pub routing_version: u64,
    pub doc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteShardRequest {
    pub index: String,
    pub shard_id: u32,
    pub routing_version: u64,
    pub doc_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAckResult {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexAck {
    pub shard_id: u32,
    pub result: IndexAckResult,
}

/// Per-shard failure detail carried in search responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFailure {
    pub index: String,
    pub shard_id: u32,
    pub node: String,
    pub reason: String,
    pub error_type: String,
    pub is_timeout: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use quidditch::query::QueryAst;

    #[test]
    fn test_search_request_bincode_roundtrip() {
        let req = SearchShardRequest {
            index: "items".to_string(),
            shard_id: 2,
            routing_version: 14,
            ast: QueryAst::Term {
                field: "title".to_string(),
                value: "laptop".to_string(),
            },
            pushed_filter: bincode::serialize(&vec![QueryAst::MatchAll]).unwrap(),
            from_plus_size: 20,
            sort: Vec::new(),
            aggs: BTreeMap::new(),
            timeout_ms: 5000,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: SearchShardRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.index, "items");
        assert_eq!(back.routing_version, 14);
        let filters: Vec<QueryAst> = bincode::deserialize(&back.pushed_filter).unwrap();
        assert_eq!(filters, vec![QueryAst::MatchAll]);
    }
}
