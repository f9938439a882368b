//! tarpc service definition for node-to-node RPC: the shard data plane
//! (search/count/index/get/delete), shard lifecycle commands from the
//! allocator, and heartbeats.

use crate::error::ClusterError;
use crate::types::*;
use quidditch::schema::IndexMeta;
use quidditch::shards::HeartbeatPayload;
use quidditch::types::{Document, PartialSearchResult};

#[tarpc::service]
pub trait QuidditchNode {
    // ========================================
    // Shard data plane
    // ========================================

    /// Execute one shard's slice of a search.
    async fn search(req: SearchShardRequest) -> Result<PartialSearchResult, ClusterError>;

    /// Count matching docs on one shard.
    async fn count(req: CountShardRequest) -> Result<u64, ClusterError>;

    /// Index a document into its owning shard (primary only).
    async fn index(req: IndexShardRequest) -> Result<IndexAck, ClusterError>;

    /// Fetch a stored document from its owning shard.
    async fn get(req: GetShardRequest) -> Result<Option<Document>, ClusterError>;

    /// Delete a document from its owning shard.
    async fn delete(req: DeleteShardRequest) -> Result<bool, ClusterError>;

    // ========================================
    // Shard lifecycle (allocator-driven)
    // ========================================

    /// Create a local shard for an assignment this node now owns.
    async fn create_shard(
        index: String,
        shard_id: u32,
        meta: IndexMeta,
        routing_version: u64,
    ) -> Result<(), ClusterError>;

    /// Drop a local shard and its on-disk data.
    async fn drop_shard(
        index: String,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<bool, ClusterError>;

    // ========================================
    // Health & discovery
    // ========================================

    /// Current shard inventory with doc counts and byte sizes.
    async fn heartbeat() -> HeartbeatPayload;

    /// Liveness probe.
    async fn ping() -> String;
}
