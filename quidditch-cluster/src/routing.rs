//! Routing-table projection: the query-friendly read-only view of shard
//! placement, derived from committed cluster state and cached (with
//! monotonic versions) on every coordinator.

use crate::state::{ClusterState, NodeId, ShardKey, ShardState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRoute {
    pub primary: Option<NodeId>,
    pub replicas: Vec<NodeId>,
    pub state: ShardState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// The cluster-state version this projection was derived from.
    pub version: u64,
    pub entries: BTreeMap<ShardKey, ShardRoute>,
    /// node_id -> RPC address, for dialing shard owners.
    pub node_addresses: BTreeMap<NodeId, String>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            version: 0,
            entries: BTreeMap::new(),
            node_addresses: BTreeMap::new(),
        }
    }

    pub fn route(&self, index: &str, shard: u32) -> Option<&ShardRoute> {
        self.entries.get(&ShardKey::new(index, shard))
    }

    pub fn shards_of<'a>(
        &'a self,
        index: &'a str,
    ) -> impl Iterator<Item = (&'a ShardKey, &'a ShardRoute)> {
        self.entries.iter().filter(move |(k, _)| k.index == index)
    }

    pub fn shard_count(&self, index: &str) -> u32 {
        self.shards_of(index).count() as u32
    }

    pub fn address_of(&self, node: &str) -> Option<&str> {
        self.node_addresses.get(node).map(|s| s.as_str())
    }
}

/// Derive the routing view from committed cluster state.
pub fn project_routing(state: &ClusterState) -> RoutingTable {
    let entries = state
        .shards
        .iter()
        .map(|(key, assignment)| {
            (
                key.clone(),
                ShardRoute {
                    primary: assignment.primary.clone(),
                    replicas: assignment.replicas.clone(),
                    state: assignment.state,
                },
            )
        })
        .collect();
    let node_addresses = state
        .nodes
        .iter()
        .map(|(id, record)| (id.clone(), record.address.clone()))
        .collect();
    RoutingTable {
        version: state.version,
        entries,
        node_addresses,
    }
}

/// Coordinator-side routing cache. Updates are monotonic: an older
/// projection can never replace a newer one, so a coordinator observes
/// routing versions in non-decreasing order.
pub struct RoutingCache {
    inner: RwLock<Arc<RoutingTable>>,
}

impl Default for RoutingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(RoutingTable::empty())),
        }
    }

    pub fn get(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.inner.read())
    }

    /// Install a newer projection; returns whether it replaced the cached
    /// one.
    pub fn update(&self, table: RoutingTable) -> bool {
        let mut inner = self.inner.write();
        if table.version >= inner.version {
            *inner = Arc::new(table);
            true
        } else {
            false
        }
    }
}

/// Consistent document routing: a user doc id lives on exactly one shard.
/// The hash is sha2-based so every node, architecture and build routes
/// identically.
pub fn shard_for_doc(doc_id: &str, shard_count: u32) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % shard_count.max(1) as u64) as u32
}
