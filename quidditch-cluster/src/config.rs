//! Cluster-plane configuration with serde defaults per field.

use serde::{Deserialize, Serialize};

/// Control-plane tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Quorum size override; defaults to a majority of the control peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_quorum_size: Option<usize>,

    /// Snapshot the FSM after this many live log entries.
    #[serde(default = "default_snapshot_entries")]
    pub snapshot_threshold_entries: u64,

    /// ... or after this many bytes of live log, whichever first.
    #[serde(default = "default_snapshot_bytes")]
    pub snapshot_threshold_bytes: u64,

    /// How often data nodes report in.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat silence after which a node counts as offline.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,
}

fn default_snapshot_entries() -> u64 {
    1000
}

fn default_snapshot_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_heartbeat_interval() -> u64 {
    3000
}

fn default_node_timeout() -> u64 {
    30_000
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            control_quorum_size: None,
            snapshot_threshold_entries: default_snapshot_entries(),
            snapshot_threshold_bytes: default_snapshot_bytes(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            node_timeout_ms: default_node_timeout(),
        }
    }
}

/// Query-coordination tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Default request deadline; a request body may override it downward.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cap on `from + size` for deep pagination.
    #[serde(default = "default_max_from_plus_size")]
    pub max_from_plus_size: usize,

    /// Concurrency cap on in-flight shard sub-requests per search.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_shard_requests: usize,

    /// Route reads to replicas when the primary is unavailable.
    #[serde(default = "default_true")]
    pub read_from_replicas: bool,

    /// Consult the plan cache for repeated requests.
    #[serde(default = "default_true")]
    pub request_cache_enabled: bool,

    /// Per-node concurrent search admission cap; excess is rejected, not
    /// queued.
    #[serde(default = "default_search_permits")]
    pub search_permits: usize,

    /// Per-node concurrent indexing admission cap.
    #[serde(default = "default_index_permits")]
    pub index_permits: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_from_plus_size() -> usize {
    10_000
}

fn default_max_concurrent() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_search_permits() -> usize {
    64
}

fn default_index_permits() -> usize {
    128
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_from_plus_size: default_max_from_plus_size(),
            max_concurrent_shard_requests: default_max_concurrent(),
            read_from_replicas: true,
            request_cache_enabled: true,
            search_permits: default_search_permits(),
            index_permits: default_index_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let control: ControlConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(control.snapshot_threshold_entries, 1000);
        assert_eq!(control.node_timeout_ms, 30_000);
        assert!(control.control_quorum_size.is_none());

        let coordinator: CoordinatorConfig =
            serde_json::from_value(serde_json::json!({"timeout_ms": 5000})).unwrap();
        assert_eq!(coordinator.timeout_ms, 5000);
        assert_eq!(coordinator.max_from_plus_size, 10_000);
        assert!(coordinator.read_from_replicas);
    }
}
