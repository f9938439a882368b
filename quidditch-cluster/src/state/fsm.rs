//! Cluster-state model and the deterministic state machine that applies
//! committed commands to it. Apply never consults wall-clock time, random
//! numbers or I/O; every timestamp and generated id arrives inside the
//! command itself, so replicas replay to identical state.

use super::command::ClusterCommand;
use crate::error::{ClusterError, Result};
use quidditch::schema::{IndexMeta, IndexState, PipelineBindings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Control,
    Coordinator,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Joining,
    Healthy,
    Degraded,
    Offline,
}

impl NodeStatus {
    /// Whether the allocator may place shards on this node.
    pub fn is_placeable(&self) -> bool {
        matches!(self, NodeStatus::Healthy | NodeStatus::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub roles: BTreeSet<NodeRole>,
    pub status: NodeStatus,
    /// Epoch millis of the last heartbeat, carried in by health commands.
    pub last_heartbeat_ms: i64,
    #[serde(default)]
    pub storage_tier: Option<String>,
}

impl NodeRecord {
    pub fn is_data(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub index: String,
    pub shard: u32,
}

impl ShardKey {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// `None` only while `state` is `Unassigned`.
    pub primary: Option<NodeId>,
    /// Replica order is assignment age, oldest first; promotion prefers
    /// the front.
    pub replicas: Vec<NodeId>,
    pub state: ShardState,
    /// Fencing token, regenerated on every (re)assignment.
    pub allocation_id: String,
}

impl ShardAssignment {
    pub fn unassigned() -> Self {
        Self {
            primary: None,
            replicas: Vec::new(),
            state: ShardState::Unassigned,
            allocation_id: String::new(),
        }
    }

    pub fn is_on_node(&self, node_id: &str) -> bool {
        self.primary.as_deref() == Some(node_id)
            || self.replicas.iter().any(|r| r == node_id)
    }
}

/// A patch for the mutable subset of index settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSettingsPatch {
    #[serde(default)]
    pub number_of_replicas: Option<u32>,
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Opaque cluster identity, fixed at bootstrap.
    pub cluster_uuid: String,
    /// Monotonic; increments by exactly one per applied command.
    pub version: u64,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub indices: BTreeMap<String, IndexMeta>,
    pub shards: BTreeMap<ShardKey, ShardAssignment>,
}

impl ClusterState {
    pub fn new(cluster_uuid: impl Into<String>) -> Self {
        Self {
            cluster_uuid: cluster_uuid.into(),
            version: 0,
            nodes: BTreeMap::new(),
            indices: BTreeMap::new(),
            shards: BTreeMap::new(),
        }
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().filter(|n| n.is_data())
    }

    pub fn shards_of<'a>(&'a self, index: &'a str) -> impl Iterator<Item = (&'a ShardKey, &'a ShardAssignment)> + 'a {
        self.shards.iter().filter(move |(k, _)| k.index == index)
    }

    /// Check the committed-state invariants. Called after every apply in
    /// debug builds and by tests.
    pub fn check_invariants(&self) -> Result<()> {
        for (key, assignment) in &self.shards {
            if !self.indices.contains_key(&key.index) {
                return Err(ClusterError::Internal(format!(
                    "shard {:?} belongs to no index",
                    key
                )));
            }
            match (&assignment.primary, assignment.state) {
                (None, ShardState::Unassigned) => {}
                (None, state) => {
                    return Err(ClusterError::Internal(format!(
                        "shard {:?} is {:?} without a primary",
                        key, state
                    )))
                }
                (Some(primary), _) => {
                    let node = self.nodes.get(primary).ok_or_else(|| {
                        ClusterError::Internal(format!(
                            "shard {:?} primary {} is not a known node",
                            key, primary
                        ))
                    })?;
                    if !node.is_data() {
                        return Err(ClusterError::Internal(format!(
                            "shard {:?} primary {} lacks the data role",
                            key, primary
                        )));
                    }
                    if assignment.replicas.iter().any(|r| r == primary) {
                        return Err(ClusterError::Internal(format!(
                            "shard {:?} replica co-resides with its primary",
                            key
                        )));
                    }
                    let distinct: BTreeSet<&NodeId> = assignment.replicas.iter().collect();
                    if distinct.len() != assignment.replicas.len() {
                        return Err(ClusterError::Internal(format!(
                            "shard {:?} lists a replica twice",
                            key
                        )));
                    }
                }
            }
        }
        for (name, meta) in &self.indices {
            let count = self.shards_of(name).count() as u32;
            if count != meta.settings.number_of_shards {
                return Err(ClusterError::Internal(format!(
                    "index {} has {} shard entries, expected {}",
                    name, count, meta.settings.number_of_shards
                )));
            }
        }
        Ok(())
    }
}

/// Deterministic application of cluster-mutation commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFsm {
    state: ClusterState,
}

impl ClusterFsm {
    pub fn new(cluster_uuid: impl Into<String>) -> Self {
        Self {
            state: ClusterState::new(cluster_uuid),
        }
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Apply one committed command. On success, `version` has advanced by
    /// exactly one. On error the state is untouched.
    pub fn apply(&mut self, command: &ClusterCommand) -> Result<u64> {
        let expected = command.expected_version();
        if expected != self.state.version {
            return Err(ClusterError::StaleWrite {
                expected,
                actual: self.state.version,
            });
        }
        self.apply_inner(command)?;
        self.state.version += 1;
        debug_assert!(self.state.check_invariants().is_ok());
        Ok(self.state.version)
    }

    fn apply_inner(&mut self, command: &ClusterCommand) -> Result<()> {
        match command {
            ClusterCommand::CreateIndex { name, meta, .. } => {
                if self.state.indices.contains_key(name) {
                    return Err(ClusterError::Conflict(format!(
                        "index `{}` already exists",
                        name
                    )));
                }
                if meta.settings.number_of_shards == 0 {
                    return Err(ClusterError::Conflict(
                        "number_of_shards must be at least 1".to_string(),
                    ));
                }
                let mut meta = meta.clone();
                meta.state = IndexState::Creating;
                for shard in 0..meta.settings.number_of_shards {
                    self.state
                        .shards
                        .insert(ShardKey::new(name.clone(), shard), ShardAssignment::unassigned());
                }
                self.state.indices.insert(name.clone(), meta);
            }

            ClusterCommand::DeleteIndex { name, .. } => {
                if self.state.indices.remove(name).is_none() {
                    return Err(ClusterError::NotFound(format!("index `{}`", name)));
                }
                self.state.shards.retain(|key, _| &key.index != name);
            }

            ClusterCommand::UpdateIndexSettings { name, patch, .. } => {
                let meta = self
                    .state
                    .indices
                    .get_mut(name)
                    .ok_or_else(|| ClusterError::NotFound(format!("index `{}`", name)))?;
                if let Some(replicas) = patch.number_of_replicas {
                    meta.settings.number_of_replicas = replicas;
                }
                if let Some(refresh) = patch.refresh_interval_ms {
                    meta.settings.refresh_interval_ms = refresh;
                }
                meta.bump_version();
            }

            ClusterCommand::UpdatePipelineBinding { name, bindings, .. } => {
                let meta = self
                    .state
                    .indices
                    .get_mut(name)
                    .ok_or_else(|| ClusterError::NotFound(format!("index `{}`", name)))?;
                meta.pipelines = bindings.clone();
                meta.bump_version();
            }

            ClusterCommand::NodeJoin { node, .. } => {
                // Rejoin after restart overwrites the stale record.
                self.state.nodes.insert(node.node_id.clone(), node.clone());
            }

            ClusterCommand::NodeLeave { node_id, .. } => {
                if self.state.nodes.remove(node_id).is_none() {
                    return Err(ClusterError::NotFound(format!("node `{}`", node_id)));
                }
                self.clear_node_references(node_id);
            }

            ClusterCommand::NodeHealthReport {
                node_id,
                status,
                observed_at_ms,
                ..
            } => {
                let node = self
                    .state
                    .nodes
                    .get_mut(node_id)
                    .ok_or_else(|| ClusterError::NotFound(format!("node `{}`", node_id)))?;
                node.status = *status;
                node.last_heartbeat_ms = *observed_at_ms;
                if *status == NodeStatus::Offline {
                    let node_id = node_id.clone();
                    self.demote_offline_primaries(&node_id);
                }
            }

            ClusterCommand::ShardAssignmentChange {
                key, assignment, ..
            } => {
                if !self.state.indices.contains_key(&key.index) {
                    return Err(ClusterError::NotFound(format!("index `{}`", key.index)));
                }
                self.validate_assignment(key, assignment)?;
                self.state.shards.insert(key.clone(), assignment.clone());
                self.maybe_activate_index(&key.index);
            }
        }
        Ok(())
    }

    fn validate_assignment(&self, key: &ShardKey, assignment: &ShardAssignment) -> Result<()> {
        match (&assignment.primary, assignment.state) {
            (None, ShardState::Unassigned) => Ok(()),
            (None, state) => Err(ClusterError::Conflict(format!(
                "shard {}/{} cannot be {:?} without a primary",
                key.index, key.shard, state
            ))),
            (Some(primary), _) => {
                let node = self.state.nodes.get(primary).ok_or_else(|| {
                    ClusterError::Conflict(format!("primary `{}` is not a known node", primary))
                })?;
                if !node.is_data() {
                    return Err(ClusterError::Conflict(format!(
                        "primary `{}` lacks the data role",
                        primary
                    )));
                }
                if assignment.replicas.iter().any(|r| r == primary) {
                    return Err(ClusterError::Conflict(
                        "replica co-resides with its primary".to_string(),
                    ));
                }
                let meta = self
                    .state
                    .indices
                    .get(&key.index)
                    .expect("index existence checked by caller");
                if assignment.replicas.len() as u32 > meta.settings.number_of_replicas {
                    return Err(ClusterError::Conflict(format!(
                        "{} replicas exceed replica_count {}",
                        assignment.replicas.len(),
                        meta.settings.number_of_replicas
                    )));
                }
                if assignment.allocation_id.is_empty() {
                    return Err(ClusterError::Conflict(
                        "assignment needs an allocation id".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// A node left the cluster: any shard copy it held disappears from the
    /// assignment table so the committed state never references an unknown
    /// node. The allocator repairs the holes on its next pass.
    fn clear_node_references(&mut self, node_id: &str) {
        for assignment in self.state.shards.values_mut() {
            if assignment.primary.as_deref() == Some(node_id) {
                assignment.primary = None;
                assignment.state = ShardState::Unassigned;
            }
            assignment.replicas.retain(|r| r != node_id);
        }
    }

    /// A node went offline but is still a member: its primaries become
    /// unassigned (pending replica promotion) and its replica slots empty.
    fn demote_offline_primaries(&mut self, node_id: &str) {
        for assignment in self.state.shards.values_mut() {
            if assignment.primary.as_deref() == Some(node_id) {
                assignment.primary = None;
                assignment.state = ShardState::Unassigned;
            }
            assignment.replicas.retain(|r| r != node_id);
        }
    }

    fn maybe_activate_index(&mut self, index: &str) {
        let all_started = self
            .state
            .shards
            .iter()
            .filter(|(key, _)| key.index == index)
            .all(|(_, a)| a.state == ShardState::Started);
        if let Some(meta) = self.state.indices.get_mut(index) {
            if meta.state == IndexState::Creating && all_started {
                meta.state = IndexState::Active;
            }
        }
    }

    /// Serialize the whole machine for a snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.state)?)
    }

    /// Replace state atomically from a snapshot.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.state = bincode::deserialize(bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quidditch::schema::{FieldMapping, IndexSettings};

    pub(crate) fn data_node(id: &str) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            address: format!("{}:9400", id),
            roles: [NodeRole::Data].into_iter().collect(),
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
            storage_tier: None,
        }
    }

    pub(crate) fn index_meta(shards: u32, replicas: u32) -> IndexMeta {
        let mut settings = IndexSettings::default();
        settings.number_of_shards = shards;
        settings.number_of_replicas = replicas;
        IndexMeta::new(
            settings,
            [("title".to_string(), FieldMapping::text())]
                .into_iter()
                .collect(),
        )
    }

    fn fsm_with_nodes(ids: &[&str]) -> ClusterFsm {
        let mut fsm = ClusterFsm::new("test-cluster");
        for id in ids {
            let version = fsm.state().version;
            fsm.apply(&ClusterCommand::NodeJoin {
                expected_version: version,
                node: data_node(id),
            })
            .unwrap();
        }
        fsm
    }

    #[test]
    fn test_version_increments_by_one() {
        let mut fsm = ClusterFsm::new("test");
        assert_eq!(fsm.state().version, 0);
        fsm.apply(&ClusterCommand::NodeJoin {
            expected_version: 0,
            node: data_node("n1"),
        })
        .unwrap();
        assert_eq!(fsm.state().version, 1);
    }

    #[test]
    fn test_stale_write_rejected() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        let err = fsm
            .apply(&ClusterCommand::NodeJoin {
                expected_version: 0,
                node: data_node("n2"),
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::StaleWrite { expected: 0, actual: 1 }));
        // State untouched.
        assert_eq!(fsm.state().version, 1);
        assert!(!fsm.state().nodes.contains_key("n2"));
    }

    #[test]
    fn test_create_index_populates_shards() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 1,
            name: "items".to_string(),
            meta: index_meta(3, 1),
        })
        .unwrap();
        assert_eq!(fsm.state().shards_of("items").count(), 3);
        assert!(fsm
            .state()
            .shards_of("items")
            .all(|(_, a)| a.state == ShardState::Unassigned));
        fsm.state().check_invariants().unwrap();
    }

    #[test]
    fn test_duplicate_create_is_conflict() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 1,
            name: "items".to_string(),
            meta: index_meta(1, 0),
        })
        .unwrap();
        let err = fsm
            .apply(&ClusterCommand::CreateIndex {
                expected_version: 2,
                name: "items".to_string(),
                meta: index_meta(1, 0),
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_assignment_validation() {
        let mut fsm = fsm_with_nodes(&["n1", "n2"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 2,
            name: "items".to_string(),
            meta: index_meta(1, 1),
        })
        .unwrap();

        // Replica on the primary node is rejected.
        let err = fsm
            .apply(&ClusterCommand::ShardAssignmentChange {
                expected_version: 3,
                key: ShardKey::new("items", 0),
                assignment: ShardAssignment {
                    primary: Some("n1".to_string()),
                    replicas: vec!["n1".to_string()],
                    state: ShardState::Started,
                    allocation_id: "alloc-1".to_string(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        // Valid assignment goes through and activates the index.
        fsm.apply(&ClusterCommand::ShardAssignmentChange {
            expected_version: 3,
            key: ShardKey::new("items", 0),
            assignment: ShardAssignment {
                primary: Some("n1".to_string()),
                replicas: vec!["n2".to_string()],
                state: ShardState::Started,
                allocation_id: "alloc-1".to_string(),
            },
        })
        .unwrap();
        assert_eq!(
            fsm.state().indices["items"].state,
            IndexState::Active
        );
        fsm.state().check_invariants().unwrap();
    }

    #[test]
    fn test_unknown_primary_rejected() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 1,
            name: "items".to_string(),
            meta: index_meta(1, 0),
        })
        .unwrap();
        let err = fsm
            .apply(&ClusterCommand::ShardAssignmentChange {
                expected_version: 2,
                key: ShardKey::new("items", 0),
                assignment: ShardAssignment {
                    primary: Some("ghost".to_string()),
                    replicas: Vec::new(),
                    state: ShardState::Started,
                    allocation_id: "alloc-1".to_string(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_node_leave_clears_references() {
        let mut fsm = fsm_with_nodes(&["n1", "n2"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 2,
            name: "items".to_string(),
            meta: index_meta(1, 1),
        })
        .unwrap();
        fsm.apply(&ClusterCommand::ShardAssignmentChange {
            expected_version: 3,
            key: ShardKey::new("items", 0),
            assignment: ShardAssignment {
                primary: Some("n1".to_string()),
                replicas: vec!["n2".to_string()],
                state: ShardState::Started,
                allocation_id: "alloc-1".to_string(),
            },
        })
        .unwrap();
        fsm.apply(&ClusterCommand::NodeLeave {
            expected_version: 4,
            node_id: "n1".to_string(),
        })
        .unwrap();
        let assignment = &fsm.state().shards[&ShardKey::new("items", 0)];
        assert_eq!(assignment.primary, None);
        assert_eq!(assignment.state, ShardState::Unassigned);
        assert_eq!(assignment.replicas, vec!["n2".to_string()]);
        fsm.state().check_invariants().unwrap();
    }

    #[test]
    fn test_snapshot_restore_identical() {
        let mut fsm = fsm_with_nodes(&["n1", "n2"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 2,
            name: "items".to_string(),
            meta: index_meta(2, 0),
        })
        .unwrap();
        let bytes = fsm.snapshot().unwrap();

        let mut restored = ClusterFsm::new("other");
        restored.restore(&bytes).unwrap();
        assert_eq!(restored.state(), fsm.state());
        // Byte-identical at the same version.
        assert_eq!(restored.snapshot().unwrap(), bytes);
    }

    #[test]
    fn test_settings_patch_bumps_mapping_version() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 1,
            name: "items".to_string(),
            meta: index_meta(1, 0),
        })
        .unwrap();
        let before = fsm.state().indices["items"].mapping_version;
        fsm.apply(&ClusterCommand::UpdateIndexSettings {
            expected_version: 2,
            name: "items".to_string(),
            patch: IndexSettingsPatch {
                number_of_replicas: Some(2),
                refresh_interval_ms: None,
            },
        })
        .unwrap();
        let meta = &fsm.state().indices["items"];
        assert_eq!(meta.settings.number_of_replicas, 2);
        assert_eq!(meta.mapping_version, before + 1);
    }

    #[test]
    fn test_pipeline_binding_update() {
        let mut fsm = fsm_with_nodes(&["n1"]);
        fsm.apply(&ClusterCommand::CreateIndex {
            expected_version: 1,
            name: "items".to_string(),
            meta: index_meta(1, 0),
        })
        .unwrap();
        fsm.apply(&ClusterCommand::UpdatePipelineBinding {
            expected_version: 2,
            name: "items".to_string(),
            bindings: PipelineBindings {
                query_pipeline: Some("boost-recent".to_string()),
                document_pipeline: None,
                result_pipeline: None,
            },
        })
        .unwrap();
        assert_eq!(
            fsm.state().indices["items"].pipelines.query_pipeline.as_deref(),
            Some("boost-recent")
        );
    }
}
