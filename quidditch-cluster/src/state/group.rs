//! The control group: a deterministic model of the replicated control
//! plane. One node is leader at a time; writes append to the leader's
//! log, replicate to alive peers, commit on quorum ack and apply to every
//! alive peer's state machine in log order. Election picks the alive node
//! with the most up-to-date log (ties broken by lowest id), so repeated
//! runs over the same history elect the same leader.
//!
//! Transports plug in around this type; the commit and recovery semantics
//! live here so they stay testable without sockets.

use super::command::ClusterCommand;
use super::fsm::{ClusterFsm, ClusterState, NodeId};
use super::log::{LogSnapshot, ReplicatedLog};
use crate::allocator;
use crate::config::ControlConfig;
use crate::error::{ClusterError, Result};
use crate::routing::{project_routing, RoutingTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use quidditch::schema::IndexMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

struct ControlNode {
    id: NodeId,
    log: ReplicatedLog,
    fsm: ClusterFsm,
    commit_index: u64,
    alive: bool,
}

pub struct ControlGroup {
    cluster_uuid: String,
    nodes: BTreeMap<NodeId, ControlNode>,
    leader: Option<NodeId>,
    term: u64,
    quorum: usize,
    snapshot_threshold_entries: u64,
    snapshot_threshold_bytes: u64,
}

impl ControlGroup {
    pub fn new(node_ids: &[&str], config: &ControlConfig) -> Self {
        let cluster_uuid = uuid::Uuid::new_v4().to_string();
        let nodes = node_ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    ControlNode {
                        id: id.to_string(),
                        log: ReplicatedLog::new(),
                        fsm: ClusterFsm::new(cluster_uuid.clone()),
                        commit_index: 0,
                        alive: true,
                    },
                )
            })
            .collect();
        let quorum = config
            .control_quorum_size
            .unwrap_or(node_ids.len() / 2 + 1);
        let mut group = Self {
            cluster_uuid,
            nodes,
            leader: None,
            term: 0,
            quorum,
            snapshot_threshold_entries: config.snapshot_threshold_entries,
            snapshot_threshold_bytes: config.snapshot_threshold_bytes,
        };
        let _ = group.elect();
        group
    }

    pub fn cluster_uuid(&self) -> &str {
        &self.cluster_uuid
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Elect a leader among alive peers: most up-to-date log wins, lowest
    /// id breaks ties. Fails when fewer than a quorum of peers is alive.
    pub fn elect(&mut self) -> Result<NodeId> {
        let alive: Vec<&ControlNode> = self.nodes.values().filter(|n| n.alive).collect();
        if alive.len() < self.quorum {
            self.leader = None;
            return Err(ClusterError::NoLeader);
        }
        let winner = alive
            .iter()
            .max_by(|a, b| {
                (a.log.last_term(), a.log.last_index())
                    .cmp(&(b.log.last_term(), b.log.last_index()))
                    // BTreeMap iteration is id-ascending; prefer the lowest
                    // id on equal logs by inverting the id comparison.
                    .then_with(|| b.id.cmp(&a.id))
            })
            .expect("alive checked nonempty")
            .id
            .clone();
        self.term += 1;
        self.leader = Some(winner.clone());
        info!(leader = %winner, term = self.term, "leader elected");
        Ok(winner)
    }

    /// Submit a command through the leader. Commits on quorum, applies on
    /// every alive peer, returns the new state version.
    pub fn submit(&mut self, command: ClusterCommand) -> Result<u64> {
        let leader_id = match &self.leader {
            Some(id) if self.nodes.get(id).map(|n| n.alive).unwrap_or(false) => id.clone(),
            _ => return Err(ClusterError::NoLeader),
        };
        let alive = self.nodes.values().filter(|n| n.alive).count();
        if alive < self.quorum {
            return Err(ClusterError::Internal(format!(
                "cannot commit: {} alive peers, quorum {}",
                alive, self.quorum
            )));
        }

        // Validate against the leader's state before appending; a command
        // that cannot apply never enters the log, so followers never see a
        // failing apply.
        {
            let leader = &self.nodes[&leader_id];
            let mut probe = leader.fsm.clone();
            probe.apply(&command)?;
        }

        let term = self.term;
        let mut version = 0;
        let index = {
            let leader = self.nodes.get_mut(&leader_id).expect("leader exists");
            leader.log.append(term, command.clone())
        };
        for node in self.nodes.values_mut() {
            if !node.alive {
                continue;
            }
            if node.id != leader_id {
                node.log.append(term, command.clone());
            }
            node.commit_index = index;
            version = node.fsm.apply(&command).expect("validated on leader");
        }
        debug!(kind = command.kind(), index, version, "command committed");
        self.maybe_snapshot();
        Ok(version)
    }

    /// Submit with `expected_version` stamped from the current leader
    /// state: the common path for leader-local callers that already hold
    /// the submission order.
    pub fn submit_current(&mut self, mut command: ClusterCommand) -> Result<u64> {
        let version = self.state()?.version;
        command.set_expected_version(version);
        self.submit(command)
    }

    /// Run the allocator over the current state and submit its diff.
    /// Returns the number of assignment changes committed.
    pub fn rebalance(&mut self) -> Result<usize> {
        let state = self.state()?.clone();
        let diff = allocator::plan(&state);
        let count = diff.len();
        for command in diff {
            self.submit(command)?;
        }
        Ok(count)
    }

    /// Leader state, linearizable for read-after-write.
    pub fn state(&self) -> Result<&ClusterState> {
        let leader_id = self.leader.as_ref().ok_or(ClusterError::NoLeader)?;
        let leader = self
            .nodes
            .get(leader_id)
            .filter(|n| n.alive)
            .ok_or(ClusterError::NoLeader)?;
        Ok(leader.fsm.state())
    }

    /// A specific peer's state; followers may trail the leader by the
    /// entries still in flight (bounded staleness), never interleave.
    pub fn state_of(&self, node_id: &str) -> Option<&ClusterState> {
        self.nodes
            .get(node_id)
            .filter(|n| n.alive)
            .map(|n| n.fsm.state())
    }

    pub fn kill(&mut self, node_id: &str) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.alive = false;
            info!(node = node_id, "control node killed");
        }
        if self.leader.as_deref() == Some(node_id) {
            self.leader = None;
        }
    }

    /// Restart a peer: rebuild its state machine from its own snapshot and
    /// log (crash recovery), then catch up from the current leader.
    pub fn restart(&mut self, node_id: &str) -> Result<()> {
        let leader_id = self.leader.clone();
        {
            let node = self
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::NotFound(format!("control node `{}`", node_id)))?;
            node.alive = true;
            let mut fsm = ClusterFsm::new(self.cluster_uuid.clone());
            if let Some(snapshot) = &node.log.snapshot {
                fsm.restore(&snapshot.state)?;
            }
            let commit_index = node.commit_index;
            for entry in node.log.entries_after(
                node.log.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0),
            ) {
                if entry.index > commit_index {
                    break;
                }
                fsm.apply(&entry.command)?;
            }
            node.fsm = fsm;
        }
        if let Some(leader_id) = leader_id {
            self.catch_up(node_id, &leader_id)?;
        }
        Ok(())
    }

    fn catch_up(&mut self, node_id: &str, leader_id: &str) -> Result<()> {
        if node_id == leader_id {
            return Ok(());
        }
        let (missing, leader_commit): (Vec<_>, u64) = {
            let follower_last = self.nodes[node_id].log.last_index();
            let leader = &self.nodes[leader_id];
            (
                leader
                    .log
                    .entries_after(follower_last)
                    .cloned()
                    .collect(),
                leader.commit_index,
            )
        };
        let node = self.nodes.get_mut(node_id).expect("checked above");
        for entry in missing {
            let index = entry.index;
            node.log.append(entry.term, entry.command.clone());
            if index <= leader_commit {
                node.commit_index = index;
                node.fsm.apply(&entry.command)?;
            }
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) {
        let threshold_entries = self.snapshot_threshold_entries;
        let threshold_bytes = self.snapshot_threshold_bytes;
        let term = self.term;
        for node in self.nodes.values_mut() {
            if !node.alive {
                continue;
            }
            if (node.log.len() as u64) < threshold_entries
                && node.log.byte_size() < threshold_bytes
            {
                continue;
            }
            if let Ok(state) = node.fsm.snapshot() {
                node.log.install_snapshot(LogSnapshot {
                    last_index: node.commit_index,
                    last_term: term,
                    state,
                });
                debug!(node = %node.id, upto = node.commit_index, "log snapshot taken");
            }
        }
    }
}

/// The coordinator's view of the control plane, kept behind a trait so a
/// remote (RPC-backed) control plane and the in-process group are
/// interchangeable.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn submit(&self, command: ClusterCommand) -> Result<u64>;
    /// Submit with `expected_version` stamped from current leader state.
    async fn submit_current(&self, command: ClusterCommand) -> Result<u64>;
    /// Run the allocator and commit its diff; returns changes committed.
    async fn rebalance(&self) -> Result<usize>;
    async fn routing_table(&self) -> Result<RoutingTable>;
    async fn index_meta(&self, index: &str) -> Result<(IndexMeta, u64)>;
    async fn cluster_state(&self) -> Result<ClusterState>;
}

/// In-process control plane handle.
pub struct LocalControlPlane {
    group: Arc<Mutex<ControlGroup>>,
}

impl LocalControlPlane {
    pub fn new(group: Arc<Mutex<ControlGroup>>) -> Self {
        Self { group }
    }

    pub fn group(&self) -> Arc<Mutex<ControlGroup>> {
        Arc::clone(&self.group)
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn submit(&self, command: ClusterCommand) -> Result<u64> {
        self.group.lock().submit(command)
    }

    async fn submit_current(&self, command: ClusterCommand) -> Result<u64> {
        self.group.lock().submit_current(command)
    }

    async fn rebalance(&self) -> Result<usize> {
        self.group.lock().rebalance()
    }

    async fn routing_table(&self) -> Result<RoutingTable> {
        let group = self.group.lock();
        Ok(project_routing(group.state()?))
    }

    async fn index_meta(&self, index: &str) -> Result<(IndexMeta, u64)> {
        let group = self.group.lock();
        let state = group.state()?;
        let meta = state
            .indices
            .get(index)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("index `{}`", index)))?;
        Ok((meta, state.version))
    }

    async fn cluster_state(&self) -> Result<ClusterState> {
        Ok(self.group.lock().state()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fsm::{NodeRecord, NodeRole, NodeStatus};

    fn config() -> ControlConfig {
        ControlConfig::default()
    }

    fn data_node(id: &str) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            address: format!("{}:9400", id),
            roles: [NodeRole::Data].into_iter().collect(),
            status: NodeStatus::Healthy,
            last_heartbeat_ms: 0,
            storage_tier: None,
        }
    }

    #[test]
    fn test_initial_election_is_deterministic() {
        let group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        // Equal (empty) logs: lowest id wins.
        assert_eq!(group.leader(), Some("c1"));
    }

    #[test]
    fn test_submit_replicates_to_all_peers() {
        let mut group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        group
            .submit_current(ClusterCommand::NodeJoin {
                expected_version: 0,
                node: data_node("d1"),
            })
            .unwrap();
        for peer in ["c1", "c2", "c3"] {
            let state = group.state_of(peer).unwrap();
            assert_eq!(state.version, 1);
            assert!(state.nodes.contains_key("d1"));
        }
    }

    #[test]
    fn test_failover_preserves_committed_state() {
        let mut group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        group
            .submit_current(ClusterCommand::NodeJoin {
                expected_version: 0,
                node: data_node("d1"),
            })
            .unwrap();
        let version_before = group.state().unwrap().version;
        let old_term = group.term();

        group.kill("c1");
        assert!(group.state().is_err());
        let new_leader = group.elect().unwrap();
        assert_ne!(new_leader, "c1");
        assert!(group.term() > old_term);

        // A write through the new leader commits and is visible on the
        // surviving peers, with strictly increasing version.
        let version = group
            .submit_current(ClusterCommand::NodeJoin {
                expected_version: 0, // overwritten by submit_current
                node: data_node("d2"),
            })
            .unwrap();
        assert!(version > version_before);
        for peer in ["c2", "c3"] {
            assert!(group.state_of(peer).unwrap().nodes.contains_key("d2"));
        }
    }

    #[test]
    fn test_no_quorum_no_leader() {
        let mut group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        group.kill("c2");
        group.kill("c3");
        assert!(matches!(group.elect(), Err(ClusterError::NoLeader)));
        assert!(matches!(
            group.submit_current(ClusterCommand::NodeJoin {
                expected_version: 0,
                node: data_node("d1"),
            }),
            Err(ClusterError::NoLeader)
        ));
    }

    #[test]
    fn test_restart_replays_to_identical_state() {
        let mut group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        for i in 0..5 {
            group
                .submit_current(ClusterCommand::NodeJoin {
                    expected_version: 0,
                    node: data_node(&format!("d{}", i)),
                })
                .unwrap();
        }
        let reference = group.state().unwrap().clone();

        group.kill("c3");
        // Two more writes while c3 is down.
        for i in 5..7 {
            group
                .submit_current(ClusterCommand::NodeJoin {
                    expected_version: 0,
                    node: data_node(&format!("d{}", i)),
                })
                .unwrap();
        }
        group.restart("c3").unwrap();
        let caught_up = group.state_of("c3").unwrap();
        assert_eq!(caught_up.version, reference.version + 2);
        assert_eq!(caught_up, group.state().unwrap());
    }

    #[test]
    fn test_snapshot_threshold_truncates_log() {
        let mut config = config();
        config.snapshot_threshold_entries = 3;
        let mut group = ControlGroup::new(&["c1"], &config);
        for i in 0..10 {
            group
                .submit_current(ClusterCommand::NodeJoin {
                    expected_version: 0,
                    node: data_node(&format!("d{}", i)),
                })
                .unwrap();
        }
        let node = &group.nodes["c1"];
        assert!(node.log.snapshot.is_some());
        assert!(node.log.len() < 10);
        // Restart from snapshot + tail reproduces the state.
        group.kill("c1");
        group.restart("c1").unwrap();
        group.elect().unwrap();
        assert_eq!(group.state().unwrap().nodes.len(), 10);
    }

    #[test]
    fn test_validation_failure_does_not_enter_log() {
        let mut group = ControlGroup::new(&["c1", "c2", "c3"], &config());
        let err = group
            .submit_current(ClusterCommand::NodeLeave {
                expected_version: 0,
                node_id: "ghost".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
        assert_eq!(group.state().unwrap().version, 0);
        assert!(group.nodes["c2"].log.is_empty());
    }
}
