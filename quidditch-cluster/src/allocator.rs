//! Shard allocator: a pure, deterministic function from committed cluster
//! state to a diff of `shard_assignment_change` commands. Two phases:
//! repair (assign primaries, promote replicas of lost nodes, top up
//! replica sets) and balance (shift copies from overloaded to underloaded
//! nodes of the same tier until counts differ by at most one).
//!
//! Determinism rules: iterate only ordered collections, break every tie by
//! node id or shard key, and derive fencing tokens from the input state
//! rather than random ids. Running the planner twice over the same state
//! yields the same diff; running it over its own output yields nothing.

use crate::state::{
    ClusterCommand, ClusterState, NodeId, ShardAssignment, ShardKey, ShardState,
};
use std::collections::BTreeMap;

/// Compute the assignment diff for the current state. Commands carry
/// consecutive expected versions so they apply as one ordered batch.
pub fn plan(state: &ClusterState) -> Vec<ClusterCommand> {
    let mut planner = Planner::new(state);
    planner.repair();
    planner.balance();
    planner.into_commands(state.version)
}

struct Planner<'a> {
    state: &'a ClusterState,
    /// Working view of assignments, including planned changes.
    assignments: BTreeMap<ShardKey, ShardAssignment>,
    /// Copies per placeable node, kept current while planning.
    loads: BTreeMap<NodeId, usize>,
    changed: Vec<ShardKey>,
}

impl<'a> Planner<'a> {
    fn new(state: &'a ClusterState) -> Self {
        let mut loads: BTreeMap<NodeId, usize> = state
            .nodes
            .values()
            .filter(|n| n.is_data() && n.status.is_placeable())
            .map(|n| (n.node_id.clone(), 0))
            .collect();
        for assignment in state.shards.values() {
            if let Some(primary) = &assignment.primary {
                if let Some(load) = loads.get_mut(primary) {
                    *load += 1;
                }
            }
            for replica in &assignment.replicas {
                if let Some(load) = loads.get_mut(replica) {
                    *load += 1;
                }
            }
        }
        Self {
            state,
            assignments: state.shards.clone(),
            loads,
            changed: Vec::new(),
        }
    }

    /// Nodes a shard of `index` may live on: placeable data nodes whose
    /// declared tier matches the index's declared tier. When the index
    /// declares a tier no node offers, every placeable node is eligible so
    /// availability beats tier affinity.
    fn eligible_nodes(&self, index: &str) -> Vec<NodeId> {
        let want_tier = self
            .state
            .indices
            .get(index)
            .and_then(|m| m.settings.storage_tier.clone());
        let all: Vec<NodeId> = self.loads.keys().cloned().collect();
        match want_tier {
            None => all,
            Some(tier) => {
                let matching: Vec<NodeId> = all
                    .iter()
                    .filter(|id| {
                        self.state
                            .nodes
                            .get(*id)
                            .and_then(|n| n.storage_tier.as_deref())
                            == Some(tier.as_str())
                    })
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    all
                } else {
                    matching
                }
            }
        }
    }

    fn least_loaded(&self, candidates: &[NodeId], exclude: &[&str]) -> Option<NodeId> {
        candidates
            .iter()
            .filter(|id| !exclude.contains(&id.as_str()))
            .min_by_key(|id| (self.loads.get(*id).copied().unwrap_or(usize::MAX), (*id).clone()))
            .cloned()
    }

    fn mark_changed(&mut self, key: &ShardKey) {
        if !self.changed.contains(key) {
            self.changed.push(key.clone());
        }
    }

    fn repair(&mut self) {
        let keys: Vec<ShardKey> = self.assignments.keys().cloned().collect();
        for key in keys {
            let Some(meta) = self.state.indices.get(&key.index) else {
                continue;
            };
            let replica_count = meta.settings.number_of_replicas as usize;
            let eligible = self.eligible_nodes(&key.index);
            let mut assignment = self.assignments[&key].clone();
            let mut touched = false;

            // Drop copies on nodes no longer placeable or eligible.
            let before_replicas = assignment.replicas.len();
            assignment.replicas.retain(|r| eligible.contains(r));
            if assignment.replicas.len() != before_replicas {
                touched = true;
            }
            if let Some(primary) = assignment.primary.clone() {
                if !eligible.contains(&primary) {
                    if let Some(load) = self.loads.get_mut(&primary) {
                        *load = load.saturating_sub(1);
                    }
                    assignment.primary = None;
                    assignment.state = ShardState::Unassigned;
                    touched = true;
                }
            }

            // Primary repair: promote the longest-assigned eligible replica
            // before placing a fresh copy.
            if assignment.primary.is_none() {
                if let Some(promoted) = assignment
                    .replicas
                    .iter()
                    .find(|r| eligible.contains(*r))
                    .cloned()
                {
                    assignment.replicas.retain(|r| r != &promoted);
                    assignment.primary = Some(promoted);
                    assignment.state = ShardState::Started;
                    touched = true;
                } else {
                    let exclude: Vec<&str> =
                        assignment.replicas.iter().map(|s| s.as_str()).collect();
                    if let Some(node) = self.least_loaded(&eligible, &exclude) {
                        *self.loads.entry(node.clone()).or_insert(0) += 1;
                        assignment.primary = Some(node);
                        assignment.state = ShardState::Started;
                        touched = true;
                    }
                }
            }

            // Replica top-up, one distinct node per copy.
            while assignment.primary.is_some() && assignment.replicas.len() < replica_count {
                let mut exclude: Vec<&str> =
                    assignment.replicas.iter().map(|s| s.as_str()).collect();
                if let Some(primary) = &assignment.primary {
                    exclude.push(primary.as_str());
                }
                match self.least_loaded(&eligible, &exclude) {
                    Some(node) => {
                        *self.loads.entry(node.clone()).or_insert(0) += 1;
                        assignment.replicas.push(node);
                        touched = true;
                    }
                    None => break,
                }
            }

            if touched {
                self.assignments.insert(key.clone(), assignment);
                self.mark_changed(&key);
            }
        }
    }

    fn balance(&mut self) {
        // Group placeable nodes by declared tier; balance within a group.
        let mut groups: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for id in self.loads.keys() {
            let tier = self
                .state
                .nodes
                .get(id)
                .and_then(|n| n.storage_tier.clone())
                .unwrap_or_default();
            groups.entry(tier).or_default().push(id.clone());
        }

        for (_, members) in groups {
            if members.len() < 2 {
                continue;
            }
            // Bounded by total copies; each move strictly narrows the gap.
            for _ in 0..self.assignments.len() * 2 {
                let busiest = members
                    .iter()
                    .max_by_key(|id| (self.loads[*id], std::cmp::Reverse((*id).clone())))
                    .expect("nonempty group")
                    .clone();
                let idlest = members
                    .iter()
                    .min_by_key(|id| (self.loads[*id], (*id).clone()))
                    .expect("nonempty group")
                    .clone();
                if self.loads[&busiest] - self.loads[&idlest] < 2 {
                    break;
                }
                if !self.move_one_copy(&busiest, &idlest) {
                    break;
                }
            }
        }
    }

    /// Move one shard copy from `from` to `to`. Replica copies move first;
    /// a primary moves only when the shard has no replica on `from`.
    /// Returns whether a legal move was found.
    fn move_one_copy(&mut self, from: &str, to: &str) -> bool {
        let keys: Vec<ShardKey> = self.assignments.keys().cloned().collect();

        for key in &keys {
            let assignment = &self.assignments[key];
            if !assignment.replicas.iter().any(|r| r == from) || assignment.is_on_node(to) {
                continue;
            }
            if !self.eligible_nodes(&key.index).iter().any(|n| n == to) {
                continue;
            }
            let mut next = assignment.clone();
            for replica in next.replicas.iter_mut() {
                if replica == from {
                    *replica = to.to_string();
                    break;
                }
            }
            self.apply_move(key.clone(), next, from, to);
            return true;
        }

        for key in &keys {
            let assignment = &self.assignments[key];
            if assignment.primary.as_deref() != Some(from) || assignment.is_on_node(to) {
                continue;
            }
            if !self.eligible_nodes(&key.index).iter().any(|n| n == to) {
                continue;
            }
            let mut next = assignment.clone();
            next.primary = Some(to.to_string());
            self.apply_move(key.clone(), next, from, to);
            return true;
        }

        false
    }

    fn apply_move(&mut self, key: ShardKey, next: ShardAssignment, from: &str, to: &str) {
        if let Some(load) = self.loads.get_mut(from) {
            *load -= 1;
        }
        *self.loads.entry(to.to_string()).or_insert(0) += 1;
        self.assignments.insert(key.clone(), next);
        self.mark_changed(&key);
    }

    fn into_commands(mut self, base_version: u64) -> Vec<ClusterCommand> {
        self.changed.sort();
        self.changed.dedup();
        self.changed
            .iter()
            .enumerate()
            .filter_map(|(i, key)| {
                let mut assignment = self.assignments.get(key)?.clone();
                if assignment != self.state.shards[key] {
                    // Fencing token derived from the planning inputs, so
                    // identical runs emit identical diffs.
                    assignment.allocation_id =
                        format!("{}-{}-v{}", key.index, key.shard, base_version);
                    Some(ClusterCommand::ShardAssignmentChange {
                        expected_version: base_version + i as u64,
                        key: key.clone(),
                        assignment,
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}
