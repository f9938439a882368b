//! The closed taxonomy of cluster mutations. Every command carries the
//! state version it expects to apply against; a mismatch fails the apply
//! with a stale-write conflict instead of clobbering newer state.

use super::fsm::{IndexSettingsPatch, NodeRecord, NodeStatus, ShardAssignment, ShardKey};
use quidditch::schema::{IndexMeta, PipelineBindings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCommand {
    CreateIndex {
        expected_version: u64,
        name: String,
        meta: IndexMeta,
    },
    DeleteIndex {
        expected_version: u64,
        name: String,
    },
    UpdateIndexSettings {
        expected_version: u64,
        name: String,
        patch: IndexSettingsPatch,
    },
    UpdatePipelineBinding {
        expected_version: u64,
        name: String,
        bindings: PipelineBindings,
    },
    NodeJoin {
        expected_version: u64,
        node: NodeRecord,
    },
    NodeLeave {
        expected_version: u64,
        node_id: String,
    },
    NodeHealthReport {
        expected_version: u64,
        node_id: String,
        status: NodeStatus,
        /// Timestamp observed by the reporter; applies never read clocks.
        observed_at_ms: i64,
    },
    ShardAssignmentChange {
        expected_version: u64,
        key: ShardKey,
        assignment: ShardAssignment,
    },
}

impl ClusterCommand {
    pub fn expected_version(&self) -> u64 {
        match self {
            ClusterCommand::CreateIndex {
                expected_version, ..
            }
            | ClusterCommand::DeleteIndex {
                expected_version, ..
            }
            | ClusterCommand::UpdateIndexSettings {
                expected_version, ..
            }
            | ClusterCommand::UpdatePipelineBinding {
                expected_version, ..
            }
            | ClusterCommand::NodeJoin {
                expected_version, ..
            }
            | ClusterCommand::NodeLeave {
                expected_version, ..
            }
            | ClusterCommand::NodeHealthReport {
                expected_version, ..
            }
            | ClusterCommand::ShardAssignmentChange {
                expected_version, ..
            } => *expected_version,
        }
    }

    pub(crate) fn set_expected_version(&mut self, version: u64) {
        match self {
            ClusterCommand::CreateIndex {
                expected_version, ..
            }
            | ClusterCommand::DeleteIndex {
                expected_version, ..
            }
            | ClusterCommand::UpdateIndexSettings {
                expected_version, ..
            }
            | ClusterCommand::UpdatePipelineBinding {
                expected_version, ..
            }
            | ClusterCommand::NodeJoin {
                expected_version, ..
            }
            | ClusterCommand::NodeLeave {
                expected_version, ..
            }
            | ClusterCommand::NodeHealthReport {
                expected_version, ..
            }
            | ClusterCommand::ShardAssignmentChange {
                expected_version, ..
            } => *expected_version = version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterCommand::CreateIndex { .. } => "create_index",
            ClusterCommand::DeleteIndex { .. } => "delete_index",
            ClusterCommand::UpdateIndexSettings { .. } => "update_index_settings",
            ClusterCommand::UpdatePipelineBinding { .. } => "update_pipeline_binding",
            ClusterCommand::NodeJoin { .. } => "node_join",
            ClusterCommand::NodeLeave { .. } => "node_leave",
            ClusterCommand::NodeHealthReport { .. } => "node_health_report",
            ClusterCommand::ShardAssignmentChange { .. } => "shard_assignment_change",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip() {
        let cmd = ClusterCommand::NodeLeave {
            expected_version: 7,
            node_id: "n1".to_string(),
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: ClusterCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.expected_version(), 7);
        assert_eq!(back.kind(), "node_leave");
    }
}
