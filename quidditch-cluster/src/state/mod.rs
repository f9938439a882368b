//! The replicated control plane: cluster-state model, command taxonomy,
//! deterministic state machine, term-tagged log and the control group that
//! ties them together under quorum commit.

pub mod command;
pub mod fsm;
pub mod group;
pub mod log;

pub use command::ClusterCommand;
pub use fsm::{
    ClusterFsm, ClusterState, IndexSettingsPatch, NodeId, NodeRecord, NodeRole, NodeStatus,
    ShardAssignment, ShardKey, ShardState,
};
pub use group::{ControlGroup, ControlPlane, LocalControlPlane};
pub use log::{LogEntry, LogSnapshot, ReplicatedLog};
