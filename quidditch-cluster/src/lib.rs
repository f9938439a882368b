//! Quidditch cluster plane: the replicated control plane (consensus state
//! machine + allocator + routing projection), the query coordinator
//! (parallel shard fan-out with deterministic merge), and the tarpc RPC
//! surface between nodes.
//!
//! # Architecture
//!
//! - **State**: command log under quorum commit; deterministic FSM owns
//!   the authoritative cluster state
//! - **Allocator**: pure function from state to a placement diff
//! - **Routing**: versioned read-only projection served to coordinators
//! - **Coordinator**: DSL parse → plan cache → fan-out → merge
//! - **Service/Server/Client**: tarpc over TCP between nodes

pub mod allocator;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod service;
pub mod state;
pub mod types;

pub use client::{ClusterClient, LocalShardTransport, ShardTransport};
pub use config::{ControlConfig, CoordinatorConfig};
pub use coordinator::{Coordinator, SearchResponse};
pub use error::{ClusterError, Result};
pub use health::{HealthTracker, HealthTransition};
pub use routing::{project_routing, shard_for_doc, RoutingCache, RoutingTable, ShardRoute};
pub use server::NodeServer;
pub use state::{
    ClusterCommand, ClusterFsm, ClusterState, ControlGroup, ControlPlane, LocalControlPlane,
    NodeRecord, NodeRole, NodeStatus, ShardAssignment, ShardKey, ShardState,
};
pub use types::*;
