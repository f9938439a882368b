//! Cluster-level errors. These cross RPC boundaries, so they serialize;
//! core-engine errors are mapped into the matching cluster kinds at the
//! node boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ClusterError {
    #[error("parse error at `{path}`: {reason}")]
    Parse { path: String, reason: String },

    #[error("type error at `{path}`: {reason}")]
    Type { path: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale write: expected version {expected}, state at {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    #[error("stale routing: planned against version {requested}, node knows {known}")]
    StaleRouting { requested: u64, known: u64 },

    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("deadline exceeded")]
    TimedOut,

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no leader elected")]
    NoLeader,

    #[error("not the leader; current leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Stable name for metrics labels and structured error responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Parse { .. } => "parse_error",
            ClusterError::Type { .. } => "type_error",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::StaleWrite { .. } => "conflict",
            ClusterError::StaleRouting { .. } => "stale_routing",
            ClusterError::ShardUnavailable(_) => "shard_unavailable",
            ClusterError::TimedOut => "timed_out",
            ClusterError::Overloaded(_) => "overloaded",
            ClusterError::Transport(_) => "transport",
            ClusterError::NoLeader => "no_leader",
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::Internal(_) => "internal",
        }
    }

    /// Whether the coordinator should refresh its routing cache and retry
    /// once against the corrected target.
    pub fn is_routing_stale(&self) -> bool {
        matches!(self, ClusterError::StaleRouting { .. })
    }
}

impl From<quidditch::Error> for ClusterError {
    fn from(err: quidditch::Error) -> Self {
        use quidditch::Error as E;
        match err {
            E::Parse { path, reason } => ClusterError::Parse { path, reason },
            E::Type { path, reason } => ClusterError::Type { path, reason },
            E::DeepPaginationExceeded { requested, limit } => ClusterError::Parse {
                path: "from".to_string(),
                reason: format!("from + size = {} exceeds max_from_plus_size = {}", requested, limit),
            },
            E::NotFound(what) => ClusterError::NotFound(what),
            E::Conflict(what) => ClusterError::Conflict(what),
            E::SchemaMismatch { field, reason } => ClusterError::Type {
                path: field,
                reason,
            },
            E::StaleRouting { requested, known } => {
                ClusterError::StaleRouting { requested, known }
            }
            E::ShardUnavailable(what) => ClusterError::ShardUnavailable(what),
            E::TimedOut => ClusterError::TimedOut,
            E::Overloaded(what) => ClusterError::Overloaded(what),
            other => ClusterError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Internal(format!("encoding error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let err: ClusterError = quidditch::Error::parse("query.title", "unknown field").into();
        assert!(matches!(err, ClusterError::Parse { .. }));
        assert_eq!(err.error_type(), "parse_error");

        let err: ClusterError = quidditch::Error::TimedOut.into();
        assert!(matches!(err, ClusterError::TimedOut));
    }

    #[test]
    fn test_serde_roundtrip() {
        let err = ClusterError::StaleRouting {
            requested: 3,
            known: 5,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: ClusterError = serde_json::from_str(&json).unwrap();
        assert!(back.is_routing_stale());
    }
}
