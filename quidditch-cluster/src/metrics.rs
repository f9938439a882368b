//! Metric names and recording helpers for the cluster plane. Everything
//! goes through the `metrics` facade; the server binary installs the
//! Prometheus recorder.

use metrics::{counter, histogram};
use std::time::Instant;

pub const RPC_CLIENT_REQUESTS: &str = "quidditch_rpc_client_requests_total";
pub const RPC_CLIENT_DURATION: &str = "quidditch_rpc_client_duration_seconds";
pub const RPC_HANDLER_REQUESTS: &str = "quidditch_rpc_handler_requests_total";
pub const RPC_HANDLER_DURATION: &str = "quidditch_rpc_handler_duration_seconds";
pub const SEARCH_SHARD_FAILURES: &str = "quidditch_search_shard_failures_total";
pub const PLAN_CACHE_HITS: &str = "quidditch_plan_cache_hits_total";
pub const PLAN_CACHE_MISSES: &str = "quidditch_plan_cache_misses_total";

/// Times one outbound RPC and records outcome-labelled counters.
pub struct RpcTimer {
    method: &'static str,
    addr: String,
    started: Instant,
}

impl RpcTimer {
    pub fn new(method: &'static str, addr: &str) -> Self {
        Self {
            method,
            addr: addr.to_string(),
            started: Instant::now(),
        }
    }

    pub fn success(self) {
        counter!(RPC_CLIENT_REQUESTS, "method" => self.method, "outcome" => "ok").increment(1);
        histogram!(RPC_CLIENT_DURATION, "method" => self.method)
            .record(self.started.elapsed().as_secs_f64());
    }

    pub fn error(self, error_type: &'static str) {
        counter!(
            RPC_CLIENT_REQUESTS,
            "method" => self.method,
            "outcome" => error_type
        )
        .increment(1);
        histogram!(RPC_CLIENT_DURATION, "method" => self.method)
            .record(self.started.elapsed().as_secs_f64());
        tracing::debug!(method = self.method, addr = %self.addr, error_type, "rpc failed");
    }
}

/// Times one inbound RPC handler invocation.
pub struct RpcHandlerTimer {
    method: &'static str,
    started: Instant,
}

impl RpcHandlerTimer {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            started: Instant::now(),
        }
    }

    pub fn success(self) {
        counter!(RPC_HANDLER_REQUESTS, "method" => self.method, "outcome" => "ok").increment(1);
        histogram!(RPC_HANDLER_DURATION, "method" => self.method)
            .record(self.started.elapsed().as_secs_f64());
    }

    pub fn error(self, error_type: &'static str) {
        counter!(
            RPC_HANDLER_REQUESTS,
            "method" => self.method,
            "outcome" => error_type
        )
        .increment(1);
        histogram!(RPC_HANDLER_DURATION, "method" => self.method)
            .record(self.started.elapsed().as_secs_f64());
    }
}

pub fn record_shard_failure(index: &str) {
    counter!(SEARCH_SHARD_FAILURES, "index" => index.to_string()).increment(1);
}

pub fn record_plan_cache(hit: bool) {
    if hit {
        counter!(PLAN_CACHE_HITS).increment(1);
    } else {
        counter!(PLAN_CACHE_MISSES).increment(1);
    }
}
