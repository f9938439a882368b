//! Shard transport: how a coordinator reaches shard-owning nodes. The
//! production implementation pools tarpc TCP clients per address; the
//! in-process implementation routes straight into local shard managers
//! and doubles as the single-process deployment path and the test
//! harness (including deterministic per-shard fault injection).

use crate::error::{ClusterError, Result};
use crate::metrics::RpcTimer;
use crate::service::QuidditchNodeClient;
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use quidditch::engine::ShardSearchRequest;
use quidditch::query::QueryAst;
use quidditch::schema::IndexMeta;
use quidditch::shards::ShardManager;
use quidditch::types::{Document, PartialSearchResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarpc::{client::Config as TarpcConfig, context};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Transport seam between the coordinator and shard-owning nodes.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn search(&self, addr: &str, req: SearchShardRequest)
        -> Result<PartialSearchResult>;
    async fn count(&self, addr: &str, req: CountShardRequest) -> Result<u64>;
    async fn index(&self, addr: &str, req: IndexShardRequest) -> Result<IndexAck>;
    async fn get(&self, addr: &str, req: GetShardRequest) -> Result<Option<Document>>;
    async fn delete(&self, addr: &str, req: DeleteShardRequest) -> Result<bool>;
    async fn create_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        meta: IndexMeta,
        routing_version: u64,
    ) -> Result<()>;
    async fn drop_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<bool>;
}

/// tarpc-over-TCP transport with per-address connection pooling.
pub struct ClusterClient {
    request_timeout: Duration,
    clients: Mutex<HashMap<String, QuidditchNodeClient>>,
}

impl ClusterClient {
    pub fn new(request_timeout_ms: u64) -> Self {
        Self {
            request_timeout: Duration::from_millis(request_timeout_ms),
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, addr: &str) -> Result<QuidditchNodeClient> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        debug!(%addr, "connecting to cluster node");
        // JSON framing: shard requests and documents carry arbitrary JSON
        // values, which need a self-describing wire format.
        let mut transport = tarpc::serde_transport::tcp::connect(
            addr,
            tarpc::tokio_serde::formats::Json::default,
        );
        transport.config_mut().max_frame_length(64 * 1024 * 1024);
        let transport = transport
            .await
            .map_err(|e| ClusterError::Transport(format!("connect {}: {}", addr, e)))?;
        let client = QuidditchNodeClient::new(TarpcConfig::default(), transport).spawn();
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    fn evict(&self, addr: &str) {
        if let Ok(mut clients) = self.clients.try_lock() {
            clients.remove(addr);
        }
    }

    fn context(&self, timeout_ms: Option<u64>) -> context::Context {
        let mut ctx = context::current();
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout);
        ctx.deadline = Instant::now() + timeout;
        ctx
    }

    fn rpc_error(&self, addr: &str, e: tarpc::client::RpcError) -> ClusterError {
        self.evict(addr);
        match e {
            tarpc::client::RpcError::DeadlineExceeded => ClusterError::TimedOut,
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl ShardTransport for ClusterClient {
    async fn search(
        &self,
        addr: &str,
        req: SearchShardRequest,
    ) -> Result<PartialSearchResult> {
        let timer = RpcTimer::new("search", addr);
        let client = self.client_for(addr).await?;
        let ctx = self.context(Some(req.timeout_ms));
        match client.search(ctx, req).await {
            Err(e) => {
                let err = self.rpc_error(addr, e);
                timer.error(err.error_type());
                Err(err)
            }
            Ok(Err(e)) => {
                timer.error(e.error_type());
                Err(e)
            }
            Ok(Ok(partial)) => {
                timer.success();
                Ok(partial)
            }
        }
    }

    async fn count(&self, addr: &str, req: CountShardRequest) -> Result<u64> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(Some(req.timeout_ms));
        match client.count(ctx, req).await {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }

    async fn index(&self, addr: &str, req: IndexShardRequest) -> Result<IndexAck> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(None);
        match client.index(ctx, req).await {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }

    async fn get(&self, addr: &str, req: GetShardRequest) -> Result<Option<Document>> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(None);
        match client.get(ctx, req).await {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }

    async fn delete(&self, addr: &str, req: DeleteShardRequest) -> Result<bool> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(None);
        match client.delete(ctx, req).await {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }

    async fn create_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        meta: IndexMeta,
        routing_version: u64,
    ) -> Result<()> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(None);
        match client
            .create_shard(ctx, index.to_string(), shard_id, meta, routing_version)
            .await
        {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }

    async fn drop_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<bool> {
        let client = self.client_for(addr).await?;
        let ctx = self.context(None);
        match client
            .drop_shard(ctx, index.to_string(), shard_id, routing_version)
            .await
        {
            Err(e) => Err(self.rpc_error(addr, e)),
            Ok(result) => result,
        }
    }
}

/// In-process transport: addresses resolve to local shard managers. Used
/// for single-process deployments and deterministic cluster tests; the
/// fencing and admission semantics mirror the network server.
#[derive(Default)]
pub struct LocalShardTransport {
    managers: RwLock<HashMap<String, Arc<ShardManager>>>,
    /// Shards whose searches deterministically fail, for fault-injection
    /// tests.
    failing_shards: RwLock<HashSet<(String, u32)>>,
}

impl LocalShardTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, addr: impl Into<String>, manager: Arc<ShardManager>) {
        self.managers.write().insert(addr.into(), manager);
    }

    pub fn fail_shard(&self, index: impl Into<String>, shard_id: u32) {
        self.failing_shards.write().insert((index.into(), shard_id));
    }

    pub fn heal_shard(&self, index: &str, shard_id: u32) {
        self.failing_shards
            .write()
            .remove(&(index.to_string(), shard_id));
    }

    fn manager(&self, addr: &str) -> Result<Arc<ShardManager>> {
        self.managers
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| ClusterError::Transport(format!("no node at {}", addr)))
    }

    fn resolve(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<Arc<quidditch::engine::ShardEngine>> {
        let manager = self.manager(addr)?;
        match manager.get(index, shard_id) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                let known = manager.state_version();
                if routing_version < known {
                    Err(ClusterError::StaleRouting {
                        requested: routing_version,
                        known,
                    })
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

#[async_trait]
impl ShardTransport for LocalShardTransport {
    async fn search(
        &self,
        addr: &str,
        req: SearchShardRequest,
    ) -> Result<PartialSearchResult> {
        if self
            .failing_shards
            .read()
            .contains(&(req.index.clone(), req.shard_id))
        {
            warn!(index = %req.index, shard = req.shard_id, "injected shard failure");
            return Err(ClusterError::Internal(
                "injected shard failure".to_string(),
            ));
        }
        let engine = self.resolve(addr, &req.index, req.shard_id, req.routing_version)?;
        let pushed_filters: Vec<QueryAst> = if req.pushed_filter.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(&req.pushed_filter)
                .map_err(|e| ClusterError::Internal(format!("invalid pushed-filter blob: {}", e)))?
        };
        let started = Instant::now();
        let shard_req = ShardSearchRequest {
            ast: req.ast,
            pushed_filters,
            from_plus_size: req.from_plus_size,
            sort: req.sort,
            aggs: req.aggs,
        };
        let result = engine.search(&shard_req).map_err(ClusterError::from);
        if started.elapsed() > Duration::from_millis(req.timeout_ms) {
            return Err(ClusterError::TimedOut);
        }
        result
    }

    async fn count(&self, addr: &str, req: CountShardRequest) -> Result<u64> {
        let engine = self.resolve(addr, &req.index, req.shard_id, req.routing_version)?;
        let pushed_filters: Vec<QueryAst> = if req.pushed_filter.is_empty() {
            Vec::new()
        } else {
            bincode::deserialize(&req.pushed_filter)
                .map_err(|e| ClusterError::Internal(format!("invalid pushed-filter blob: {}", e)))?
        };
        engine
            .count(&req.ast, &pushed_filters)
            .map_err(ClusterError::from)
    }

    async fn index(&self, addr: &str, req: IndexShardRequest) -> Result<IndexAck> {
        let engine = self.resolve(addr, &req.index, req.shard_id, req.routing_version)?;
        let existed = engine.get_document(&req.doc.id).ok().flatten().is_some();
        engine.index_document(&req.doc).map_err(ClusterError::from)?;
        Ok(IndexAck {
            shard_id: req.shard_id,
            result: if existed {
                IndexAckResult::Updated
            } else {
                IndexAckResult::Created
            },
        })
    }

    async fn get(&self, addr: &str, req: GetShardRequest) -> Result<Option<Document>> {
        let engine = self.resolve(addr, &req.index, req.shard_id, req.routing_version)?;
        engine.get_document(&req.doc_id).map_err(ClusterError::from)
    }

    async fn delete(&self, addr: &str, req: DeleteShardRequest) -> Result<bool> {
        let engine = self.resolve(addr, &req.index, req.shard_id, req.routing_version)?;
        engine
            .delete_document(&req.doc_id)
            .map_err(ClusterError::from)
    }

    async fn create_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        meta: IndexMeta,
        routing_version: u64,
    ) -> Result<()> {
        let manager = self.manager(addr)?;
        manager.observe_state_version(routing_version);
        manager
            .create_shard(index, shard_id, meta)
            .map(|_| ())
            .map_err(ClusterError::from)
    }

    async fn drop_shard(
        &self,
        addr: &str,
        index: &str,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<bool> {
        let manager = self.manager(addr)?;
        manager.observe_state_version(routing_version);
        manager.drop_shard(index, shard_id).map_err(ClusterError::from)
    }
}
