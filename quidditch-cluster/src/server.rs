//! Data-node RPC server: dispatches shard RPCs to the local shard
//! manager, fences requests planned against routing state this node has
//! already moved past, and applies admission control so overload rejects
//! instead of queueing unboundedly.

use crate::error::ClusterError;
use crate::metrics::RpcHandlerTimer;
use crate::service::QuidditchNode;
use crate::types::*;
use futures::StreamExt;
use quidditch::engine::ShardSearchRequest;
use quidditch::query::QueryAst;
use quidditch::schema::IndexMeta;
use quidditch::shards::{HeartbeatPayload, ShardManager};
use quidditch::types::{Document, PartialSearchResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct NodeServer {
    inner: Arc<NodeServerInner>,
}

struct NodeServerInner {
    manager: Arc<ShardManager>,
    search_permits: Semaphore,
    index_permits: Semaphore,
}

impl NodeServer {
    pub fn new(manager: Arc<ShardManager>, search_permits: usize, index_permits: usize) -> Self {
        Self {
            inner: Arc::new(NodeServerInner {
                manager,
                search_permits: Semaphore::new(search_permits),
                index_permits: Semaphore::new(index_permits),
            }),
        }
    }

    pub fn manager(&self) -> Arc<ShardManager> {
        Arc::clone(&self.inner.manager)
    }

    /// Listen for tarpc connections on `addr` until the task is aborted.
    pub async fn run(self, addr: SocketAddr) -> crate::error::Result<()> {
        let mut listener = tarpc::serde_transport::tcp::listen(
            addr,
            tarpc::tokio_serde::formats::Json::default,
        )
        .await
        .map_err(|e| ClusterError::Transport(format!("listen on {}: {}", addr, e)))?;
        listener.config_mut().max_frame_length(64 * 1024 * 1024);
        info!(node = %self.inner.manager.node_id(), %addr, "node RPC server listening");

        listener
            .filter_map(|accepted| async move { accepted.ok() })
            .for_each_concurrent(None, |transport| {
                let server = self.clone();
                async move {
                    BaseChannel::with_defaults(transport)
                        .execute(QuidditchNode::serve(server))
                        .for_each(|response| async move {
                            tokio::spawn(response);
                        })
                        .await;
                }
            })
            .await;
        Ok(())
    }

    /// Fence a shard request: if the shard is not local and the request
    /// was planned against older routing than this node has observed, the
    /// coordinator's table is stale.
    fn resolve_shard(
        &self,
        index: &str,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<Arc<quidditch::engine::ShardEngine>, ClusterError> {
        match self.inner.manager.get(index, shard_id) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                let known = self.inner.manager.state_version();
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

    fn decode_filters(blob: &[u8]) -> Result<Vec<QueryAst>, ClusterError> {
        if blob.is_empty() {
            return Ok(Vec::new());
        }
        bincode::deserialize(blob)
            .map_err(|e| ClusterError::Internal(format!("invalid pushed-filter blob: {}", e)))
    }
}

impl QuidditchNode for NodeServer {
    async fn search(
        self,
        _ctx: Context,
        req: SearchShardRequest,
    ) -> Result<PartialSearchResult, ClusterError> {
        let timer = RpcHandlerTimer::new("search");
        let Ok(_permit) = self.inner.search_permits.try_acquire() else {
            let err = ClusterError::Overloaded("search concurrency cap reached".to_string());
            timer.error(err.error_type());
            return Err(err);
        };
        let engine = self.resolve_shard(&req.index, req.shard_id, req.routing_version)?;
        let shard_req = ShardSearchRequest {
            ast: req.ast,
            pushed_filters: Self::decode_filters(&req.pushed_filter)?,
            from_plus_size: req.from_plus_size,
            sort: req.sort,
            aggs: req.aggs,
        };
        let deadline = std::time::Duration::from_millis(req.timeout_ms.max(1));
        let result = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || engine.search(&shard_req)),
        )
        .await;
        match result {
            Err(_) => {
                timer.error("timed_out");
                Err(ClusterError::TimedOut)
            }
            Ok(Err(join_err)) => {
                let err = ClusterError::Internal(format!("search task failed: {}", join_err));
                timer.error(err.error_type());
                Err(err)
            }
            Ok(Ok(Err(e))) => {
                let err = ClusterError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
            Ok(Ok(Ok(partial))) => {
                timer.success();
                Ok(partial)
            }
        }
    }

    async fn count(self, _ctx: Context, req: CountShardRequest) -> Result<u64, ClusterError> {
        let timer = RpcHandlerTimer::new("count");
        let engine = self.resolve_shard(&req.index, req.shard_id, req.routing_version)?;
        let filters = Self::decode_filters(&req.pushed_filter)?;
        match engine.count(&req.ast, &filters) {
            Ok(count) => {
                timer.success();
                Ok(count)
            }
            Err(e) => {
                let err = ClusterError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }

    async fn index(self, _ctx: Context, req: IndexShardRequest) -> Result<IndexAck, ClusterError> {
        let timer = RpcHandlerTimer::new("index");
        let Ok(_permit) = self.inner.index_permits.try_acquire() else {
            let err = ClusterError::Overloaded("indexing concurrency cap reached".to_string());
            timer.error(err.error_type());
            return Err(err);
        };
        let engine = self.resolve_shard(&req.index, req.shard_id, req.routing_version)?;
        let existed = match engine.get_document(&req.doc.id) {
            Ok(existing) => existing.is_some(),
            Err(_) => false,
        };
        match engine.index_document(&req.doc) {
            Ok(()) => {
                timer.success();
                Ok(IndexAck {
                    shard_id: req.shard_id,
                    result: if existed {
                        IndexAckResult::Updated
                    } else {
                        IndexAckResult::Created
                    },
                })
            }
            Err(e) => {
                let err = ClusterError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }

    async fn get(
        self,
        _ctx: Context,
        req: GetShardRequest,
    ) -> Result<Option<Document>, ClusterError> {
        let timer = RpcHandlerTimer::new("get");
        let engine = self.resolve_shard(&req.index, req.shard_id, req.routing_version)?;
        match engine.get_document(&req.doc_id) {
            Ok(doc) => {
                timer.success();
                Ok(doc)
            }
            Err(e) => {
                let err = ClusterError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }

    async fn delete(self, _ctx: Context, req: DeleteShardRequest) -> Result<bool, ClusterError> {
        let timer = RpcHandlerTimer::new("delete");
        let engine = self.resolve_shard(&req.index, req.shard_id, req.routing_version)?;
        match engine.delete_document(&req.doc_id) {
            Ok(found) => {
                timer.success();
                Ok(found)
            }
            Err(e) => {
                let err = ClusterError::from(e);
                timer.error(err.error_type());
                Err(err)
            }
        }
    }

    async fn create_shard(
        self,
        _ctx: Context,
        index: String,
        shard_id: u32,
        meta: IndexMeta,
        routing_version: u64,
    ) -> Result<(), ClusterError> {
        self.inner.manager.observe_state_version(routing_version);
        self.inner
            .manager
            .create_shard(&index, shard_id, meta)
            .map(|_| ())
            .map_err(ClusterError::from)
    }

    async fn drop_shard(
        self,
        _ctx: Context,
        index: String,
        shard_id: u32,
        routing_version: u64,
    ) -> Result<bool, ClusterError> {
        self.inner.manager.observe_state_version(routing_version);
        match self.inner.manager.drop_shard(&index, shard_id) {
            Ok(dropped) => {
                debug!(index, shard = shard_id, dropped, "drop shard");
                Ok(dropped)
            }
            Err(e) => {
                warn!(index, shard = shard_id, error = %e, "drop shard failed");
                Err(e.into())
            }
        }
    }

    async fn heartbeat(self, _ctx: Context) -> HeartbeatPayload {
        self.inner.manager.heartbeat()
    }

    async fn ping(self, _ctx: Context) -> String {
        "pong".to_string()
    }
}
