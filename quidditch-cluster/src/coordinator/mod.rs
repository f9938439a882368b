//! The query coordinator: translates a DSL request into a parallel shard
//! fan-out and merges the partial results into one response. Also the
//! write path (consistent doc routing to a single primary) and the admin
//! surface (index lifecycle through the control plane).

mod merge;

pub use merge::{merge_aggregations, merge_hits, render_aggregations, MergedHits};

use crate::client::ShardTransport;
use crate::config::CoordinatorConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::{record_plan_cache, record_shard_failure};
use crate::routing::{shard_for_doc, RoutingCache, RoutingTable, ShardRoute};
use crate::state::{ClusterCommand, ControlPlane, IndexSettingsPatch};
use crate::types::*;
use quidditch::cache::{CachedPlan, PlanCache, PlanCacheConfig};
use quidditch::query::{plan_fingerprint, translate_body, SearchBody};
use quidditch::schema::{FieldMapping, IndexMeta, IndexSettings, PipelineBindings};
use quidditch::types::{Document, SortValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Shard-status section of a search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStats {
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ShardFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
    pub relation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score")]
    pub score: Option<f32>,
    #[serde(rename = "_source")]
    pub source: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitsSection {
    pub total: TotalHits,
    pub max_score: Option<f32>,
    pub hits: Vec<ResponseHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub took_ms: u64,
    pub timed_out: bool,
    #[serde(rename = "_shards")]
    pub shards: ShardStats,
    pub hits: HitsSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<serde_json::Map<String, Value>>,
}

pub struct Coordinator {
    control: Arc<dyn ControlPlane>,
    transport: Arc<dyn ShardTransport>,
    routing: RoutingCache,
    plans: PlanCache,
    config: CoordinatorConfig,
    fanout_permits: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        transport: Arc<dyn ShardTransport>,
        config: CoordinatorConfig,
    ) -> Self {
        let fanout_permits = Arc::new(Semaphore::new(config.max_concurrent_shard_requests));
        Self {
            control,
            transport,
            routing: RoutingCache::new(),
            plans: PlanCache::new(PlanCacheConfig::default()),
            config,
            fanout_permits,
        }
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plans
    }

    // ========================================
    // Admin surface
    // ========================================

    /// Create an index: commit the metadata, let the allocator place its
    /// shards, then open the shards on their assigned owners.
    pub async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mappings: BTreeMap<String, FieldMapping>,
    ) -> Result<u64> {
        let meta = IndexMeta::new(settings, mappings);
        let version = self
            .control
            .submit_current(ClusterCommand::CreateIndex {
                expected_version: 0,
                name: name.to_string(),
                meta: meta.clone(),
            })
            .await?;
        self.control.rebalance().await?;
        let routing = self.refresh_routing().await?;

        for (key, route) in routing.shards_of(name) {
            for node in route.primary.iter().chain(route.replicas.iter()) {
                let addr = routing
                    .address_of(node)
                    .ok_or_else(|| ClusterError::Internal(format!("no address for {}", node)))?;
                self.transport
                    .create_shard(addr, &key.index, key.shard, meta.clone(), routing.version)
                    .await?;
            }
        }
        self.plans.invalidate_index(name);
        Ok(version)
    }

    /// Delete an index: capture its owners, commit the removal, then drop
    /// the shards lazily on those owners.
    pub async fn delete_index(&self, name: &str) -> Result<u64> {
        let routing = self.routing_for(name).await?;
        let owners: Vec<(u32, String)> = routing
            .shards_of(name)
            .flat_map(|(key, route)| {
                route
                    .primary
                    .iter()
                    .chain(route.replicas.iter())
                    .filter_map(|node| {
                        routing
                            .address_of(node)
                            .map(|addr| (key.shard, addr.to_string()))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let version = self
            .control
            .submit_current(ClusterCommand::DeleteIndex {
                expected_version: 0,
                name: name.to_string(),
            })
            .await?;
        let routing = self.refresh_routing().await?;
        for (shard, addr) in owners {
            if let Err(e) = self
                .transport
                .drop_shard(&addr, name, shard, routing.version)
                .await
            {
                warn!(index = name, shard, error = %e, "lazy shard removal failed");
            }
        }
        self.plans.invalidate_index(name);
        Ok(version)
    }

    pub async fn update_settings(&self, name: &str, patch: IndexSettingsPatch) -> Result<u64> {
        let version = self
            .control
            .submit_current(ClusterCommand::UpdateIndexSettings {
                expected_version: 0,
                name: name.to_string(),
                patch,
            })
            .await?;
        self.control.rebalance().await?;
        self.refresh_routing().await?;
        self.plans.invalidate_index(name);
        Ok(version)
    }

    pub async fn update_pipelines(&self, name: &str, bindings: PipelineBindings) -> Result<u64> {
        let version = self
            .control
            .submit_current(ClusterCommand::UpdatePipelineBinding {
                expected_version: 0,
                name: name.to_string(),
                bindings,
            })
            .await?;
        self.plans.invalidate_index(name);
        Ok(version)
    }

    pub async fn get_settings(&self, name: &str) -> Result<IndexMeta> {
        Ok(self.control.index_meta(name).await?.0)
    }

    // ========================================
    // Document plane
    // ========================================

    pub async fn index_document(
        &self,
        index: &str,
        doc_id: &str,
        source: Value,
    ) -> Result<IndexAck> {
        let source = source
            .as_object()
            .cloned()
            .ok_or_else(|| ClusterError::Parse {
                path: "body".to_string(),
                reason: "document body must be a JSON object".to_string(),
            })?;
        let doc = Document::new(doc_id, source);
        let ack = self
            .with_doc_shard(index, doc_id, |addr, shard, version| {
                let doc = doc.clone();
                let index = index.to_string();
                async move {
                    self.transport
                        .index(
                            &addr,
                            IndexShardRequest {
                                index,
                                shard_id: shard,
                                routing_version: version,
                                doc,
                            },
                        )
                        .await
                }
            })
            .await?;
        self.replay_to_replicas(index, ack.shard_id, Replay::Index(&doc))
            .await;
        Ok(ack)
    }

    pub async fn get_document(&self, index: &str, doc_id: &str) -> Result<Option<Document>> {
        self.with_doc_shard(index, doc_id, |addr, shard, version| {
            let index = index.to_string();
            let doc_id = doc_id.to_string();
            async move {
                self.transport
                    .get(
                        &addr,
                        GetShardRequest {
                            index,
                            shard_id: shard,
                            routing_version: version,
                            doc_id,
                        },
                    )
                    .await
            }
        })
        .await
    }

    pub async fn delete_document(&self, index: &str, doc_id: &str) -> Result<bool> {
        let routing = self.routing_for(index).await?;
        let shard = shard_for_doc(doc_id, routing.shard_count(index).max(1));
        let found = self
            .with_doc_shard(index, doc_id, |addr, shard, version| {
                let index = index.to_string();
                let doc_id = doc_id.to_string();
                async move {
                    self.transport
                        .delete(
                            &addr,
                            DeleteShardRequest {
                                index,
                                shard_id: shard,
                                routing_version: version,
                                doc_id,
                            },
                        )
                        .await
                }
            })
            .await?;
        if found {
            self.replay_to_replicas(index, shard, Replay::Delete(doc_id))
                .await;
        }
        Ok(found)
    }

    /// Forward an acked write to the shard's replica holders. Replica
    /// divergence from a lost forward heals on the next reassignment; the
    /// primary remains the only authoritative copy.
    async fn replay_to_replicas(&self, index: &str, shard: u32, replay: Replay<'_>) {
        let routing = self.routing.get();
        let Some(route) = routing.route(index, shard) else {
            return;
        };
        for replica in &route.replicas {
            let Some(addr) = routing.address_of(replica) else {
                continue;
            };
            let outcome = match replay {
                Replay::Index(doc) => self
                    .transport
                    .index(
                        addr,
                        IndexShardRequest {
                            index: index.to_string(),
                            shard_id: shard,
                            routing_version: routing.version,
                            doc: doc.clone(),
                        },
                    )
                    .await
                    .map(|_| ()),
                Replay::Delete(doc_id) => self
                    .transport
                    .delete(
                        addr,
                        DeleteShardRequest {
                            index: index.to_string(),
                            shard_id: shard,
                            routing_version: routing.version,
                            doc_id: doc_id.to_string(),
                        },
                    )
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = outcome {
                warn!(index, shard, replica = %replica, error = %e, "replica replay failed");
            }
        }
    }

    /// Resolve the owning shard's primary for a doc id and run `op`
    /// against it, with one routing refresh + retry on `StaleRouting`.
    async fn with_doc_shard<T, F, Fut>(&self, index: &str, doc_id: &str, op: F) -> Result<T>
    where
        F: Fn(String, u32, u64) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut routing = self.routing_for(index).await?;
        for attempt in 0..2 {
            let shard_count = routing.shard_count(index);
            if shard_count == 0 {
                return Err(ClusterError::NotFound(format!("index `{}`", index)));
            }
            let shard = shard_for_doc(doc_id, shard_count);
            let route = routing
                .route(index, shard)
                .ok_or_else(|| ClusterError::ShardUnavailable(format!("{}/{}", index, shard)))?;
            // Writes and doc reads go to the primary; replicas follow it.
            let primary = route.primary.clone().ok_or_else(|| {
                ClusterError::ShardUnavailable(format!("{}/{} has no primary", index, shard))
            })?;
            let addr = routing
                .address_of(&primary)
                .ok_or_else(|| ClusterError::Internal(format!("no address for {}", primary)))?
                .to_string();
            match op(addr, shard, routing.version).await {
                Err(e) if e.is_routing_stale() && attempt == 0 => {
                    debug!(index, doc_id, "stale routing; refreshing and retrying once");
                    routing = self.refresh_routing().await?;
                }
                other => return other,
            }
        }
        unreachable!("loop returns on second attempt")
    }

    // ========================================
    // Search plane
    // ========================================

    pub async fn search(&self, index: &str, body: Value) -> Result<SearchResponse> {
        let started = Instant::now();
        let body: SearchBody =
            serde_json::from_value(body).map_err(|e| ClusterError::Parse {
                path: "body".to_string(),
                reason: e.to_string(),
            })?;
        let (meta, _) = self.control.index_meta(index).await?;
        let mut routing = self.routing_for(index).await?;

        let translated = translate_body(&body, &meta, self.config.max_from_plus_size)
            .map_err(ClusterError::from)?;
        let from = translated.from;
        let size = translated.size;
        let track_total_hits = translated.track_total_hits;

        // Plan cache: normalized shape + index + routing + mapping version.
        let key = plan_fingerprint(
            index,
            &translated.ast,
            &translated.sort,
            &translated.aggs,
            routing.version,
            meta.mapping_version,
        );
        let cached = if self.config.request_cache_enabled {
            self.plans.get(&key)
        } else {
            None
        };
        let plan = match cached {
            Some(plan) => {
                record_plan_cache(true);
                plan
            }
            None => {
                record_plan_cache(false);
                let (ast, pushed) = translated.ast.clone().split_pushed_filters();
                let blob = bincode::serialize(&pushed)?;
                let plan = CachedPlan {
                    ast,
                    pushed_filters: pushed,
                    pushed_filter_blob: blob,
                    sort: translated.sort.clone(),
                    aggs: translated.aggs.clone(),
                };
                if self.config.request_cache_enabled {
                    self.plans.put(key.clone(), index, plan.clone());
                }
                Arc::new(plan)
            }
        };
        debug!(index, fingerprint = %key, "search planned");

        let timeout_ms = body
            .timeout_ms
            .unwrap_or(self.config.timeout_ms)
            .min(self.config.timeout_ms);

        let shard_count = routing.shard_count(index);
        if shard_count == 0 {
            return Err(ClusterError::NotFound(format!("index `{}`", index)));
        }

        let mut partials: Vec<PartialOutcome> = self
            .fan_out(
                index,
                &routing,
                &plan,
                from + size,
                remaining_ms(started, timeout_ms),
                (0..shard_count).collect(),
            )
            .await;

        // Stale-routing failures get one refresh and one retry against the
        // corrected targets.
        let stale: Vec<u32> = partials
            .iter()
            .filter(|o| matches!(&o.result, Err(e) if e.is_routing_stale()))
            .map(|o| o.shard_id)
            .collect();
        if !stale.is_empty() {
            debug!(index, shards = ?stale, "stale routing on fan-out; retrying once");
            routing = self.refresh_routing().await?;
            let retried = self
                .fan_out(
                    index,
                    &routing,
                    &plan,
                    from + size,
                    remaining_ms(started, timeout_ms),
                    stale,
                )
                .await;
            for outcome in retried {
                if let Some(slot) = partials
                    .iter_mut()
                    .find(|o| o.shard_id == outcome.shard_id)
                {
                    *slot = outcome;
                }
            }
        }

        // Split outcomes; failed shards become response detail, not a
        // request failure, unless every shard failed.
        let total_shards = partials.len() as u32;
        let mut ok = Vec::new();
        let mut failures = Vec::new();
        let mut timed_out = false;
        for outcome in partials {
            match outcome.result {
                Ok(partial) => ok.push(partial),
                Err(e) => {
                    record_shard_failure(index);
                    timed_out |= matches!(e, ClusterError::TimedOut);
                    failures.push(ShardFailure {
                        index: index.to_string(),
                        shard_id: outcome.shard_id,
                        node: outcome.node,
                        reason: e.to_string(),
                        error_type: e.error_type().to_string(),
                        is_timeout: matches!(e, ClusterError::TimedOut),
                    });
                }
            }
        }
        if ok.is_empty() {
            if let Some(failure) = failures.first() {
                return Err(ClusterError::Internal(format!(
                    "all {} shards failed; first: {}",
                    total_shards, failure.reason
                )));
            }
        }

        let agg_partials: Vec<_> = ok.iter().map(|p| p.aggregations.clone()).collect();
        let merged = merge_hits(ok, from, size, &plan.sort);
        let aggregations = if plan.aggs.is_empty() {
            None
        } else {
            Some(render_aggregations(
                &plan.aggs,
                &merge_aggregations(agg_partials)?,
            )?)
        };

        let hits = merged
            .hits
            .into_iter()
            .map(|hit| ResponseHit {
                id: hit.doc_id,
                score: Some(hit.score),
                source: hit.source.unwrap_or_default(),
                sort: if hit.sort_key.is_empty() {
                    None
                } else {
                    Some(hit.sort_key)
                },
            })
            .collect();

        let total = if track_total_hits {
            TotalHits {
                value: merged.total,
                relation: "eq".to_string(),
            }
        } else {
            TotalHits {
                value: merged.total.min((from + size) as u64),
                relation: "gte".to_string(),
            }
        };

        Ok(SearchResponse {
            took_ms: started.elapsed().as_millis() as u64,
            timed_out,
            shards: ShardStats {
                total: total_shards,
                successful: total_shards - failures.len() as u32,
                failed: failures.len() as u32,
                failures,
            },
            hits: HitsSection {
                total,
                max_score: merged.max_score,
                hits,
            },
            aggregations,
        })
    }

    /// Count matching docs across all shards. Unlike search, any shard
    /// failure fails the count.
    pub async fn count(&self, index: &str, body: Value) -> Result<u64> {
        let body: SearchBody =
            serde_json::from_value(body).map_err(|e| ClusterError::Parse {
                path: "body".to_string(),
                reason: e.to_string(),
            })?;
        let (meta, _) = self.control.index_meta(index).await?;
        let routing = self.routing_for(index).await?;
        let translated = translate_body(&body, &meta, self.config.max_from_plus_size)
            .map_err(ClusterError::from)?;
        let (ast, pushed) = translated.ast.split_pushed_filters();
        let blob = bincode::serialize(&pushed)?;

        let mut total = 0u64;
        for (key, route) in routing.shards_of(index) {
            let node = self.select_read_node(route).ok_or_else(|| {
                ClusterError::ShardUnavailable(format!("{}/{}", index, key.shard))
            })?;
            let addr = routing
                .address_of(&node)
                .ok_or_else(|| ClusterError::Internal(format!("no address for {}", node)))?;
            total += self
                .transport
                .count(
                    addr,
                    CountShardRequest {
                        index: index.to_string(),
                        shard_id: key.shard,
                        routing_version: routing.version,
                        ast: ast.clone(),
                        pushed_filter: blob.clone(),
                        timeout_ms: self.config.timeout_ms,
                    },
                )
                .await?;
        }
        Ok(total)
    }

    async fn fan_out(
        &self,
        index: &str,
        routing: &Arc<RoutingTable>,
        plan: &Arc<CachedPlan>,
        per_shard_top_k: usize,
        timeout_ms: u64,
        shards: Vec<u32>,
    ) -> Vec<PartialOutcome> {
        let allow_replicas = self.config.read_from_replicas;
        let futures: Vec<_> = shards
            .into_iter()
            .map(|shard_id| {
                let transport = Arc::clone(&self.transport);
                let permits = Arc::clone(&self.fanout_permits);
                let routing = Arc::clone(routing);
                let plan = Arc::clone(plan);
                let index = index.to_string();
                async move {
                    let target = routing
                        .route(&index, shard_id)
                        .and_then(|route| {
                            select_node(route, allow_replicas).map(|node| {
                                routing.address_of(&node).map(|a| (node, a.to_string()))
                            })
                        })
                        .flatten();
                    let Some((node, addr)) = target else {
                        return PartialOutcome {
                            shard_id,
                            node: String::new(),
                            result: Err(ClusterError::ShardUnavailable(format!(
                                "{}/{}",
                                index, shard_id
                            ))),
                        };
                    };
                    let _permit = permits.acquire().await.ok();
                    let req = SearchShardRequest {
                        index: index.clone(),
                        shard_id,
                        routing_version: routing.version,
                        ast: plan.ast.clone(),
                        pushed_filter: plan.pushed_filter_blob.clone(),
                        from_plus_size: per_shard_top_k,
                        sort: plan.sort.clone(),
                        aggs: plan.aggs.clone(),
                        timeout_ms,
                    };
                    // The shared deadline bounds every sub-request; expiry
                    // abandons the await and reports the shard timed out.
                    let result = match tokio::time::timeout(
                        Duration::from_millis(timeout_ms.max(1)),
                        transport.search(&addr, req),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ClusterError::TimedOut),
                    };
                    PartialOutcome {
                        shard_id,
                        node,
                        result,
                    }
                }
            })
            .collect();
        futures::future::join_all(futures).await
    }

    fn select_read_node(&self, route: &ShardRoute) -> Option<String> {
        select_node(route, self.config.read_from_replicas)
    }

    // ========================================
    // Routing cache
    // ========================================

    async fn routing_for(&self, index: &str) -> Result<Arc<RoutingTable>> {
        let cached = self.routing.get();
        if cached.shard_count(index) > 0 {
            return Ok(cached);
        }
        self.refresh_routing().await
    }

    pub async fn refresh_routing(&self) -> Result<Arc<RoutingTable>> {
        let table = self.control.routing_table().await?;
        self.routing.update(table);
        Ok(self.routing.get())
    }
}

struct PartialOutcome {
    shard_id: u32,
    node: String,
    result: Result<quidditch::types::PartialSearchResult>,
}

#[derive(Clone, Copy)]
enum Replay<'a> {
    Index(&'a Document),
    Delete(&'a str),
}

/// Default read policy: primary, falling back to the oldest replica when
/// allowed and the primary slot is empty.
fn select_node(route: &ShardRoute, allow_replicas: bool) -> Option<String> {
    route.primary.clone().or_else(|| {
        if allow_replicas {
            route.replicas.first().cloned()
        } else {
            None
        }
    })
}

fn remaining_ms(started: Instant, timeout_ms: u64) -> u64 {
    timeout_ms.saturating_sub(started.elapsed().as_millis() as u64).max(1)
}
