//! The shard manager owns every shard engine on a data node: it loads
//! them from disk on start, creates and drops them on allocator command,
//! and assembles the node's heartbeat payload.
//!
//! Data directory layout: `<data_dir>/<index_name>/shard_<n>/...`. The
//! loader parses only that directory shape; file contents inside a shard
//! directory belong to the engine.

use crate::engine::{EngineConfig, ShardEngine};
use crate::error::{Error, Result};
use crate::expr::ExprRegistry;
use crate::schema::IndexMeta;
use crate::types::ShardId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const META_FILE: &str = "meta.json";

/// Per-shard slice of a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReport {
    pub index: String,
    pub shard_id: ShardId,
    pub docs: u64,
    pub bytes: u64,
}

/// What a data node reports to the control plane every heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    /// Highest committed cluster-state version this node has observed.
    pub state_version: u64,
    pub shards: Vec<ShardReport>,
}

pub struct ShardManager {
    node_id: String,
    data_dir: PathBuf,
    engine_config: EngineConfig,
    expr: Option<Arc<ExprRegistry>>,
    shards: RwLock<HashMap<(String, ShardId), Arc<ShardEngine>>>,
    last_seen_state_version: AtomicU64,
}

impl ShardManager {
    pub fn new(
        node_id: impl Into<String>,
        data_dir: impl AsRef<Path>,
        engine_config: EngineConfig,
        expr: Option<Arc<ExprRegistry>>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.as_ref().to_path_buf(),
            engine_config,
            expr,
            shards: RwLock::new(HashMap::new()),
            last_seen_state_version: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state_version(&self) -> u64 {
        self.last_seen_state_version.load(Ordering::Acquire)
    }

    /// Record a newly observed cluster-state version; versions only move
    /// forward.
    pub fn observe_state_version(&self, version: u64) {
        self.last_seen_state_version
            .fetch_max(version, Ordering::AcqRel);
    }

    /// Scan the data directory and open every well-formed shard directory.
    /// Malformed names are logged and skipped. Returns shards loaded.
    pub fn start(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.data_dir)?;
        let mut loaded = 0;
        for index_entry in std::fs::read_dir(&self.data_dir)? {
            let index_entry = index_entry?;
            if !index_entry.file_type()?.is_dir() {
                continue;
            }
            let Some(index_name) = index_entry.file_name().to_str().map(str::to_string) else {
                warn!(path = ?index_entry.path(), "skipping non-UTF-8 index directory");
                continue;
            };
            for shard_entry in std::fs::read_dir(index_entry.path())? {
                let shard_entry = shard_entry?;
                if !shard_entry.file_type()?.is_dir() {
                    continue;
                }
                let name = shard_entry.file_name();
                let Some(shard_id) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("shard_"))
                    .and_then(|n| n.parse::<ShardId>().ok())
                else {
                    warn!(path = ?shard_entry.path(), "skipping malformed shard directory");
                    continue;
                };
                match self.open_shard(&index_name, shard_id, shard_entry.path()) {
                    Ok(()) => loaded += 1,
                    Err(e) => {
                        warn!(
                            index = %index_name,
                            shard = shard_id,
                            error = %e,
                            "failed to open shard; skipping"
                        );
                    }
                }
            }
        }
        info!(node = %self.node_id, shards = loaded, "shard manager started");
        Ok(loaded)
    }

    fn open_shard(&self, index: &str, shard_id: ShardId, dir: PathBuf) -> Result<()> {
        let meta_bytes = std::fs::read(dir.join(META_FILE))?;
        let meta: IndexMeta = serde_json::from_slice(&meta_bytes)?;
        let engine = ShardEngine::open(
            &dir,
            index,
            shard_id,
            meta,
            self.engine_config,
            self.expr.clone(),
        )?;
        self.shards
            .write()
            .insert((index.to_string(), shard_id), Arc::new(engine));
        Ok(())
    }

    /// Create a shard: the directory is created eagerly before the engine
    /// opens, which the engine requires. Idempotent for an already-open
    /// shard.
    pub fn create_shard(
        &self,
        index: &str,
        shard_id: ShardId,
        meta: IndexMeta,
    ) -> Result<Arc<ShardEngine>> {
        if let Some(existing) = self.shards.read().get(&(index.to_string(), shard_id)) {
            return Ok(Arc::clone(existing));
        }
        let dir = self.shard_dir(index, shard_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(META_FILE), serde_json::to_vec(&meta)?)?;
        let engine = Arc::new(ShardEngine::open(
            &dir,
            index,
            shard_id,
            meta,
            self.engine_config,
            self.expr.clone(),
        )?);
        self.shards
            .write()
            .insert((index.to_string(), shard_id), Arc::clone(&engine));
        info!(index, shard = shard_id, "created shard");
        Ok(engine)
    }

    /// Drop a shard: unregister and remove its on-disk data. Searches
    /// holding a snapshot finish against the in-memory segments.
    pub fn drop_shard(&self, index: &str, shard_id: ShardId) -> Result<bool> {
        let removed = self
            .shards
            .write()
            .remove(&(index.to_string(), shard_id))
            .is_some();
        let dir = self.shard_dir(index, shard_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        if removed {
            info!(index, shard = shard_id, "dropped shard");
        }
        Ok(removed)
    }

    /// Look up a local shard engine for RPC dispatch.
    pub fn get(&self, index: &str, shard_id: ShardId) -> Result<Arc<ShardEngine>> {
        self.shards
            .read()
            .get(&(index.to_string(), shard_id))
            .cloned()
            .ok_or_else(|| {
                Error::ShardUnavailable(format!("{}/shard_{} not on this node", index, shard_id))
            })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub fn list_shards(&self) -> Vec<(String, ShardId)> {
        let mut keys: Vec<(String, ShardId)> = self.shards.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Push new index metadata to every local shard of the index.
    pub fn update_index_meta(&self, index: &str, meta: &IndexMeta) {
        for ((name, _), engine) in self.shards.read().iter() {
            if name == index {
                engine.update_meta(meta.clone());
            }
        }
    }

    /// Commit any shard with buffered writes. Returns how many shards
    /// produced a new segment.
    pub fn refresh_all(&self) -> Result<usize> {
        let engines: Vec<Arc<ShardEngine>> = self.shards.read().values().cloned().collect();
        let mut committed = 0;
        for engine in engines {
            if engine.commit()?.is_some() {
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Background merge pass over every shard.
    pub fn merge_pass(&self) -> Result<usize> {
        let engines: Vec<Arc<ShardEngine>> = self.shards.read().values().cloned().collect();
        let mut merged = 0;
        for engine in engines {
            if engine.maybe_merge()?.is_some() {
                merged += 1;
            }
        }
        Ok(merged)
    }

    pub fn heartbeat(&self) -> HeartbeatPayload {
        let mut shards: Vec<ShardReport> = self
            .shards
            .read()
            .iter()
            .map(|((index, shard_id), engine)| {
                let (docs, bytes) = engine.stats();
                ShardReport {
                    index: index.clone(),
                    shard_id: *shard_id,
                    docs,
                    bytes,
                }
            })
            .collect();
        shards.sort_by(|a, b| (&a.index, a.shard_id).cmp(&(&b.index, b.shard_id)));
        HeartbeatPayload {
            node_id: self.node_id.clone(),
            state_version: self.state_version(),
            shards,
        }
    }

    fn shard_dir(&self, index: &str, shard_id: ShardId) -> PathBuf {
        self.data_dir.join(index).join(format!("shard_{}", shard_id))
    }
}
