//! Bounded LRU + TTL cache of parsed and validated query plans, keyed by
//! the plan fingerprint. Evicts on entry-count or byte-size cap, whichever
//! trips first; all entries of an index are dropped when its mapping or
//! shard-layout version advances.

use super::stats::PlanCacheStats;
use crate::aggregations::Aggregation;
use crate::query::QueryAst;
use crate::types::SortClause;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The cached, request-independent part of a translated query. `from`,
/// `size` and `track_total_hits` stay per-request.
#[derive(Debug, Clone, Serialize)]
pub struct CachedPlan {
    pub ast: QueryAst,
    pub pushed_filters: Vec<QueryAst>,
    /// `pushed_filters` pre-serialized for the shard RPC.
    pub pushed_filter_blob: Vec<u8>,
    pub sort: Vec<SortClause>,
    pub aggs: BTreeMap<String, Aggregation>,
}

#[derive(Debug, Clone)]
pub struct PlanCacheConfig {
    pub max_entries: usize,
    pub max_bytes: u64,
    pub ttl: Duration,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 16 * 1024 * 1024,
            ttl: Duration::from_secs(300),
        }
    }
}

struct Entry {
    plan: Arc<CachedPlan>,
    index: String,
    inserted: Instant,
    last_access: u64,
    size_bytes: u64,
}

pub struct PlanCache {
    entries: Mutex<HashMap<String, Entry>>,
    config: PlanCacheConfig,
    access_counter: AtomicU64,
    stats: Arc<PlanCacheStats>,
}

impl PlanCache {
    pub fn new(config: PlanCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            access_counter: AtomicU64::new(0),
            stats: Arc::new(PlanCacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<PlanCacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn get(&self, key: &str) -> Option<Arc<CachedPlan>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() <= self.config.ttl => {
                entry.last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
                self.stats.hit();
                Some(Arc::clone(&entry.plan))
            }
            Some(_) => {
                entries.remove(key);
                self.stats.evict();
                self.stats.miss();
                None
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, index: impl Into<String>, plan: CachedPlan) {
        let size_bytes = serde_json::to_vec(&plan).map(|v| v.len() as u64).unwrap_or(0);
        let mut entries = self.entries.lock();
        let entry = Entry {
            plan: Arc::new(plan),
            index: index.into(),
            inserted: Instant::now(),
            last_access: self.access_counter.fetch_add(1, Ordering::Relaxed),
            size_bytes,
        };
        entries.insert(key.into(), entry);
        self.enforce_caps(&mut entries);
    }

    /// Drop every cached plan for an index. Called whenever the index's
    /// mapping or shard-layout version advances.
    pub fn invalidate_index(&self, index: &str) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.index != index);
        for _ in entries.len()..before {
            self.stats.evict();
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.entries.lock().values().map(|e| e.size_bytes).sum()
    }

    fn enforce_caps(&self, entries: &mut HashMap<String, Entry>) {
        loop {
            let total_bytes: u64 = entries.values().map(|e| e.size_bytes).sum();
            if entries.len() <= self.config.max_entries && total_bytes <= self.config.max_bytes {
                return;
            }
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match lru {
                Some(key) => {
                    entries.remove(&key);
                    self.stats.evict();
                }
                None => return,
            }
        }
    }
}
