//! Node-local configuration, loaded from a TOML file with serde defaults
//! for every field.

use crate::cache::PlanCacheConfig;
use crate::engine::{Bm25Params, EngineConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub plan_cache: PlanCacheSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Roles this node takes: any of "control", "coordinator", "data".
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    /// Declared storage tier, advertised to the allocator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_tier: Option<String>,
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_roles() -> Vec<String> {
    vec![
        "control".to_string(),
        "coordinator".to_string(),
        "data".to_string(),
    ]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
            roles: default_roles(),
            storage_tier: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default = "default_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_b")]
    pub bm25_b: f32,
    #[serde(default = "default_merge_ratio")]
    pub merge_delete_ratio: f64,
}

fn default_k1() -> f32 {
    1.2
}

fn default_b() -> f32 {
    0.75
}

fn default_merge_ratio() -> f64 {
    0.2
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bm25_k1: default_k1(),
            bm25_b: default_b(),
            merge_delete_ratio: default_merge_ratio(),
        }
    }
}

impl EngineSettings {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            bm25: Bm25Params {
                k1: self.bm25_k1,
                b: self.bm25_b,
            },
            merge_delete_ratio: self.merge_delete_ratio,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Cap on `from + size`; requests beyond it fail fast instead of
    /// fanning out an unbounded per-shard top-k.
    #[serde(default = "default_max_from_plus_size")]
    pub max_from_plus_size: usize,
    #[serde(default = "default_true")]
    pub track_total_hits: bool,
    #[serde(default = "default_true")]
    pub request_cache_enabled: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_from_plus_size() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_from_plus_size: default_max_from_plus_size(),
            track_total_hits: true,
            request_cache_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanCacheSettings {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_entries() -> usize {
    1024
}

fn default_cache_mb() -> u64 {
    16
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for PlanCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            max_size_mb: default_cache_mb(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl PlanCacheSettings {
    pub fn to_cache_config(&self) -> PlanCacheConfig {
        PlanCacheConfig {
            max_entries: self.max_entries,
            max_bytes: self.max_size_mb * 1024 * 1024,
            ttl: Duration::from_secs(self.ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Load config from a TOML file; a missing file is created with
    /// defaults.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)
                .map_err(|e| Error::Internal(format!("invalid config {}: {}", path.display(), e)))
        } else {
            let config = Config::default();
            let raw = toml::to_string_pretty(&config)
                .map_err(|e| Error::Internal(format!("serialize default config: {}", e)))?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, raw)?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.search.timeout_ms, 30_000);
        assert_eq!(config.search.max_from_plus_size, 10_000);
        assert_eq!(config.engine.bm25_k1, 1.2);
        assert_eq!(config.node.roles.len(), 3);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.search.timeout_ms, 5000);
        assert_eq!(config.search.max_from_plus_size, 10_000);
        assert_eq!(config.plan_cache.max_entries, 1024);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("quidditch.toml");
        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.search.timeout_ms, created.search.timeout_ms);
    }
}
