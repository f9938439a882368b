use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Keyword,
    I64,
    F64,
    Bool,
    Date,
    Object,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::I64 | FieldType::F64 | FieldType::Date)
    }
}

/// Per-field mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Whether the field participates in the inverted index / doc values.
    #[serde(default = "default_true")]
    pub indexed: bool,

    /// Whether the field's value is kept in the stored-fields table.
    #[serde(default = "default_true")]
    pub stored: bool,

    /// Analyzer name for text fields. `None` means the standard analyzer.
    #[serde(default)]
    pub analyzer: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FieldMapping {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            indexed: true,
            stored: true,
            analyzer: None,
        }
    }

    pub fn text() -> Self {
        Self::new(FieldType::Text)
    }

    pub fn keyword() -> Self {
        Self::new(FieldType::Keyword)
    }
}

/// Index-time settings, fixed or mutable per the field's doc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Fixed at creation; resharding is not supported.
    #[serde(default = "default_shards")]
    pub number_of_shards: u32,

    #[serde(default)]
    pub number_of_replicas: u32,

    /// How often unflushed writes become visible to search, in milliseconds.
    #[serde(default = "default_refresh")]
    pub refresh_interval_ms: u64,

    /// Storage codec preference handed to the segment writer.
    #[serde(default)]
    pub codec_hint: CodecHint,

    /// Desired storage tier for shard placement, when declared.
    #[serde(default)]
    pub storage_tier: Option<String>,
}

fn default_shards() -> u32 {
    1
}

fn default_refresh() -> u64 {
    1000
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: default_shards(),
            number_of_replicas: 0,
            refresh_interval_ms: default_refresh(),
            codec_hint: CodecHint::default(),
            storage_tier: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecHint {
    #[default]
    BestSpeed,
    BestCompression,
}

/// Named pipelines bound to an index. Execution is delegated to an external
/// pipeline runtime; only the bindings are stored and replicated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineBindings {
    #[serde(default)]
    pub query_pipeline: Option<String>,
    #[serde(default)]
    pub document_pipeline: Option<String>,
    #[serde(default)]
    pub result_pipeline: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Creating,
    Active,
    Closed,
    Deleting,
}

/// Full metadata of one index: settings, ordered field mappings, pipeline
/// bindings and lifecycle state. `mapping_version` advances on every
/// settings or mapping mutation and feeds plan-cache invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub settings: IndexSettings,
    pub mappings: BTreeMap<String, FieldMapping>,
    #[serde(default)]
    pub pipelines: PipelineBindings,
    pub state: IndexState,
    #[serde(default)]
    pub mapping_version: u64,
}

impl IndexMeta {
    pub fn new(settings: IndexSettings, mappings: BTreeMap<String, FieldMapping>) -> Self {
        Self {
            settings,
            mappings,
            pipelines: PipelineBindings::default(),
            state: IndexState::Creating,
            mapping_version: 0,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.mappings.get(name)
    }

    pub fn bump_version(&mut self) {
        self.mapping_version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_defaults_from_json() {
        let m: FieldMapping = serde_json::from_str(r#"{"type": "text"}"#).unwrap();
        assert_eq!(m.field_type, FieldType::Text);
        assert!(m.indexed);
        assert!(m.stored);
        assert!(m.analyzer.is_none());
    }

    #[test]
    fn test_settings_defaults() {
        let s: IndexSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.number_of_shards, 1);
        assert_eq!(s.number_of_replicas, 0);
        assert_eq!(s.refresh_interval_ms, 1000);
        assert_eq!(s.codec_hint, CodecHint::BestSpeed);
    }

    #[test]
    fn test_meta_roundtrip() {
        let meta = IndexMeta::new(
            IndexSettings::default(),
            [("title".to_string(), FieldMapping::text())]
                .into_iter()
                .collect(),
        );
        let json = serde_json::to_string(&meta).unwrap();
        let back: IndexMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
