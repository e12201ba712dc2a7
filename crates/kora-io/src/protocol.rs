use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kora_core::anomaly::DEFAULT_SAFETY_LIMIT;
use kora_core::tags::{DataType, Reading, TagDefinition, TagId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const TAGS_PATH: &str = "/api/tags/";
pub const LOGS_PATH: &str = "/api/logs/";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One tag as listed by the backend catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub alarm_limit: Option<f64>,
}

impl CatalogEntry {
    /// Local definition for a tag bootstrapped from the catalog. The catalog
    /// name doubles as the local id; missing limits use `default_limit`.
    pub fn to_definition(&self, default_limit: f64) -> TagDefinition {
        let data_type = match self.data_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("int") | Some("integer") => DataType::Integer,
            Some("bool") | Some("boolean") => DataType::Boolean,
            _ => DataType::Float,
        };
        TagDefinition::new(
            &self.name,
            &self.name,
            &self.unit,
            self.alarm_limit.unwrap_or(default_limit),
        )
        .with_data_type(data_type)
    }
}

/// Catalog mirroring local definitions, numbered from 1 in registry order.
/// Used by the in-memory store in standalone runs.
pub fn catalog_from_definitions(definitions: &[Arc<TagDefinition>]) -> Vec<CatalogEntry> {
    definitions
        .iter()
        .zip(1..)
        .map(|(def, id)| CatalogEntry {
            id,
            name: def.name.clone(),
            unit: def.unit.clone(),
            data_type: None,
            alarm_limit: Some(def.alarm_limit),
        })
        .collect()
}

pub fn definitions_from_catalog(entries: &[CatalogEntry]) -> Vec<TagDefinition> {
    entries
        .iter()
        .map(|entry| entry.to_definition(DEFAULT_SAFETY_LIMIT))
        .collect()
}

/// Body of an ingestion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub tag: i64,
    pub value: f64,
    pub timestamp_us: u64,
}

impl IngestRecord {
    pub fn new(remote_tag: i64, reading: &Reading) -> Self {
        Self {
            tag: remote_tag,
            value: reading.value,
            timestamp_us: reading.timestamp_us,
        }
    }
}

/// Created acknowledgement. Backends may answer with an empty body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestAck {
    #[serde(default)]
    pub id: Option<i64>,
}

/// Stable key for one reading: the same tag and timestamp always map to the
/// same key, so a replayed publish can be deduplicated by the backend.
pub fn idempotency_key(tag_id: &TagId, timestamp_us: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp_us.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
