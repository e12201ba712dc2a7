//! Tag definitions and the authoritative in-memory value cache.

use crate::error::{ConfigurationError, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Float,
    Integer,
    Boolean,
}

impl DataType {
    /// Normalise a raw device value to this type.
    pub fn coerce(self, raw: f64) -> f64 {
        match self {
            DataType::Float => raw,
            DataType::Integer => raw.trunc(),
            DataType::Boolean => {
                if raw != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub id: TagId,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub data_type: DataType,
    pub alarm_limit: f64,
    /// Device address; the tag id is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl TagDefinition {
    pub fn new(id: &str, name: &str, unit: &str, alarm_limit: f64) -> Self {
        Self {
            id: TagId::new(id),
            name: name.to_string(),
            unit: unit.to_string(),
            data_type: DataType::Float,
            alarm_limit,
            address: None,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(self.id.as_str())
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(ConfigurationError::BlankTagId);
        }
        if !self.alarm_limit.is_finite() {
            return Err(ConfigurationError::InvalidLimit {
                id: self.id.to_string(),
                limit: self.alarm_limit,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TagState {
    pub value: Option<f64>,
    pub updated_at_us: Option<u64>,
    pub stale: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Immutable record of one successful read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tag_id: TagId,
    pub value: f64,
    pub timestamp_us: u64,
}

#[derive(Debug, Clone)]
pub struct TagSnapshot {
    pub definition: Arc<TagDefinition>,
    pub state: TagState,
}

#[derive(Debug)]
struct Entry {
    definition: Arc<TagDefinition>,
    state: TagState,
}

/// Tag definitions plus their current state.
///
/// Mutation happens per tag under a short write lock; readers take a
/// [`snapshot`](TagRegistry::snapshot) and iterate without holding it.
#[derive(Debug)]
pub struct TagRegistry {
    entries: RwLock<BTreeMap<TagId, Entry>>,
}

impl TagRegistry {
    pub fn new(definitions: Vec<TagDefinition>) -> Result<Self, ConfigurationError> {
        let entries = build_entries(definitions)?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    pub fn get(&self, id: &TagId) -> Option<TagSnapshot> {
        self.read_entries().get(id).map(|entry| TagSnapshot {
            definition: Arc::clone(&entry.definition),
            state: entry.state.clone(),
        })
    }

    pub fn definition(&self, id: &TagId) -> Option<Arc<TagDefinition>> {
        self.read_entries()
            .get(id)
            .map(|entry| Arc::clone(&entry.definition))
    }

    pub fn definitions(&self) -> Vec<Arc<TagDefinition>> {
        self.read_entries()
            .values()
            .map(|entry| Arc::clone(&entry.definition))
            .collect()
    }

    /// Point-in-time copy of every tag, ordered by id.
    pub fn snapshot(&self) -> Vec<TagSnapshot> {
        self.read_entries()
            .values()
            .map(|entry| TagSnapshot {
                definition: Arc::clone(&entry.definition),
                state: entry.state.clone(),
            })
            .collect()
    }

    /// Record a fresh value. Timestamps must strictly advance per tag.
    pub fn update(&self, id: &TagId, value: f64, timestamp_us: u64) -> Result<(), RegistryError> {
        let mut entries = self.write_entries();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownTag(id.to_string()))?;

        if let Some(previous_us) = entry.state.updated_at_us {
            if timestamp_us <= previous_us {
                return Err(RegistryError::NonMonotonic {
                    id: id.to_string(),
                    previous_us,
                    attempted_us: timestamp_us,
                });
            }
        }

        entry.state.value = Some(value);
        entry.state.updated_at_us = Some(timestamp_us);
        entry.state.stale = false;
        entry.state.consecutive_failures = 0;
        entry.state.last_error = None;
        Ok(())
    }

    /// Flag the cached value as not refreshed. Value and timestamp are kept.
    pub fn mark_stale(&self, id: &TagId, reason: &str) -> Result<(), RegistryError> {
        let mut entries = self.write_entries();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownTag(id.to_string()))?;
        entry.state.stale = true;
        entry.state.consecutive_failures = entry.state.consecutive_failures.saturating_add(1);
        entry.state.last_error = Some(reason.to_string());
        Ok(())
    }

    pub fn add_tag(&self, definition: TagDefinition) -> Result<(), ConfigurationError> {
        definition.validate()?;
        let mut entries = self.write_entries();
        if entries.contains_key(&definition.id) {
            return Err(ConfigurationError::DuplicateTag(definition.id.to_string()));
        }
        log::info!("Adding tag {} ({})", definition.id, definition.name);
        entries.insert(
            definition.id.clone(),
            Entry {
                definition: Arc::new(definition),
                state: TagState::default(),
            },
        );
        Ok(())
    }

    pub fn remove_tag(&self, id: &TagId) -> Result<Arc<TagDefinition>, ConfigurationError> {
        let mut entries = self.write_entries();
        if entries.len() == 1 && entries.contains_key(id) {
            return Err(ConfigurationError::EmptyRegistry);
        }
        let removed = entries
            .remove(id)
            .ok_or_else(|| ConfigurationError::InvalidSetting {
                name: "tag",
                reason: format!("unknown tag '{id}'"),
            })?;
        log::info!("Removed tag {}", id);
        Ok(removed.definition)
    }

    /// Swap in a new tag set. State of ids present in both sets is kept.
    pub fn replace_all(&self, definitions: Vec<TagDefinition>) -> Result<(), ConfigurationError> {
        let mut fresh = build_entries(definitions)?;
        let mut entries = self.write_entries();
        for (id, entry) in fresh.iter_mut() {
            if let Some(existing) = entries.get(id) {
                entry.state = existing.state.clone();
            }
        }
        log::info!("Tag registry reconfigured: {} -> {} tags", entries.len(), fresh.len());
        *entries = fresh;
        Ok(())
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<TagId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<TagId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn build_entries(
    definitions: Vec<TagDefinition>,
) -> Result<BTreeMap<TagId, Entry>, ConfigurationError> {
    if definitions.is_empty() {
        return Err(ConfigurationError::EmptyRegistry);
    }
    let mut seen = HashSet::new();
    let mut entries = BTreeMap::new();
    for definition in definitions {
        definition.validate()?;
        if !seen.insert(definition.id.clone()) {
            return Err(ConfigurationError::DuplicateTag(definition.id.to_string()));
        }
        entries.insert(
            definition.id.clone(),
            Entry {
                definition: Arc::new(definition),
                state: TagState::default(),
            },
        );
    }
    Ok(entries)
}

/// Load a JSON array of tag definitions.
pub fn load_tag_file(path: &Path) -> Result<Vec<TagDefinition>, ConfigurationError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::TagFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigurationError::TagFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Boiler, pressure and flow demo points used by the standalone simulator.
pub fn demo_tags() -> Vec<TagDefinition> {
    vec![
        TagDefinition::new("T01", "Boiler_Temp", "°C", 100.0),
        TagDefinition::new("P01", "System_Pressure", "Bar", 80.0),
        TagDefinition::new("F01", "Flow_Rate", "L/min", 50.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry() -> TagRegistry {
        TagRegistry::new(demo_tags()).unwrap()
    }

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        assert!(matches!(
            TagRegistry::new(Vec::new()),
            Err(ConfigurationError::EmptyRegistry)
        ));
        let dup = vec![
            TagDefinition::new("T01", "a", "", 1.0),
            TagDefinition::new("T01", "b", "", 2.0),
        ];
        assert!(matches!(
            TagRegistry::new(dup),
            Err(ConfigurationError::DuplicateTag(id)) if id == "T01"
        ));
    }

    #[test]
    fn rejects_invalid_definitions() {
        let blank = vec![TagDefinition::new("  ", "a", "", 1.0)];
        assert!(matches!(
            TagRegistry::new(blank),
            Err(ConfigurationError::BlankTagId)
        ));
        let nan = vec![TagDefinition::new("T01", "a", "", f64::NAN)];
        assert!(matches!(
            TagRegistry::new(nan),
            Err(ConfigurationError::InvalidLimit { .. })
        ));
    }

    #[test]
    fn update_sets_value_and_clears_staleness() {
        let reg = registry();
        let id = TagId::from("T01");
        reg.mark_stale(&id, "timeout").unwrap();
        assert!(reg.get(&id).unwrap().state.stale);

        reg.update(&id, 42.0, 10).unwrap();
        let state = reg.get(&id).unwrap().state;
        assert_eq!(state.value, Some(42.0));
        assert_eq!(state.updated_at_us, Some(10));
        assert!(!state.stale);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn timestamps_must_advance() {
        let reg = registry();
        let id = TagId::from("T01");
        reg.update(&id, 1.0, 100).unwrap();
        assert!(matches!(
            reg.update(&id, 2.0, 100),
            Err(RegistryError::NonMonotonic { .. })
        ));
        assert!(reg.update(&id, 2.0, 50).is_err());
        assert_eq!(reg.get(&id).unwrap().state.value, Some(1.0));
    }

    #[test]
    fn mark_stale_keeps_last_value() {
        let reg = registry();
        let id = TagId::from("P01");
        reg.update(&id, 7.0, 1).unwrap();
        reg.mark_stale(&id, "device error").unwrap();
        reg.mark_stale(&id, "device error").unwrap();
        let state = reg.get(&id).unwrap().state;
        assert_eq!(state.value, Some(7.0));
        assert_eq!(state.updated_at_us, Some(1));
        assert!(state.stale);
        assert_eq!(state.consecutive_failures, 2);
    }

    #[test]
    fn unknown_tag_is_reported() {
        let reg = registry();
        assert_eq!(
            reg.update(&TagId::from("X99"), 1.0, 1),
            Err(RegistryError::UnknownTag("X99".into()))
        );
    }

    #[test]
    fn snapshot_is_detached_from_later_updates() {
        let reg = registry();
        let id = TagId::from("F01");
        reg.update(&id, 1.0, 1).unwrap();
        let snap = reg.snapshot();
        reg.update(&id, 2.0, 2).unwrap();
        let f01 = snap.iter().find(|s| s.definition.id == id).unwrap();
        assert_eq!(f01.state.value, Some(1.0));
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = ["T01", "P01", "F01"]
            .into_iter()
            .map(|id| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let id = TagId::from(id);
                    for ts in 1..=500u64 {
                        reg.update(&id, ts as f64, ts).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for snap in reg.snapshot() {
            assert_eq!(snap.state.updated_at_us, Some(500));
        }
    }

    #[test]
    fn reconfiguration_keeps_surviving_state() {
        let reg = registry();
        reg.update(&TagId::from("T01"), 55.0, 1).unwrap();
        reg.replace_all(vec![
            TagDefinition::new("T01", "Boiler_Temp", "°C", 90.0),
            TagDefinition::new("L01", "Tank_Level", "%", 95.0),
        ])
        .unwrap();
        assert_eq!(reg.len(), 2);
        let t01 = reg.get(&TagId::from("T01")).unwrap();
        assert_eq!(t01.definition.alarm_limit, 90.0);
        assert_eq!(t01.state.value, Some(55.0));
        assert!(reg.get(&TagId::from("P01")).is_none());

        reg.add_tag(TagDefinition::new("P02", "Aux", "Bar", 10.0)).unwrap();
        assert!(reg.add_tag(TagDefinition::new("P02", "Aux", "Bar", 10.0)).is_err());
        reg.remove_tag(&TagId::from("L01")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn last_tag_cannot_be_removed() {
        let reg = TagRegistry::new(vec![TagDefinition::new("T01", "t", "", 1.0)]).unwrap();
        assert!(matches!(
            reg.remove_tag(&TagId::from("T01")),
            Err(ConfigurationError::EmptyRegistry)
        ));
    }

    #[test]
    fn loads_tag_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":"T01","name":"Boiler_Temp","unit":"°C","alarm_limit":100.0,"address":"ir:0"}},
               {{"id":"S01","name":"Pump_On","data_type":"boolean","alarm_limit":0.5}}]"#
        )
        .unwrap();
        let defs = load_tag_file(file.path()).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].address(), "ir:0");
        assert_eq!(defs[1].address(), "S01");
        assert_eq!(defs[1].data_type, DataType::Boolean);
    }

    #[test]
    fn malformed_tag_file_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            load_tag_file(file.path()),
            Err(ConfigurationError::TagFile { .. })
        ));
    }

    #[test]
    fn data_type_coercion() {
        assert_eq!(DataType::Integer.coerce(12.9), 12.0);
        assert_eq!(DataType::Boolean.coerce(0.3), 1.0);
        assert_eq!(DataType::Boolean.coerce(0.0), 0.0);
        assert_eq!(DataType::Float.coerce(1.25), 1.25);
    }
}
