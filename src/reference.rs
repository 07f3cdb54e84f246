//! Static alarm definitions and location-parameter schemas.

use crate::error::Result;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Reference entry for one alarm identifier
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlarmDefinition {
    pub alarm_id: String,
    /// Identifier reported northbound
    pub external_id: String,
    /// Severity used when a source sends none or an invalid one
    pub default_severity: i32,
    /// Hidden from the northbound display
    #[serde(default)]
    pub display_masked: bool,
}

/// One position in an alarm's comma-separated location info
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocationParam {
    pub name: String,
    /// Position takes part in matching a clear or resend to its alarm
    #[serde(default)]
    pub is_matching_key: bool,
}

impl LocationParam {
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_matching_key: true,
        }
    }

    pub fn info(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_matching_key: false,
        }
    }
}

/// Lookup of static reference data, keyed by alarm identifier
pub trait ReferenceData: Send + Sync {
    fn definition(&self, alarm_id: &str) -> Option<AlarmDefinition>;

    /// Ordered location schema, `None` if the identifier has no schema
    fn location_schema(&self, alarm_id: &str) -> Option<Vec<LocationParam>>;
}

#[derive(Debug, Deserialize)]
struct DefinitionEntry {
    #[serde(flatten)]
    definition: AlarmDefinition,
    #[serde(default)]
    location: Vec<LocationParam>,
}

#[derive(Debug, Default, Deserialize)]
struct ReferenceFile {
    #[serde(default)]
    masked_external_ids: Vec<String>,
    #[serde(default)]
    definitions: Vec<DefinitionEntry>,
}

/// In-memory [`ReferenceData`], built in code or loaded from TOML
#[derive(Debug, Default, Clone)]
pub struct StaticReferenceData {
    definitions: HashMap<String, AlarmDefinition>,
    schemas: HashMap<String, Vec<LocationParam>>,
    masked_external_ids: HashSet<String>,
}

impl StaticReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load definitions from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse definitions from TOML text:
    ///
    /// ```toml
    /// masked_external_ids = ["EXT-9"]
    ///
    /// [[definitions]]
    /// alarm_id = "100"
    /// external_id = "EXT-100"
    /// default_severity = 3
    /// location = [{ name = "board", is_matching_key = true }]
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ReferenceFile = toml::from_str(content)?;
        let mut data = Self::new();
        for entry in file.definitions {
            let alarm_id = entry.definition.alarm_id.clone();
            data.definitions.insert(alarm_id.clone(), entry.definition);
            data.schemas.insert(alarm_id, entry.location);
        }
        data.masked_external_ids = file.masked_external_ids.into_iter().collect();
        Ok(data)
    }

    pub fn with_definition(
        mut self,
        definition: AlarmDefinition,
        schema: Vec<LocationParam>,
    ) -> Self {
        let alarm_id = definition.alarm_id.clone();
        self.definitions.insert(alarm_id.clone(), definition);
        self.schemas.insert(alarm_id, schema);
        self
    }

    /// Hide alarms with this external identifier from the northbound display
    pub fn with_masked_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.masked_external_ids.insert(external_id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl ReferenceData for StaticReferenceData {
    fn definition(&self, alarm_id: &str) -> Option<AlarmDefinition> {
        let mut definition = self.definitions.get(alarm_id.trim())?.clone();
        definition.display_masked |= self.masked_external_ids.contains(&definition.external_id);
        Some(definition)
    }

    fn location_schema(&self, alarm_id: &str) -> Option<Vec<LocationParam>> {
        self.schemas.get(alarm_id.trim()).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_lookup_trims_identifier() {
        let data = reference();
        assert_eq!(data.definition(" 100 ").map(|d| d.default_severity), Some(2));
        assert_eq!(data.location_schema("200").map(|s| s.len()), Some(2));
        assert!(data.definition("999").is_none());
    }

    #[test]
    fn test_masked_external_id_sets_flag() {
        let data = reference().with_masked_external_id("EXT-200");
        assert!(data.definition("200").is_some_and(|d| d.display_masked));
        assert!(data.definition("100").is_some_and(|d| !d.display_masked));
    }

    #[test]
    fn test_from_toml() {
        let data = StaticReferenceData::from_toml_str(
            r#"
            masked_external_ids = ["EXT-7"]

            [[definitions]]
            alarm_id = "7"
            external_id = "EXT-7"
            default_severity = 5
            location = [
                { name = "board", is_matching_key = true },
                { name = "detail" },
            ]
            "#,
        )
        .unwrap();

        let definition = data.definition("7").unwrap();
        assert_eq!(definition.default_severity, 5);
        assert!(definition.display_masked);
        let schema = data.location_schema("7").unwrap();
        assert!(schema[0].is_matching_key);
        assert!(!schema[1].is_matching_key);
    }

    #[test]
    fn test_bad_toml_is_error() {
        assert!(StaticReferenceData::from_toml_str("definitions = 3").is_err());
    }
}
