use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::protocol::types::{JobClass, SkillCode};

/// Skill code -> display name. Loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SkillCatalog {
    names: HashMap<SkillCode, String>,
}

impl SkillCatalog {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (SkillCode, S)>,
        S: Into<String>,
    {
        Self { names: entries.into_iter().map(|(code, name)| (code, name.into())).collect() }
    }

    /// Reads a JSON object of `"skillCode": "name"` pairs, either at the top
    /// level or under a `"data"` key.
    ///
    /// Never fails: a missing or broken file yields an empty catalog and the
    /// meter simply shows unnamed skills.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("[Catalog] Failed to read {}: {}", path.display(), e);
                return Self::default();
            }
        };

        let json: serde_json::Value = match serde_json::from_str(&content) {
            Ok(j) => j,
            Err(e) => {
                warn!("[Catalog] JSON Syntax Error in {}: {}", path.display(), e);
                return Self::default();
            }
        };

        let Some(data) = json.get("data").unwrap_or(&json).as_object() else {
            warn!("[Catalog] {} is not a JSON object", path.display());
            return Self::default();
        };

        let mut names = HashMap::with_capacity(data.len());
        for (key, value) in data {
            match (key.trim().parse::<SkillCode>(), value.as_str()) {
                (Ok(code), Some(name)) => {
                    names.insert(code, name.to_string());
                }
                _ => warn!("[Catalog] Skipping entry {:?}", key),
            }
        }

        info!("[Catalog] Loaded {} skill names.", names.len());
        Self { names }
    }

    /// Display name, or "" for unknown codes.
    pub fn lookup_name(&self, skill: SkillCode) -> &str {
        self.names.get(&skill).map(String::as_str).unwrap_or("")
    }

    pub fn classify(&self, skill: SkillCode) -> Option<JobClass> {
        JobClass::from_skill_code(skill)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_flat_and_nested_catalogs() {
        let dir = tempfile::tempdir().unwrap();

        let flat = dir.path().join("flat.json");
        fs::write(&flat, r#"{ "11020001": "내려찍기", "17010050": "대지의 응보" }"#).unwrap();
        let catalog = SkillCatalog::load(&flat);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.lookup_name(11_020_001), "내려찍기");

        let nested = dir.path().join("nested.json");
        fs::write(&nested, r#"{ "data": { "12010000": "방패 강타", "oops": "x", "12010001": 5 } }"#).unwrap();
        let catalog = SkillCatalog::load(&nested);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.lookup_name(12_010_000), "방패 강타");
    }

    #[test]
    fn unknown_code_has_empty_name() {
        let catalog = SkillCatalog::from_entries([(11_020_001, "Slash")]);
        assert_eq!(catalog.lookup_name(11_020_002), "");
    }

    #[test]
    fn broken_or_missing_file_yields_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SkillCatalog::load(&dir.path().join("missing.json")).is_empty());

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert!(SkillCatalog::load(&broken).is_empty());
    }

    #[test]
    fn classify_delegates_to_job_ranges() {
        let catalog = SkillCatalog::default();
        assert_eq!(catalog.classify(14_020_000), Some(JobClass::Ranger));
        assert_eq!(catalog.classify(99), None);
    }
}
