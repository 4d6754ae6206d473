//! Persisted plugin settings.
//!
//! Settings are plain records with no behavior; they are stored as the
//! plugin-data JSON blob under the vault's plugin directory.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingPolicy {
    pub ordered_keys: Vec<String>,
    pub unknown_first: bool,
}

impl OrderingPolicy {
    /// Builds a policy, dropping repeated keys (first occurrence wins).
    pub fn new(ordered_keys: impl IntoIterator<Item = impl Into<String>>, unknown_first: bool) -> Self {
        let mut policy = Self {
            ordered_keys: ordered_keys.into_iter().map(Into::into).collect(),
            unknown_first,
        };
        policy.dedup();
        policy
    }

    pub fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.ordered_keys.retain(|k| seen.insert(k.clone()));
    }
}

impl Default for OrderingPolicy {
    fn default() -> Self {
        Self::new(["fileClass", "title", "aliases", "tags"], false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFileClassMapping {
    pub pattern: String,
    pub file_class: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub order: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefaultValueScript {
    pub property_name: String,
    pub script_body: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub owning_file_classes: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DefaultsSettings {
    pub enabled: bool,
    /// Run scripts for properties the note does not have at all. When off,
    /// only present but blank properties are filled.
    pub fill_absent: bool,
    pub scripts: Vec<PropertyDefaultValueScript>,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fill_absent: true,
            scripts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileClassSettings {
    /// Frontmatter key naming the note's fileClass.
    pub field: String,
    /// Alternative key checked when `field` is absent.
    pub alias: String,
    /// Folder holding fileClass definition notes.
    pub classes_folder: String,
    /// Resolve fileClass from hashtags of tag-mapped classes.
    pub map_with_tags: bool,
    pub folder_mappings: Vec<FolderFileClassMapping>,
    /// Insert missing fields from the ancestor chain on change.
    pub auto_insert_fields: bool,
    /// Move notes to their fileClass folder after processing.
    pub auto_move: bool,
    /// fileClass name to destination folder.
    pub class_folders: BTreeMap<String, String>,
}

impl Default for FileClassSettings {
    fn default() -> Self {
        Self {
            field: "fileClass".into(),
            alias: "fileclass".into(),
            classes_folder: "fileClasses".into(),
            map_with_tags: true,
            folder_mappings: Vec::new(),
            auto_insert_fields: true,
            auto_move: false,
            class_folders: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub sort_on_change: bool,
    pub ordering: OrderingPolicy,
    pub file_class: FileClassSettings,
    pub defaults: DefaultsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sort_on_change: true,
            ordering: OrderingPolicy::default(),
            file_class: FileClassSettings::default(),
            defaults: DefaultsSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings not found; using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(Error::io(path, err)),
        };
        Self::from_json_str(&text)
    }

    pub fn from_json_str(input: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_json::from_str(input).map_err(|err| Error::Settings(err.to_string()))?;
        settings.normalize();
        Ok(settings)
    }

    /// Imports settings from a TOML file using the same field names.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let mut settings: Settings =
            toml::from_str(input).map_err(|err| Error::Settings(err.to_string()))?;
        settings.normalize();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let text =
            serde_json::to_string_pretty(self).map_err(|err| Error::Settings(err.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::io(path, e))
    }

    fn normalize(&mut self) {
        self.ordering.dedup();
        self.file_class
            .folder_mappings
            .sort_by_key(|m| m.order);
        self.defaults.scripts.sort_by_key(|s| s.order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_drops_duplicate_keys() {
        let p = OrderingPolicy::new(["a", "b", "a", "c", "b"], true);
        assert_eq!(p.ordered_keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let s = Settings::from_json_str(
            r#"{
                "ordering": { "orderedKeys": ["title", "title", "date"], "unknownFirst": true },
                "fileClass": {
                    "folderMappings": [
                        { "pattern": "b/*", "fileClass": "second", "order": 2 },
                        { "pattern": "a/*", "fileClass": "first", "order": 1 }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(s.ordering.ordered_keys, vec!["title", "date"]);
        assert!(s.ordering.unknown_first);
        assert_eq!(s.file_class.field, "fileClass");
        assert_eq!(s.file_class.folder_mappings[0].file_class, "first");
        assert!(s.defaults.enabled);
    }

    #[test]
    fn toml_import() {
        let s = Settings::from_toml_str(
            r#"
sortOnChange = false

[ordering]
orderedKeys = ["fileClass", "title"]
unknownFirst = false

[[defaults.scripts]]
propertyName = "created"
scriptBody = "return utils.now('YYYY-MM-DD');"
"#,
        )
        .unwrap();
        assert!(!s.sort_on_change);
        assert_eq!(s.defaults.scripts.len(), 1);
        assert!(s.defaults.scripts[0].enabled);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin/data.json");
        let mut s = Settings::default();
        s.file_class.auto_move = true;
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
        assert_eq!(
            Settings::load(&dir.path().join("missing.json")).unwrap(),
            Settings::default()
        );
    }
}
