use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{debug, error, info, warn};

use crate::frontmatter::{self, FrontmatterDocument};
use crate::vault::{NoteHost, Vault, VaultPath};
use crate::{Error, Result};

/// A fileClass: a named property schema, optionally extending another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileClassDefinition {
    pub name: String,
    pub extends: Option<String>,
    pub map_with_tag: bool,
    /// Tags mapping to this class; the class name itself when empty.
    pub tag_names: Vec<String>,
    pub fields: Vec<String>,
}

impl FileClassDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            map_with_tag: false,
            tag_names: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn extending(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn mapped_to_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map_with_tag = true;
        self.tag_names = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Reads a definition from a fileClass note's frontmatter.
    pub fn from_metadata(name: &str, metadata: &Mapping) -> Self {
        let extends = metadata
            .get("extends")
            .and_then(Value::as_str)
            .map(strip_wikilink)
            .filter(|s| !s.is_empty());
        let map_with_tag = metadata
            .get("mapWithTag")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let tag_names = match metadata.get("tagNames") {
            Some(Value::String(s)) => s
                .split(',')
                .filter_map(normalize_tag)
                .collect(),
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_tag)
                .collect(),
            _ => Vec::new(),
        };
        let fields = match metadata.get("fields") {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Mapping(m) => m.get("name").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Self {
            name: name.to_string(),
            extends,
            map_with_tag,
            tag_names,
            fields,
        }
    }

    /// Tags that resolve to this class when `map_with_tag` is set.
    pub fn mapped_tags(&self) -> Vec<String> {
        if !self.map_with_tag {
            return Vec::new();
        }
        if self.tag_names.is_empty() {
            return normalize_tag(&self.name).into_iter().collect();
        }
        self.tag_names.clone()
    }
}

/// Optional schema capability. Callers check `is_available` and degrade
/// when it is false.
#[async_trait]
pub trait SchemaPlugin: Send + Sync {
    fn is_available(&self) -> bool;

    fn get_file_class_by_name(&self, name: &str) -> Option<FileClassDefinition>;

    /// Adds the class's fields missing from the note's frontmatter. Returns
    /// the number of inserted fields.
    async fn insert_missing_fields(&self, path: &VaultPath, file_class: &str) -> Result<usize>;

    /// Ancestors of `name`, nearest parent first.
    fn get_ancestor_chain(&self, name: &str) -> Vec<String>;

    /// `(tag, class)` pairs for classes mapped from tags.
    fn tag_mapped_classes(&self) -> Vec<(String, String)>;

    /// Picks up edits to the definitions. No-op by default.
    fn refresh(&self) {}

    /// Whether `path` holds a class definition.
    fn is_definition_path(&self, _path: &VaultPath) -> bool {
        false
    }
}

/// Used when no schema source is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

#[async_trait]
impl SchemaPlugin for NoSchema {
    fn is_available(&self) -> bool {
        false
    }

    fn get_file_class_by_name(&self, _name: &str) -> Option<FileClassDefinition> {
        None
    }

    async fn insert_missing_fields(&self, _path: &VaultPath, _file_class: &str) -> Result<usize> {
        Err(Error::ExternalPluginUnavailable("schema"))
    }

    fn get_ancestor_chain(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }

    fn tag_mapped_classes(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SchemaStatus {
    #[default]
    Disabled,
    Loaded {
        source: PathBuf,
        classes: usize,
    },
    Error {
        source: PathBuf,
        error: String,
    },
}

#[derive(Debug, Default)]
struct RegistryState {
    status: SchemaStatus,
    classes: BTreeMap<String, FileClassDefinition>,
}

/// fileClass definitions read from the notes of a vault folder.
pub struct FileClassRegistry {
    host: Arc<dyn NoteHost>,
    vault: Option<Vault>,
    folder: String,
    state: RwLock<RegistryState>,
}

const MAX_CHAIN: usize = 32;

impl FileClassRegistry {
    /// Loads every note under `folder` as a fileClass named after the note.
    pub fn load(vault: Vault, folder: &str) -> Self {
        let registry = Self {
            host: Arc::new(vault.clone()),
            vault: Some(vault),
            folder: folder.trim_matches('/').to_string(),
            state: RwLock::new(RegistryState::default()),
        };
        registry.reload();
        registry
    }

    /// Registry over fixed definitions; the host is still used for field
    /// insertion.
    pub fn from_definitions(
        host: Arc<dyn NoteHost>,
        definitions: impl IntoIterator<Item = FileClassDefinition>,
    ) -> Self {
        let classes: BTreeMap<_, _> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let state = RegistryState {
            status: SchemaStatus::Loaded {
                source: PathBuf::new(),
                classes: classes.len(),
            },
            classes,
        };
        Self {
            host,
            vault: None,
            folder: String::new(),
            state: RwLock::new(state),
        }
    }

    pub fn status(&self) -> SchemaStatus {
        self.read_state().status.clone()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.read_state().classes.keys().cloned().collect()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-reads the definitions folder. Fixed registries are left alone.
    pub fn reload(&self) {
        let Some(vault) = &self.vault else {
            return;
        };
        let dir = vault.root().join(&self.folder);
        let next = if !dir.is_dir() {
            info!(path = %dir.display(), "fileClass folder not found; schema disabled");
            RegistryState::default()
        } else {
            match read_definitions(vault, &self.folder) {
                Ok(classes) => {
                    info!(path = %dir.display(), classes = classes.len(), "fileClasses loaded");
                    RegistryState {
                        status: SchemaStatus::Loaded {
                            source: dir,
                            classes: classes.len(),
                        },
                        classes,
                    }
                }
                Err(err) => {
                    error!(path = %dir.display(), error = %err, "failed to load fileClasses");
                    RegistryState {
                        status: SchemaStatus::Error {
                            source: dir,
                            error: err.to_string(),
                        },
                        classes: BTreeMap::new(),
                    }
                }
            }
        };
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

fn read_definitions(vault: &Vault, folder: &str) -> Result<BTreeMap<String, FileClassDefinition>> {
    let mut classes = BTreeMap::new();
    let prefix = format!("{folder}/");
    for path in vault.notes() {
        let rel = path.as_str_lossy();
        if !rel.starts_with(&prefix) {
            continue;
        }
        let abs = vault.to_abs(&path);
        let text = std::fs::read_to_string(&abs).map_err(|e| Error::io(&abs, e))?;
        let metadata = match frontmatter::parse(&text) {
            Ok(Some(doc)) => doc.metadata,
            Ok(None) => Mapping::new(),
            Err(err) => {
                warn!(path = %rel, error = %err, "skipping fileClass with malformed frontmatter");
                continue;
            }
        };
        let name = path.stem();
        classes.insert(name.clone(), FileClassDefinition::from_metadata(&name, &metadata));
    }
    Ok(classes)
}

#[async_trait]
impl SchemaPlugin for FileClassRegistry {
    fn is_available(&self) -> bool {
        matches!(self.read_state().status, SchemaStatus::Loaded { .. })
    }

    fn get_file_class_by_name(&self, name: &str) -> Option<FileClassDefinition> {
        self.read_state().classes.get(name).cloned()
    }

    async fn insert_missing_fields(&self, path: &VaultPath, file_class: &str) -> Result<usize> {
        let Some(def) = self.get_file_class_by_name(file_class) else {
            debug!(class = file_class, "unknown fileClass; nothing to insert");
            return Ok(0);
        };

        let text = self.host.read_note(path).await?;
        let mut doc = match FrontmatterDocument::parse(&text)? {
            Some(doc) => doc,
            None => FrontmatterDocument {
                metadata: Mapping::new(),
                body: text,
            },
        };

        let mut inserted = 0;
        for field in &def.fields {
            let key = Value::String(field.clone());
            if !doc.metadata.contains_key(&key) {
                doc.metadata.insert(key, Value::Null);
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.host.write_note(path, &doc.to_text()?).await?;
            debug!(path = %path, class = file_class, inserted, "inserted missing fields");
        }
        Ok(inserted)
    }

    fn get_ancestor_chain(&self, name: &str) -> Vec<String> {
        let state = self.read_state();
        let mut chain: Vec<String> = Vec::new();
        let mut current = state.classes.get(name).and_then(|d| d.extends.clone());
        while let Some(parent) = current {
            if parent == name || chain.contains(&parent) || chain.len() >= MAX_CHAIN {
                break;
            }
            current = state.classes.get(&parent).and_then(|d| d.extends.clone());
            chain.push(parent);
        }
        chain
    }

    fn tag_mapped_classes(&self) -> Vec<(String, String)> {
        self.read_state()
            .classes
            .values()
            .flat_map(|def| {
                def.mapped_tags()
                    .into_iter()
                    .map(move |tag| (tag, def.name.clone()))
            })
            .collect()
    }

    fn refresh(&self) {
        self.reload();
    }

    fn is_definition_path(&self, path: &VaultPath) -> bool {
        !self.folder.is_empty() && path.as_str_lossy().starts_with(&format!("{}/", self.folder))
    }
}

fn strip_wikilink(raw: &str) -> String {
    let s = raw.trim();
    let s = s
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
        .unwrap_or(s);
    let s = s.split('|').next().unwrap_or(s);
    s.trim().to_string()
}

/// Lowercased tag without `#` or surrounding slashes.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let s = raw.trim();
    let s = s.strip_prefix('#').unwrap_or(s).trim();
    let s = s.trim_matches('/').trim();
    if s.is_empty() {
        return None;
    }
    Some(s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &std::path::Path, rel: &str, text: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, text).unwrap();
    }

    fn vault_with_classes() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "fileClasses/default-basic.md",
            "---\nfields:\n  - name: created\n---\n",
        );
        write(
            root,
            "fileClasses/default.md",
            "---\nextends: default-basic\nfields:\n  - status\n---\n",
        );
        write(
            root,
            "fileClasses/book.md",
            "---\nextends: \"[[default]]\"\nmapWithTag: true\ntagNames: [book, reading]\nfields:\n  - name: author\n  - name: pages\n---\n",
        );
        let vault = Vault::open(root).unwrap();
        (dir, vault)
    }

    #[test]
    fn parses_definitions() {
        let mut meta = Mapping::new();
        meta.insert("extends".into(), "[[base|Base]]".into());
        meta.insert("mapWithTag".into(), true.into());
        meta.insert("tagNames".into(), "#Novel, scifi/".into());
        let def = FileClassDefinition::from_metadata("novel", &meta);
        assert_eq!(def.extends.as_deref(), Some("base"));
        assert_eq!(def.mapped_tags(), vec!["novel", "scifi"]);
    }

    #[test]
    fn loads_folder_and_walks_ancestors() {
        let (_dir, vault) = vault_with_classes();
        let registry = FileClassRegistry::load(vault, "fileClasses");
        assert!(registry.is_available());
        assert_eq!(registry.class_names(), vec!["book", "default", "default-basic"]);
        assert_eq!(
            registry.get_ancestor_chain("book"),
            vec!["default".to_string(), "default-basic".to_string()]
        );
        let mut tags = registry.tag_mapped_classes();
        tags.sort();
        assert_eq!(
            tags,
            vec![
                ("book".to_string(), "book".to_string()),
                ("reading".to_string(), "book".to_string()),
            ]
        );
    }

    #[test]
    fn missing_folder_disables_schema() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let registry = FileClassRegistry::load(vault, "fileClasses");
        assert!(!registry.is_available());
        assert_eq!(registry.status(), SchemaStatus::Disabled);
    }

    #[test]
    fn cyclic_extends_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let registry = FileClassRegistry::from_definitions(
            Arc::new(vault),
            [
                FileClassDefinition::new("a").extending("b"),
                FileClassDefinition::new("b").extending("c"),
                FileClassDefinition::new("c").extending("a"),
            ],
        );
        assert_eq!(registry.get_ancestor_chain("a"), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn inserts_only_missing_fields() {
        let (dir, vault) = vault_with_classes();
        write(dir.path(), "Dune.md", "---\ntitle: Dune\nauthor: Herbert\n---\nbody\n");
        let registry = FileClassRegistry::load(vault, "fileClasses");
        let path = VaultPath::new("Dune.md").unwrap();

        let inserted = registry.insert_missing_fields(&path, "book").await.unwrap();
        assert_eq!(inserted, 1);
        let text = std::fs::read_to_string(dir.path().join("Dune.md")).unwrap();
        assert_eq!(text, "---\ntitle: Dune\nauthor: Herbert\npages: null\n---\nbody\n");

        let again = registry.insert_missing_fields(&path, "book").await.unwrap();
        assert_eq!(again, 0);
    }
}
