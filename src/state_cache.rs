//! Per-note change detection.
//!
//! A [`FileState`] fingerprints a note's title and raw frontmatter. The cache
//! compares each new observation against the stored one so that saves which
//! only touch the body or the modification time never trigger a reaction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::frontmatter::raw_frontmatter;
use crate::vault::{NoteHost, VaultPath};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub checksum: String,
    #[serde(default)]
    pub file_class: Option<String>,
    #[serde(default)]
    pub modification_time: i64,
}

impl FileState {
    pub fn compute(
        path: &VaultPath,
        content: &str,
        file_class: Option<String>,
        modification_time: i64,
    ) -> Self {
        Self {
            checksum: checksum(&path.stem(), raw_frontmatter(content).unwrap_or_default()),
            file_class,
            modification_time,
        }
    }
}

/// SHA-256 over `title + "\n" + frontmatter`, hex encoded.
pub fn checksum(title: &str, frontmatter: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(frontmatter.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Nothing was cached; the state is stored without a reaction.
    First,
    /// Same checksum as before.
    Unchanged,
    Changed {
        old_file_class: Option<String>,
        new_file_class: Option<String>,
    },
}

impl Observation {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

#[derive(Debug, Default)]
pub struct FileStateCache {
    entries: Mutex<BTreeMap<String, FileState>>,
    store: Option<PathBuf>,
}

impl FileStateCache {
    /// In-memory cache; `load`/`flush` are no-ops.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache persisted as JSON at `store`.
    pub fn persistent(store: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::default(),
            store: Some(store.into()),
        }
    }

    pub fn store_path(&self) -> Option<&PathBuf> {
        self.store.as_ref()
    }

    pub fn get(&self, path: &VaultPath) -> Option<FileState> {
        self.lock().get(&key(path)).cloned()
    }

    pub fn set(&self, path: &VaultPath, state: FileState) {
        self.lock().insert(key(path), state);
    }

    pub fn delete(&self, path: &VaultPath) -> Option<FileState> {
        self.lock().remove(&key(path))
    }

    /// Moves the entry for `from` to `to`. Returns whether one existed.
    pub fn rename(&self, from: &VaultPath, to: &VaultPath) -> bool {
        let mut entries = self.lock();
        match entries.remove(&key(from)) {
            Some(state) => {
                entries.insert(key(to), state);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Compares `new` to the cached state and stores it unless unchanged.
    pub fn observe(&self, path: &VaultPath, new: FileState) -> Observation {
        let mut entries = self.lock();
        let k = key(path);
        match entries.get(&k) {
            None => {
                entries.insert(k, new);
                Observation::First
            }
            Some(old) if old.checksum == new.checksum => Observation::Unchanged,
            Some(old) => {
                let old_file_class = old.file_class.clone();
                let new_file_class = new.file_class.clone();
                entries.insert(k, new);
                Observation::Changed {
                    old_file_class,
                    new_file_class,
                }
            }
        }
    }

    /// Replaces the in-memory entries with the stored file. A missing file
    /// yields an empty cache; an unreadable one is logged and ignored.
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let text = match tokio::fs::read_to_string(store).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %store.display(), "no file state yet");
                return Ok(0);
            }
            Err(err) => return Err(Error::io(store, err)),
        };
        let loaded: BTreeMap<String, FileState> = match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(err) => {
                warn!(path = %store.display(), error = %err, "discarding unreadable file state");
                BTreeMap::new()
            }
        };
        let count = loaded.len();
        *self.lock() = loaded;
        info!(path = %store.display(), entries = count, "file state loaded");
        Ok(count)
    }

    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let text = {
            let entries = self.lock();
            serde_json::to_string(&*entries).map_err(|e| Error::FileState(e.to_string()))?
        };
        if let Some(parent) = store.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        tokio::fs::write(store, text)
            .await
            .map_err(|e| Error::io(store, e))
    }

    /// Drops entries whose notes no longer exist, then flushes.
    pub async fn cleanup(&self, host: &dyn NoteHost) -> Result<usize> {
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|k, _| {
                VaultPath::new(k)
                    .map(|p| host.note_exists(&p))
                    .unwrap_or(false)
            });
            before - entries.len()
        };
        if removed > 0 {
            info!(removed, "dropped stale file state");
        }
        self.flush().await?;
        Ok(removed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, FileState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key(path: &VaultPath) -> String {
    path.as_str_lossy()
}
