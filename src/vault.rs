use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::{Error, Result, VaultConfig};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VaultPath(PathBuf);

impl VaultPath {
    pub fn new(rel: impl AsRef<Path>) -> Result<Self> {
        Self::try_from(rel.as_ref())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Vault-relative path with `/` separators.
    pub fn as_str_lossy(&self) -> String {
        self.0
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// File name without extension; the note title.
    pub fn stem(&self) -> String {
        self.0
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string()
    }

    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    }

    /// Parent folder, empty for notes at the vault root.
    pub fn folder(&self) -> String {
        self.0
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    pub fn with_folder(&self, folder: &str) -> Result<Self> {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            return Self::new(self.file_name());
        }
        Self::new(Path::new(folder).join(self.file_name()))
    }
}

impl std::fmt::Display for VaultPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str_lossy())
    }
}

impl TryFrom<&Path> for VaultPath {
    type Error = Error;

    fn try_from(value: &Path) -> Result<Self> {
        if value.as_os_str().is_empty() {
            return Err(Error::InvalidVaultPath("empty path".into()));
        }
        if value.is_absolute() {
            return Err(Error::InvalidVaultPath(
                "absolute paths are not allowed".into(),
            ));
        }

        let mut cleaned = PathBuf::new();
        for c in value.components() {
            match c {
                Component::Prefix(_) | Component::RootDir => {
                    return Err(Error::InvalidVaultPath(
                        "absolute paths are not allowed".into(),
                    ));
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(Error::InvalidVaultPath(
                        "path traversal is not allowed".into(),
                    ));
                }
                Component::Normal(part) => cleaned.push(part),
            }
        }

        if cleaned.as_os_str().is_empty() {
            return Err(Error::InvalidVaultPath("empty path".into()));
        }

        Ok(Self(cleaned))
    }
}

impl TryFrom<&str> for VaultPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from(Path::new(value))
    }
}

/// Storage operations the reaction pipeline needs from the host.
#[async_trait]
pub trait NoteHost: Send + Sync {
    async fn read_note(&self, path: &VaultPath) -> Result<String>;

    async fn write_note(&self, path: &VaultPath, content: &str) -> Result<()>;

    async fn rename_note(&self, from: &VaultPath, to: &VaultPath) -> Result<()>;

    /// Modification time in milliseconds since the unix epoch.
    async fn modified_time(&self, path: &VaultPath) -> Result<i64>;

    fn note_exists(&self, path: &VaultPath) -> bool;

    /// Every note the host manages, sorted.
    fn list_notes(&self) -> Vec<VaultPath>;
}

#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    cfg: VaultConfig,
}

impl Vault {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(root, VaultConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, cfg: VaultConfig) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(Error::VaultNotFound(root));
        }
        let root = std::fs::canonicalize(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self { root, cfg })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.cfg
    }

    pub fn to_abs(&self, rel: &VaultPath) -> PathBuf {
        self.root.join(rel.as_path())
    }

    pub fn to_rel(&self, abs: &Path) -> Result<VaultPath> {
        let abs = if abs.is_absolute() {
            abs.to_path_buf()
        } else {
            self.root.join(abs)
        };

        let abs = std::fs::canonicalize(&abs).unwrap_or(abs);
        if !abs.starts_with(&self.root) {
            return Err(Error::PathOutsideVault(abs));
        }
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| Error::PathOutsideVault(abs.clone()))?;
        VaultPath::try_from(rel)
    }

    pub fn is_ignored_rel(&self, rel: &Path) -> bool {
        rel.components().any(|c| {
            let Component::Normal(part) = c else {
                return false;
            };
            let s = part.to_string_lossy();
            self.cfg.ignore_dirs.iter().any(|d| d == &s)
        })
    }

    /// Markdown notes only; attachments and dotfiles are never managed.
    pub fn is_note_rel(&self, rel: &Path) -> bool {
        if self.is_ignored_rel(rel) || rel.as_os_str().is_empty() {
            return false;
        }
        let file_name = rel.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if file_name.starts_with('.') {
            return false;
        }
        let ext = rel
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        self.cfg.note_extensions.iter().any(|e| e == &ext)
    }

    /// All notes in the vault, sorted by path.
    pub fn notes(&self) -> Vec<VaultPath> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if !self.is_note_rel(rel) {
                continue;
            }
            if let Ok(rel) = VaultPath::try_from(rel) {
                out.push(rel);
            }
        }
        out.sort();
        out
    }
}

#[async_trait]
impl NoteHost for Vault {
    async fn read_note(&self, path: &VaultPath) -> Result<String> {
        let abs = self.to_abs(path);
        tokio::fs::read_to_string(&abs)
            .await
            .map_err(|e| Error::io(&abs, e))
    }

    async fn write_note(&self, path: &VaultPath, content: &str) -> Result<()> {
        let abs = self.to_abs(path);
        tokio::fs::write(&abs, content)
            .await
            .map_err(|e| Error::io(&abs, e))
    }

    async fn rename_note(&self, from: &VaultPath, to: &VaultPath) -> Result<()> {
        let src = self.to_abs(from);
        let dst = self.to_abs(to);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| Error::io(&src, e))
    }

    async fn modified_time(&self, path: &VaultPath) -> Result<i64> {
        let abs = self.to_abs(path);
        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| Error::io(&abs, e))?;
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0))
    }

    fn note_exists(&self, path: &VaultPath) -> bool {
        self.to_abs(path).is_file()
    }

    fn list_notes(&self) -> Vec<VaultPath> {
        self.notes()
    }
}
