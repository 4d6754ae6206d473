use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Directory names to ignore anywhere in the path.
    pub ignore_dirs: Vec<String>,
    /// File extensions (without dot) that are considered notes.
    pub note_extensions: Vec<String>,
    /// Debounce window for editor-style saves (active file changes).
    pub save_debounce: Duration,
    /// Debounce window for raw filesystem events.
    pub watch_debounce: Duration,
    /// Plugin data directory (relative to vault root).
    pub plugin_dir: PathBuf,
}

impl VaultConfig {
    pub fn settings_path(&self) -> PathBuf {
        self.plugin_dir.join("data.json")
    }

    pub fn file_state_path(&self) -> PathBuf {
        self.plugin_dir.join("file-state.json")
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![
                ".obsidian".into(),
                ".git".into(),
                ".trash".into(),
                "node_modules".into(),
            ],
            note_extensions: vec!["md".into()],
            save_debounce: Duration::from_millis(1000),
            watch_debounce: Duration::from_millis(500),
            plugin_dir: PathBuf::from(".obsidian/plugins/oxiprops"),
        }
    }
}
