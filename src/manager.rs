//! Reacts to note events.
//!
//! Every change event computes a fresh [`FileState`] and runs it through the
//! [`FileStateCache`]. Only a changed title or frontmatter schedules a
//! reaction, and reactions go through a per-path [`DebounceManager`] so that
//! at most one pipeline run touches a note at a time.
//!
//! The pipeline itself: insert missing fileClass fields (ancestors first),
//! sort, backfill defaults, sort again if keys were added, write, and
//! optionally move the note into its fileClass folder. Writes and moves made
//! by the pipeline leave a marker so the event they cause is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::debounce::{DebounceManager, KeyState, Scheduler, TokioScheduler};
use crate::defaults::{ScriptNotice, resolve_defaults};
use crate::fileclass::{insert_fields_layered, resolve_file_class};
use crate::frontmatter;
use crate::lint::ScriptLinter;
use crate::schema::{NoSchema, SchemaPlugin};
use crate::script_host::{FileIdentity, JsScriptHost, ScriptHost, ScriptUtilities};
use crate::service::HostEvent;
use crate::settings::Settings;
use crate::sorter::sort_properties;
use crate::state_cache::{FileState, FileStateCache, Observation};
use crate::templating::ChronoTemplating;
use crate::vault::{NoteHost, VaultPath};
use crate::{Error, Result, VaultConfig};

/// Where an event came from; selects the debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Editor saves and focus changes.
    Editor,
    /// Raw filesystem notifications.
    Watcher,
}

/// Payload carried through the debouncer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reaction {
    pub old_file_class: Option<String>,
    pub new_file_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Caused by the pipeline's own write or move.
    SelfTriggered,
    /// First sighting; state stored without a reaction.
    Recorded,
    Unchanged,
    Scheduled,
    Forgotten,
    /// The note is a fileClass definition; the registry was refreshed.
    SchemaRefreshed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unmanaged,
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessReport {
    pub file_class: Option<String>,
    pub inserted_fields: usize,
    pub filled: Vec<String>,
    pub notices: Vec<ScriptNotice>,
    pub written: bool,
    pub moved_to: Option<VaultPath>,
    pub skipped: Option<SkipReason>,
}

impl ProcessReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub processed: usize,
    pub written: usize,
    pub skipped: usize,
    pub failures: Vec<(VaultPath, String)>,
}

#[derive(Default)]
struct Markers {
    /// Expected checksum after a pipeline write.
    writes: HashMap<VaultPath, String>,
    renames: HashSet<(VaultPath, VaultPath)>,
}

struct Pipeline {
    host: Arc<dyn NoteHost>,
    settings: RwLock<Arc<Settings>>,
    schema: Arc<dyn SchemaPlugin>,
    utils: Arc<dyn ScriptUtilities>,
    scripts: Arc<dyn ScriptHost>,
    cache: Arc<FileStateCache>,
    markers: Mutex<Markers>,
}

pub struct PropertyManagerBuilder {
    host: Arc<dyn NoteHost>,
    settings: Settings,
    config: VaultConfig,
    schema: Arc<dyn SchemaPlugin>,
    utils: Arc<dyn ScriptUtilities>,
    scripts: Option<Arc<dyn ScriptHost>>,
    cache: Option<Arc<FileStateCache>>,
    scheduler: Arc<dyn Scheduler>,
}

impl PropertyManagerBuilder {
    pub fn schema(mut self, schema: Arc<dyn SchemaPlugin>) -> Self {
        self.schema = schema;
        self
    }

    pub fn utilities(mut self, utils: Arc<dyn ScriptUtilities>) -> Self {
        self.utils = utils;
        self
    }

    pub fn script_host(mut self, scripts: Arc<dyn ScriptHost>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn cache(mut self, cache: Arc<FileStateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn build(self) -> PropertyManager {
        let linter = Arc::new(ScriptLinter::default());
        let scripts = self
            .scripts
            .unwrap_or_else(|| Arc::new(JsScriptHost::new(Arc::clone(&linter))));
        let pipeline = Arc::new(Pipeline {
            host: self.host,
            settings: RwLock::new(Arc::new(self.settings)),
            schema: self.schema,
            utils: self.utils,
            scripts,
            cache: self.cache.unwrap_or_default(),
            markers: Mutex::default(),
        });

        let for_callback = Arc::clone(&pipeline);
        let debounce = DebounceManager::new(
            self.config.save_debounce,
            self.scheduler,
            move |path: VaultPath, reaction: Reaction| {
                let pipeline = Arc::clone(&for_callback);
                async move { pipeline.react(path, reaction).await }
            },
        );

        PropertyManager {
            pipeline,
            debounce,
            linter,
            editor_delay: self.config.save_debounce,
            watcher_delay: self.config.watch_debounce,
        }
    }
}

/// Owns the file-state cache, the debouncer and the pipeline for one vault.
pub struct PropertyManager {
    pipeline: Arc<Pipeline>,
    debounce: DebounceManager<VaultPath, Reaction>,
    linter: Arc<ScriptLinter>,
    editor_delay: Duration,
    watcher_delay: Duration,
}

impl PropertyManager {
    /// Defaults: no schema, chrono templating, the JS script host, an
    /// in-memory cache and the tokio scheduler.
    pub fn builder(
        host: Arc<dyn NoteHost>,
        settings: Settings,
        config: VaultConfig,
    ) -> PropertyManagerBuilder {
        PropertyManagerBuilder {
            host,
            settings,
            config,
            schema: Arc::new(NoSchema),
            utils: Arc::new(ChronoTemplating::default()),
            scripts: None,
            cache: None,
            scheduler: Arc::new(TokioScheduler),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.pipeline.settings()
    }

    pub fn set_settings(&self, settings: Settings) {
        *self
            .pipeline
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(settings);
    }

    pub fn cache(&self) -> &Arc<FileStateCache> {
        &self.pipeline.cache
    }

    pub fn schema(&self) -> &Arc<dyn SchemaPlugin> {
        &self.pipeline.schema
    }

    pub fn linter(&self) -> &Arc<ScriptLinter> {
        &self.linter
    }

    pub fn reaction_state(&self, path: &VaultPath) -> KeyState {
        self.debounce.state(path)
    }

    /// Loads persisted file state and drops entries for vanished notes.
    pub async fn start(&self) -> Result<usize> {
        let cache = &self.pipeline.cache;
        let loaded = cache.load().await?;
        cache.cleanup(self.pipeline.host.as_ref()).await?;
        Ok(loaded)
    }

    /// Cancels pending reactions, flushes and clears the caches. A running
    /// reaction finishes on its own.
    pub async fn shutdown(&self) {
        self.debounce.clear();
        self.linter.clear();
        self.pipeline.persist().await;
        self.pipeline.cache.clear();
        let mut markers = self.pipeline.markers();
        markers.writes.clear();
        markers.renames.clear();
    }

    pub async fn handle(&self, event: HostEvent) -> EventOutcome {
        match event {
            HostEvent::MetadataChanged(path) => self.on_metadata_changed(&path).await,
            HostEvent::ActiveFileChanged(path) => self.on_active_file_changed(&path).await,
            HostEvent::Modified(path) => self.on_file_modified(&path).await,
            HostEvent::Created(path) => self.on_file_created(&path).await,
            HostEvent::Deleted(path) => self.on_file_deleted(&path).await,
            HostEvent::Renamed { from, to } => self.on_file_renamed(&from, &to).await,
        }
    }

    pub async fn on_metadata_changed(&self, path: &VaultPath) -> EventOutcome {
        self.on_change(path, EventOrigin::Editor).await
    }

    pub async fn on_active_file_changed(&self, path: &VaultPath) -> EventOutcome {
        self.on_change(path, EventOrigin::Editor).await
    }

    pub async fn on_file_modified(&self, path: &VaultPath) -> EventOutcome {
        self.on_change(path, EventOrigin::Watcher).await
    }

    /// New notes are recorded and, when a fileClass resolves for them,
    /// processed.
    pub async fn on_file_created(&self, path: &VaultPath) -> EventOutcome {
        if self.refresh_if_definition(path) {
            return EventOutcome::SchemaRefreshed;
        }
        let state = match self.pipeline.current_state(path).await {
            Ok(state) => state,
            Err(err) => return failed(path, err),
        };
        if self.pipeline.take_write_marker(path, &state.checksum) {
            self.pipeline.cache.set(path, state);
            return EventOutcome::SelfTriggered;
        }
        let new_file_class = state.file_class.clone();
        match self.pipeline.cache.observe(path, state) {
            Observation::Unchanged => EventOutcome::Unchanged,
            Observation::First if new_file_class.is_none() => EventOutcome::Recorded,
            Observation::First => {
                self.schedule(
                    path,
                    Reaction {
                        old_file_class: None,
                        new_file_class,
                    },
                    EventOrigin::Watcher,
                );
                EventOutcome::Scheduled
            }
            Observation::Changed {
                old_file_class,
                new_file_class,
            } => {
                self.schedule(
                    path,
                    Reaction {
                        old_file_class,
                        new_file_class,
                    },
                    EventOrigin::Watcher,
                );
                EventOutcome::Scheduled
            }
        }
    }

    pub async fn on_file_deleted(&self, path: &VaultPath) -> EventOutcome {
        if self.refresh_if_definition(path) {
            return EventOutcome::SchemaRefreshed;
        }
        {
            // A move reported as delete plus create never consumes its marker.
            let mut markers = self.pipeline.markers();
            markers.writes.remove(path);
            markers.renames.retain(|(from, _)| from != path);
        }
        if self.pipeline.cache.delete(path).is_some() {
            self.pipeline.persist().await;
        }
        EventOutcome::Forgotten
    }

    /// Carries cached state to the new path. Moves made by the pipeline
    /// stop there; user renames are re-checked since the title is part of
    /// the checksum.
    pub async fn on_file_renamed(&self, from: &VaultPath, to: &VaultPath) -> EventOutcome {
        if self.pipeline.take_rename_marker(from, to) {
            self.pipeline.cache.rename(from, to);
            return EventOutcome::SelfTriggered;
        }
        let from_def = self.pipeline.schema.is_definition_path(from);
        if from_def || self.pipeline.schema.is_definition_path(to) {
            self.pipeline.schema.refresh();
            return EventOutcome::SchemaRefreshed;
        }
        if self.pipeline.cache.rename(from, to) {
            self.pipeline.persist().await;
        }
        self.on_change(to, EventOrigin::Watcher).await
    }

    /// Runs the pipeline on one note right away.
    pub async fn process_file(&self, path: &VaultPath) -> Result<ProcessReport> {
        let report = self.pipeline.process(path).await?;
        self.pipeline.persist().await;
        Ok(report)
    }

    /// Sorts one note's properties. Returns whether the note was rewritten.
    pub async fn sort_file(&self, path: &VaultPath) -> Result<bool> {
        self.pipeline.sort(path).await
    }

    /// Runs the pipeline on every note. Per-note failures are collected.
    pub async fn auto_update_vault(&self) -> Result<BatchReport> {
        let settings = self.pipeline.settings();
        if settings.file_class.auto_insert_fields && !self.pipeline.schema.is_available() {
            return Err(Error::ExternalPluginUnavailable("schema"));
        }

        let mut report = BatchReport::default();
        for path in self.pipeline.host.list_notes() {
            if self.pipeline.schema.is_definition_path(&path) {
                continue;
            }
            match self.pipeline.process(&path).await {
                Ok(outcome) => {
                    report.processed += 1;
                    if outcome.written {
                        report.written += 1;
                    }
                    if outcome.skipped.is_some() {
                        report.skipped += 1;
                    }
                }
                Err(err) => {
                    warn!(path = %path, error = %err, "note failed during batch update");
                    report.failures.push((path, err.to_string()));
                }
            }
        }
        self.pipeline.persist().await;
        info!(
            processed = report.processed,
            written = report.written,
            failed = report.failures.len(),
            "vault update finished"
        );
        Ok(report)
    }

    async fn on_change(&self, path: &VaultPath, origin: EventOrigin) -> EventOutcome {
        if self.refresh_if_definition(path) {
            return EventOutcome::SchemaRefreshed;
        }
        let state = match self.pipeline.current_state(path).await {
            Ok(state) => state,
            Err(err) => return failed(path, err),
        };
        if self.pipeline.take_write_marker(path, &state.checksum) {
            self.pipeline.cache.set(path, state);
            return EventOutcome::SelfTriggered;
        }
        match self.pipeline.cache.observe(path, state) {
            Observation::First => EventOutcome::Recorded,
            Observation::Unchanged => EventOutcome::Unchanged,
            Observation::Changed {
                old_file_class,
                new_file_class,
            } => {
                self.schedule(
                    path,
                    Reaction {
                        old_file_class,
                        new_file_class,
                    },
                    origin,
                );
                EventOutcome::Scheduled
            }
        }
    }

    fn schedule(&self, path: &VaultPath, reaction: Reaction, origin: EventOrigin) {
        let delay = match origin {
            EventOrigin::Editor => self.editor_delay,
            EventOrigin::Watcher => self.watcher_delay,
        };
        debug!(path = %path, ?origin, "reaction scheduled");
        self.debounce.schedule_in(path.clone(), reaction, delay);
    }

    fn refresh_if_definition(&self, path: &VaultPath) -> bool {
        if self.pipeline.schema.is_definition_path(path) {
            debug!(path = %path, "fileClass definition changed");
            self.pipeline.schema.refresh();
            return true;
        }
        false
    }
}

fn failed(path: &VaultPath, err: Error) -> EventOutcome {
    error!(path = %path, error = %err, "failed to handle note event");
    EventOutcome::Failed(err.to_string())
}

impl Pipeline {
    fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn markers(&self) -> std::sync::MutexGuard<'_, Markers> {
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn current_state(&self, path: &VaultPath) -> Result<FileState> {
        let content = self.host.read_note(path).await?;
        let modified = self.host.modified_time(path).await?;
        let file_class = self.file_class_of(path, &content);
        Ok(FileState::compute(path, &content, file_class, modified))
    }

    fn file_class_of(&self, path: &VaultPath, content: &str) -> Option<String> {
        let settings = self.settings();
        let (metadata, body) = match frontmatter::parse(content) {
            Ok(Some(doc)) => (doc.metadata, doc.body),
            _ => (serde_yaml::Mapping::new(), content.to_string()),
        };
        resolve_file_class(
            path,
            &metadata,
            &body,
            &settings.file_class,
            self.schema.as_ref(),
        )
    }

    /// Consumes the write marker for `path`. True when the note still holds
    /// exactly what the pipeline wrote.
    fn take_write_marker(&self, path: &VaultPath, checksum: &str) -> bool {
        match self.markers().writes.remove(path) {
            Some(expected) if expected == checksum => {
                debug!(path = %path, "ignoring event from own write");
                true
            }
            Some(_) => {
                debug!(path = %path, "note changed again after own write");
                false
            }
            None => false,
        }
    }

    fn take_rename_marker(&self, from: &VaultPath, to: &VaultPath) -> bool {
        self.markers()
            .renames
            .remove(&(from.clone(), to.clone()))
    }

    async fn react(&self, path: VaultPath, reaction: Reaction) {
        if !self.host.note_exists(&path) {
            debug!(path = %path, "note vanished before reaction");
            return;
        }
        if reaction.old_file_class != reaction.new_file_class {
            info!(
                path = %path,
                old = ?reaction.old_file_class,
                new = ?reaction.new_file_class,
                "fileClass changed"
            );
        }
        match self.process(&path).await {
            Ok(report) => {
                debug!(path = %path, written = report.written, "reaction finished");
                self.persist().await;
            }
            Err(err) => error!(path = %path, error = %err, "reaction failed"),
        }
    }

    async fn process(&self, path: &VaultPath) -> Result<ProcessReport> {
        let settings = self.settings();
        let mut content = self.host.read_note(path).await?;
        let mut doc = match frontmatter::parse(&content) {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(path = %path, "no frontmatter; note left alone");
                return Ok(ProcessReport::skipped(SkipReason::Unmanaged));
            }
            Err(err) => {
                warn!(path = %path, error = %err, "malformed frontmatter; note left alone");
                return Ok(ProcessReport::skipped(SkipReason::Malformed(err.to_string())));
            }
        };

        let file_class = resolve_file_class(
            path,
            &doc.metadata,
            &doc.body,
            &settings.file_class,
            self.schema.as_ref(),
        );
        let mut report = ProcessReport {
            file_class: file_class.clone(),
            ..ProcessReport::default()
        };

        if let Some(class) = &file_class {
            if settings.file_class.auto_insert_fields && self.schema.is_available() {
                report.inserted_fields =
                    insert_fields_layered(path, class, self.schema.as_ref()).await?;
                if report.inserted_fields > 0 {
                    content = self.host.read_note(path).await?;
                    doc = match frontmatter::parse(&content)? {
                        Some(doc) => doc,
                        None => return Ok(report),
                    };
                }
            }
        }

        let before = doc.metadata.clone();
        let metadata = if settings.sort_on_change {
            sort_properties(&doc.metadata, &settings.ordering)
        } else {
            doc.metadata
        };
        let outcome = resolve_defaults(
            file_class.as_deref(),
            &FileIdentity::from_path(path),
            metadata,
            &settings.defaults,
            self.scripts.as_ref(),
            Arc::clone(&self.utils),
        )
        .await;
        let added = outcome.added_keys(&before);
        let mut metadata = outcome.metadata;
        if added && settings.sort_on_change {
            metadata = sort_properties(&metadata, &settings.ordering);
        }
        report.filled = outcome.filled;
        report.notices = outcome.notices;

        let text = frontmatter::serialize(&metadata, &doc.body)?;
        if text != content {
            self.write_marked(path, &text).await?;
            report.written = true;
            info!(path = %path, filled = report.filled.len(), "note updated");
        }

        let modified = self.host.modified_time(path).await.unwrap_or_default();
        self.cache
            .set(path, FileState::compute(path, &text, file_class.clone(), modified));

        if let Some(class) = &file_class {
            if settings.file_class.auto_move {
                report.moved_to = self.move_to_class_folder(path, class, &settings).await?;
            }
        }
        Ok(report)
    }

    async fn sort(&self, path: &VaultPath) -> Result<bool> {
        let settings = self.settings();
        let content = self.host.read_note(path).await?;
        let Some(doc) = frontmatter::parse(&content)? else {
            return Ok(false);
        };
        let sorted = sort_properties(&doc.metadata, &settings.ordering);
        let text = frontmatter::serialize(&sorted, &doc.body)?;
        if text == content {
            return Ok(false);
        }
        self.write_marked(path, &text).await?;
        info!(path = %path, "properties sorted");
        Ok(true)
    }

    async fn write_marked(&self, path: &VaultPath, text: &str) -> Result<()> {
        let expected = FileState::compute(path, text, None, 0).checksum;
        self.markers().writes.insert(path.clone(), expected);
        if let Err(err) = self.host.write_note(path, text).await {
            self.markers().writes.remove(path);
            return Err(err);
        }
        Ok(())
    }

    async fn move_to_class_folder(
        &self,
        path: &VaultPath,
        class: &str,
        settings: &Settings,
    ) -> Result<Option<VaultPath>> {
        let Some(folder) = settings.file_class.class_folders.get(class) else {
            return Ok(None);
        };
        let folder = folder.trim_matches('/');
        if path.folder() == folder {
            return Ok(None);
        }
        let target = path.with_folder(folder)?;
        if self.host.note_exists(&target) {
            warn!(from = %path, to = %target, "destination exists; note not moved");
            return Ok(None);
        }

        let key = (path.clone(), target.clone());
        self.markers().renames.insert(key.clone());
        if let Err(err) = self.host.rename_note(path, &target).await {
            self.markers().renames.remove(&key);
            return Err(err);
        }
        // Pending write markers follow the note.
        let moved = self.markers().writes.remove(path);
        if let Some(checksum) = moved {
            self.markers().writes.insert(target.clone(), checksum);
        }
        self.cache.rename(path, &target);
        info!(from = %path, to = %target, "note moved to fileClass folder");
        Ok(Some(target))
    }

    async fn persist(&self) {
        if let Err(err) = self.cache.flush().await {
            error!(error = %err, "failed to persist file state");
        }
    }
}
