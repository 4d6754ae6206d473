mod config;
mod debounce;
mod defaults;
mod error;
mod fileclass;
pub mod frontmatter;
pub mod js;
mod lint;
mod manager;
mod schema;
mod script_host;
mod service;
mod settings;
mod sorter;
mod state_cache;
mod templating;
mod vault;

pub use crate::config::VaultConfig;
pub use crate::debounce::{
    Callback, DebounceManager, KeyState, ManualScheduler, Scheduler, Task, TimerHandle,
    TokioScheduler,
};
pub use crate::defaults::{ResolveOutcome, ScriptNotice, resolve_defaults};
pub use crate::error::{Error, Result};
pub use crate::fileclass::{
    ancestor_chain, explicit_file_class, folder_file_class, glob_to_regex, insert_fields_layered,
    insertion_order, note_tags, resolve_file_class,
};
pub use crate::frontmatter::FrontmatterDocument;
pub use crate::lint::{
    LintReport, LintSeverity, MAX_SCRIPT_LEN, ParsedScript, ScriptLinter, block_returns,
    validate_script,
};
pub use crate::manager::{
    BatchReport, EventOrigin, EventOutcome, ProcessReport, PropertyManager,
    PropertyManagerBuilder, Reaction, SkipReason,
};
pub use crate::schema::{
    FileClassDefinition, FileClassRegistry, NoSchema, SchemaPlugin, SchemaStatus, normalize_tag,
};
pub use crate::script_host::{
    DayOffset, FileIdentity, JsScriptHost, ScriptContext, ScriptHost, ScriptUtilities,
};
pub use crate::service::{HostEvent, ServiceEvent, VaultService};
pub use crate::settings::{
    DefaultsSettings, FileClassSettings, FolderFileClassMapping, OrderingPolicy,
    PropertyDefaultValueScript, Settings,
};
pub use crate::sorter::{is_sorted, sort_properties};
pub use crate::state_cache::{FileState, FileStateCache, Observation, checksum};
pub use crate::templating::{
    ChronoTemplating, DEFAULT_DATE_FORMAT, TemplatingPlugin, detect_language, markdown_link,
    moment_to_chrono,
};
pub use crate::vault::{NoteHost, Vault, VaultPath};
