//! Backfills blank properties by running the configured default-value
//! scripts in order.

use std::sync::Arc;

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::frontmatter::is_blank;
use crate::script_host::{FileIdentity, ScriptContext, ScriptHost, ScriptUtilities};
use crate::settings::{DefaultsSettings, PropertyDefaultValueScript};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptNotice {
    pub property: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    pub metadata: Mapping,
    /// Properties that received a value, in script order.
    pub filled: Vec<String>,
    /// Scripts that failed; resolution continued past each of them.
    pub notices: Vec<ScriptNotice>,
}

impl ResolveOutcome {
    /// Whether a previously absent key was added.
    pub fn added_keys(&self, before: &Mapping) -> bool {
        self.filled
            .iter()
            .any(|k| !before.contains_key(k.as_str()))
    }
}

/// Runs enabled scripts by ascending `order`. A script is skipped only when
/// its property holds a non-blank value; absent properties are filled unless
/// `fill_absent` is off.
pub async fn resolve_defaults(
    file_class: Option<&str>,
    file: &FileIdentity,
    metadata: Mapping,
    defaults: &DefaultsSettings,
    host: &dyn ScriptHost,
    utils: Arc<dyn ScriptUtilities>,
) -> ResolveOutcome {
    let mut outcome = ResolveOutcome {
        metadata,
        filled: Vec::new(),
        notices: Vec::new(),
    };
    if !defaults.enabled {
        return outcome;
    }

    let mut scripts: Vec<&PropertyDefaultValueScript> =
        defaults.scripts.iter().filter(|s| s.enabled).collect();
    scripts.sort_by_key(|s| s.order);

    for script in scripts {
        let property = script.property_name.as_str();
        let wanted = match outcome.metadata.get(property) {
            Some(value) => is_blank(value),
            None => defaults.fill_absent,
        };
        if !wanted {
            debug!(path = %file.path, property, "property has a value; script skipped");
            continue;
        }

        let context = ScriptContext {
            metadata: outcome.metadata.clone(),
            file_class: file_class.map(str::to_string),
            file: file.clone(),
            utils: Arc::clone(&utils),
        };
        match host.execute(&script.script_body, &context).await {
            Ok(value) if is_unset(&value) => {
                debug!(path = %file.path, property, "script returned no value");
            }
            Ok(value) => {
                outcome
                    .metadata
                    .insert(Value::String(property.to_string()), value);
                outcome.filled.push(property.to_string());
            }
            Err(err) => {
                warn!(path = %file.path, property, error = %err, "default-value script failed");
                outcome.notices.push(ScriptNotice {
                    property: property.to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
    outcome
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
