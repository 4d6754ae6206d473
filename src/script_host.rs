//! Script execution seam used by the default-value resolver.
//!
//! [`ScriptHost`] is the abstraction the resolver depends on; [`JsScriptHost`]
//! is the production implementation backed by the in-crate interpreter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::js::eval::{self, JsValue};
use crate::lint::ScriptLinter;
use crate::vault::VaultPath;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayOffset {
    Today,
    Tomorrow,
    Yesterday,
}

/// Helpers exposed to scripts as `utils.*`.
#[async_trait]
pub trait ScriptUtilities: Send + Sync {
    async fn prompt(&self, message: &str, default: &str) -> Result<String>;

    fn date(&self, offset: DayOffset, format: Option<&str>) -> String;

    fn markdown_link(&self, target: &str, alias: Option<&str>) -> String;

    fn detect_language(&self, text: &str) -> String;
}

/// What a script knows about the note it runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub path: String,
    pub name: String,
    pub basename: String,
    pub folder: String,
    pub extension: String,
}

impl FileIdentity {
    pub fn from_path(path: &VaultPath) -> Self {
        let extension = path
            .as_path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            path: path.as_str_lossy(),
            name: path.file_name(),
            basename: path.stem(),
            folder: path.folder(),
            extension,
        }
    }

    fn to_js(&self) -> JsValue {
        let fields = [
            ("path", &self.path),
            ("name", &self.name),
            ("basename", &self.basename),
            ("folder", &self.folder),
            ("extension", &self.extension),
        ];
        JsValue::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), JsValue::String(v.clone())))
                .collect(),
        )
    }
}

pub struct ScriptContext {
    pub metadata: Mapping,
    pub file_class: Option<String>,
    pub file: FileIdentity,
    pub utils: Arc<dyn ScriptUtilities>,
}

#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Runs `source` as an async function body and returns its result.
    async fn execute(&self, source: &str, context: &ScriptContext) -> Result<Value>;
}

pub struct JsScriptHost {
    linter: Arc<ScriptLinter>,
}

impl JsScriptHost {
    pub fn new(linter: Arc<ScriptLinter>) -> Self {
        Self { linter }
    }

    pub fn linter(&self) -> &Arc<ScriptLinter> {
        &self.linter
    }
}

impl Default for JsScriptHost {
    fn default() -> Self {
        Self::new(Arc::new(ScriptLinter::default()))
    }
}

#[async_trait]
impl ScriptHost for JsScriptHost {
    async fn execute(&self, source: &str, context: &ScriptContext) -> Result<Value> {
        let report = self.linter.validate(source);
        if !report.is_valid {
            return Err(Error::script(format!(
                "script failed validation: {}",
                report.message
            )));
        }
        let parsed = self.linter.parse(source);
        let body = match parsed.as_ref() {
            Ok(body) => body,
            Err(e) => return Err(Error::script(format!("syntax error: {e}"))),
        };

        let file_class = match &context.file_class {
            Some(name) => JsValue::String(name.clone()),
            None => JsValue::Null,
        };
        let globals = vec![
            (
                "metadata".to_string(),
                eval::from_yaml(&Value::Mapping(context.metadata.clone())),
            ),
            ("fileClass".to_string(), file_class),
            ("file".to_string(), context.file.to_js()),
            ("utils".to_string(), eval::utils_object()),
        ];

        let value = eval::run(body, globals, Arc::clone(&context.utils))
            .await
            .map_err(|e| Error::script(e.to_string()))?;
        Ok(eval::to_yaml(&value))
    }
}
