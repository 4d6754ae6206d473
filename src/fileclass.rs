use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::Result;
use crate::schema::{SchemaPlugin, normalize_tag};
use crate::settings::{FileClassSettings, FolderFileClassMapping};
use crate::vault::VaultPath;

const MAX_ANCESTORS: usize = 32;

/// Determines a note's fileClass: explicit frontmatter key, then tag-mapped
/// classes, then folder mappings.
pub fn resolve_file_class(
    path: &VaultPath,
    metadata: &Mapping,
    body: &str,
    settings: &FileClassSettings,
    schema: &dyn SchemaPlugin,
) -> Option<String> {
    if let Some(name) = explicit_file_class(metadata, settings) {
        return Some(name);
    }

    if settings.map_with_tags && schema.is_available() {
        let mapped = schema.tag_mapped_classes();
        if !mapped.is_empty() {
            for tag in note_tags(metadata, body) {
                if let Some((_, class)) = mapped.iter().find(|(t, _)| *t == tag) {
                    debug!(path = %path, tag = %tag, class = %class, "fileClass from tag");
                    return Some(class.clone());
                }
            }
        }
    }

    folder_file_class(path, &settings.folder_mappings)
}

/// The value of the fileClass key or its alias, if it names one class.
pub fn explicit_file_class(metadata: &Mapping, settings: &FileClassSettings) -> Option<String> {
    [settings.field.as_str(), settings.alias.as_str()]
        .into_iter()
        .filter(|k| !k.is_empty())
        .find_map(|key| match metadata.get(key)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Sequence(items) if items.len() == 1 => {
                items[0].as_str().map(|s| s.trim().to_string())
            }
            _ => None,
        })
        .filter(|s| !s.is_empty())
}

/// Tags from the `tags` property followed by inline hashtags, normalized,
/// without duplicates.
pub fn note_tags(metadata: &Mapping, body: &str) -> Vec<String> {
    static HASHTAG: OnceLock<Option<Regex>> = OnceLock::new();
    let hashtag = HASHTAG.get_or_init(|| {
        Regex::new(r"(?:^|[\s(])#([\p{L}\p{N}_/-]*[\p{L}_/-][\p{L}\p{N}_/-]*)").ok()
    });

    let mut out: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        if let Some(tag) = normalize_tag(raw) {
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
    };

    for key in ["tags", "tag"] {
        match metadata.get(key) {
            Some(Value::String(s)) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .for_each(&mut push),
            Some(Value::Sequence(items)) => {
                items.iter().filter_map(Value::as_str).for_each(&mut push)
            }
            _ => {}
        }
    }
    if let Some(re) = hashtag {
        for caps in re.captures_iter(body) {
            if let Some(m) = caps.get(1) {
                push(m.as_str());
            }
        }
    }
    out
}

/// First matching folder mapping by ascending `order`.
pub fn folder_file_class(path: &VaultPath, mappings: &[FolderFileClassMapping]) -> Option<String> {
    let rel = path.as_str_lossy();
    let mut ordered: Vec<&FolderFileClassMapping> = mappings.iter().collect();
    ordered.sort_by_key(|m| m.order);
    ordered
        .into_iter()
        .find(|m| mapping_matches(m, &rel))
        .map(|m| m.file_class.clone())
}

fn mapping_matches(mapping: &FolderFileClassMapping, rel: &str) -> bool {
    if mapping.is_regex {
        return match Regex::new(&mapping.pattern) {
            Ok(re) => re.is_match(rel),
            Err(err) => {
                warn!(pattern = %mapping.pattern, error = %err, "invalid folder mapping regex");
                false
            }
        };
    }
    let Ok(re) = glob_to_regex(&mapping.pattern) else {
        return false;
    };
    // A bare folder pattern also covers the notes inside it.
    re.is_match(rel)
        || rel
            .rsplit_once('/')
            .is_some_and(|(folder, _)| re.is_match(folder))
}

/// `*` matches within a segment, `?` one character, `**` any depth.
pub fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut regex = String::from("^");
    let pattern = pattern.trim_matches('/');
    let segments: Vec<&str> = pattern.split('/').collect();
    let mut prev_globstar = false;
    for (idx, segment) in segments.iter().enumerate() {
        if *segment == "**" {
            if idx > 0 && !prev_globstar {
                regex.push('/');
            }
            if idx == segments.len() - 1 {
                regex.push_str(".*");
            } else {
                regex.push_str("(?:[^/]+/)*");
            }
            prev_globstar = true;
            continue;
        }
        if idx > 0 && !prev_globstar {
            regex.push('/');
        }
        prev_globstar = false;

        for ch in segment.chars() {
            match ch {
                '*' => regex.push_str("[^/]*"),
                '?' => regex.push_str("[^/]"),
                _ => regex.push_str(&regex::escape(&ch.to_string())),
            }
        }
    }
    regex.push('$');
    Regex::new(&regex)
}

/// Ancestors of `name`, most general first. Stops at a repeated name and
/// after 32 levels.
pub fn ancestor_chain(name: &str, schema: &dyn SchemaPlugin) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    for ancestor in schema.get_ancestor_chain(name) {
        if ancestor == name || chain.contains(&ancestor) {
            break;
        }
        if chain.len() == MAX_ANCESTORS {
            warn!(class = name, "ancestor chain truncated");
            break;
        }
        chain.push(ancestor);
    }
    // The plugin lists the nearest parent first.
    chain.reverse();
    chain
}

/// Ancestors followed by the class itself.
pub fn insertion_order(name: &str, schema: &dyn SchemaPlugin) -> Vec<String> {
    let mut order = ancestor_chain(name, schema);
    order.push(name.to_string());
    order
}

/// Inserts missing fields class by class along the insertion order.
pub async fn insert_fields_layered(
    path: &VaultPath,
    name: &str,
    schema: &dyn SchemaPlugin,
) -> Result<usize> {
    let mut total = 0;
    for class in insertion_order(name, schema) {
        total += schema.insert_missing_fields(path, &class).await?;
    }
    Ok(total)
}
