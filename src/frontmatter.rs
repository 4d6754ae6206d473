use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

/// A note split into its properties and the untouched remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontmatterDocument {
    pub metadata: Mapping,
    pub body: String,
}

struct Split<'a> {
    yaml: &'a str,
    body: &'a str,
}

/// Locates the leading `---` block. `Ok(None)` means the note has no block.
fn split(content: &str) -> Result<Option<Split<'_>>> {
    let Some(rest) = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
    else {
        return Ok(None);
    };

    // Closing fence must sit on its own line; "---\n", "---\r\n" or "---" at EOF.
    let mut idx = 0usize;
    while idx < rest.len() {
        let line_end = match rest[idx..].find('\n') {
            Some(off) => idx + off + 1,
            None => rest.len(),
        };
        let line = &rest[idx..line_end];
        if line.trim_end_matches(['\r', '\n']) == "---" {
            return Ok(Some(Split {
                yaml: &rest[..idx],
                body: &rest[line_end..],
            }));
        }
        idx = line_end;
    }

    Err(Error::FrontmatterUnclosed)
}

/// Raw YAML text of the frontmatter block, if the note has one.
pub fn raw_frontmatter(content: &str) -> Option<&str> {
    split(content).ok().flatten().map(|s| s.yaml)
}

pub fn parse(content: &str) -> Result<Option<FrontmatterDocument>> {
    let Some(Split { yaml, body }) = split(content)? else {
        return Ok(None);
    };

    let metadata = if yaml.trim().is_empty() {
        Mapping::new()
    } else {
        match serde_yaml::from_str::<Value>(yaml)? {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => return Err(Error::FrontmatterNotMapping),
        }
    };

    Ok(Some(FrontmatterDocument {
        metadata,
        body: body.to_string(),
    }))
}

pub fn serialize(metadata: &Mapping, body: &str) -> Result<String> {
    let mut out = String::from("---\n");
    if !metadata.is_empty() {
        let yaml = serde_yaml::to_string(metadata)?;
        out.push_str(&yaml);
        if !yaml.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str("---\n");
    out.push_str(body);
    Ok(out)
}

impl FrontmatterDocument {
    pub fn parse(content: &str) -> Result<Option<Self>> {
        parse(content)
    }

    pub fn to_text(&self) -> Result<String> {
        serialize(&self.metadata, &self.body)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// `null`, empty strings and empty lists count as "no value".
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Sequence(seq) => seq.is_empty(),
        Value::Tagged(tagged) => is_blank(&tagged.value),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_leading_fence_is_unmanaged() {
        assert!(parse("# Title\n---\nx: 1\n---\n").unwrap().is_none());
        assert!(parse("").unwrap().is_none());
    }

    #[test]
    fn body_is_preserved_byte_for_byte() {
        let text = "---\ntitle: A\n---\n\n\n# A\r\nbody  \n\n";
        let doc = parse(text).unwrap().unwrap();
        assert_eq!(doc.body, "\n\n# A\r\nbody  \n\n");
        assert_eq!(serialize(&doc.metadata, &doc.body).unwrap(), text);
    }

    #[test]
    fn crlf_fences_are_accepted() {
        let doc = parse("---\r\ntitle: A\r\n---\r\nbody").unwrap().unwrap();
        assert_eq!(doc.get_str("title"), Some("A"));
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn empty_block_is_empty_mapping() {
        let doc = parse("---\n---\nbody\n").unwrap().unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.to_text().unwrap(), "---\n---\nbody\n");
    }

    #[test]
    fn closing_fence_at_eof() {
        let doc = parse("---\na: 1\n---").unwrap().unwrap();
        assert_eq!(doc.body, "");
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(matches!(
            parse("---\ntags: [a\n---\nbody"),
            Err(Error::FrontmatterYaml(_))
        ));
        assert!(matches!(
            parse("---\n- a\n- b\n---\n"),
            Err(Error::FrontmatterNotMapping)
        ));
        assert!(matches!(
            parse("---\na: 1\nbody"),
            Err(Error::FrontmatterUnclosed)
        ));
    }

    #[test]
    fn values_round_trip_without_coercion() {
        let text = "---\n\
                    date: 2024-03-01\n\
                    done: false\n\
                    count: 42\n\
                    ratio: 0.5\n\
                    quoted: 'true'\n\
                    tags:\n  - a\n  - b\n\
                    nested:\n  inner: x\n  list: [1, 2]\n\
                    empty:\n\
                    ---\nbody\n";
        let doc = parse(text).unwrap().unwrap();
        let again = parse(&doc.to_text().unwrap()).unwrap().unwrap();
        assert_eq!(again.metadata, doc.metadata);
        assert_eq!(again.body, "body\n");
        assert_eq!(again.metadata.get("quoted"), Some(&Value::String("true".into())));
        assert_eq!(again.metadata.get("done"), Some(&Value::Bool(false)));
        assert_eq!(again.get_str("date"), Some("2024-03-01"));
    }

    #[test]
    fn raw_frontmatter_is_block_text() {
        assert_eq!(raw_frontmatter("---\na: 1\n---\nbody"), Some("a: 1\n"));
        assert_eq!(raw_frontmatter("body"), None);
    }

    #[test]
    fn blank_values() {
        assert!(is_blank(&Value::Null));
        assert!(is_blank(&Value::String("  ".into())));
        assert!(is_blank(&Value::Sequence(vec![])));
        assert!(!is_blank(&Value::Bool(false)));
        assert!(!is_blank(&Value::String("x".into())));
    }
}
