use oxiprops::{OrderingPolicy, frontmatter, is_sorted, sort_properties};
use serde_yaml::{Mapping, Value};

fn meta(yaml: &str) -> Mapping {
    serde_yaml::from_str(yaml).expect("valid yaml")
}

fn keys(m: &Mapping) -> Vec<String> {
    m.keys()
        .map(|k| k.as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn round_trip_preserves_metadata_and_body_bytes() -> anyhow::Result<()> {
    let bodies = [
        "",
        "\n",
        "# Title\n\nSome text with --- inside.\n",
        "no trailing newline",
        "---\nlooks like a fence but is body\n---\n",
        "tabs\tand unicode: żółw 🐢\r\n",
    ];
    let records = [
        meta("title: Dune\n"),
        meta("tags: [a, b]\nnested:\n  k: v\n  n: 3\ncreated: 2024-01-02\n"),
        Mapping::new(),
    ];

    for body in bodies {
        for record in &records {
            let text = frontmatter::serialize(record, body)?;
            let doc = frontmatter::parse(&text)?.expect("managed document");
            assert_eq!(&doc.metadata, record);
            assert_eq!(doc.body, body);
        }
    }
    Ok(())
}

#[test]
fn dates_stay_strings() -> anyhow::Result<()> {
    let doc = frontmatter::parse("---\ncreated: 2024-01-02\n---\n")?.expect("managed");
    assert_eq!(
        doc.metadata.get("created"),
        Some(&Value::String("2024-01-02".into()))
    );
    Ok(())
}

#[test]
fn crlf_fences_and_malformed_blocks() -> anyhow::Result<()> {
    let doc = frontmatter::parse("---\r\na: 1\r\n---\r\nbody\r\n")?.expect("managed");
    assert_eq!(doc.metadata, meta("a: 1\n"));
    assert_eq!(doc.body, "body\r\n");

    assert!(frontmatter::parse("---\na: 1\n").is_err());
    assert!(frontmatter::parse("---\n- a\n- b\n---\n").is_err());
    assert!(frontmatter::parse("---\na: [1\n---\n").is_err());
    assert!(frontmatter::parse("plain note\n")?.is_none());

    let empty = frontmatter::parse("---\n---\nbody")?.expect("managed");
    assert!(empty.metadata.is_empty());
    assert_eq!(frontmatter::raw_frontmatter("---\na: 1\n---\nbody"), Some("a: 1\n"));
    Ok(())
}

#[test]
fn sorting_is_total_and_idempotent() {
    let policies = [
        OrderingPolicy::default(),
        OrderingPolicy::new(["status", "title"], true),
        OrderingPolicy::new(Vec::<String>::new(), false),
        OrderingPolicy::new(["b", "b", "a"], false),
    ];
    let records = [
        meta("zeta: 1\ntitle: x\nalpha: 2\nfileClass: book\ntags: [t]\n"),
        meta("b: 1\na: 2\nc: 3\n"),
        meta("1: numeric key\nB: upper\na: lower\n"),
        Mapping::new(),
    ];

    for policy in &policies {
        for record in &records {
            let once = sort_properties(record, policy);
            let twice = sort_properties(&once, policy);
            assert_eq!(keys(&once), keys(&twice));
            assert!(is_sorted(&once, policy));

            let mut input: Vec<_> = record.keys().cloned().collect();
            let mut output: Vec<_> = once.keys().cloned().collect();
            input.sort_by_key(|k| format!("{k:?}"));
            output.sort_by_key(|k| format!("{k:?}"));
            assert_eq!(input, output);
            for (k, v) in record {
                assert_eq!(once.get(k), Some(v));
            }
        }
    }
}

#[test]
fn known_keys_lead_unless_unknown_first() {
    let record = meta("zeta: 1\ntitle: x\nalpha: 2\nfileClass: book\n");
    let sorted = sort_properties(&record, &OrderingPolicy::default());
    assert_eq!(keys(&sorted), vec!["fileClass", "title", "alpha", "zeta"]);

    let sorted = sort_properties(&record, &OrderingPolicy::new(["title"], true));
    assert_eq!(keys(&sorted), vec!["alpha", "fileClass", "zeta", "title"]);
}
