use std::path::Path;
use std::sync::Arc;

use oxiprops::{
    FileClassDefinition, FileClassRegistry, FileClassSettings, FolderFileClassMapping,
    SchemaPlugin, SchemaStatus, Vault, VaultPath, frontmatter, insert_fields_layered,
    insertion_order, resolve_file_class,
};
use serde_yaml::Mapping;

fn write(root: &Path, rel: &str, text: &str) -> anyhow::Result<()> {
    let abs = root.join(rel);
    std::fs::create_dir_all(abs.parent().expect("parent"))?;
    std::fs::write(abs, text)?;
    Ok(())
}

fn meta(yaml: &str) -> Mapping {
    serde_yaml::from_str(yaml).expect("valid yaml")
}

fn mapping(pattern: &str, class: &str, is_regex: bool, order: i32) -> FolderFileClassMapping {
    FolderFileClassMapping {
        pattern: pattern.into(),
        file_class: class.into(),
        is_regex,
        order,
    }
}

fn fixed(vault: &Vault, defs: Vec<FileClassDefinition>) -> FileClassRegistry {
    FileClassRegistry::from_definitions(Arc::new(vault.clone()), defs)
}

#[test]
fn resolution_prefers_explicit_then_tags_then_folders() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let vault = Vault::open(temp.path())?;
    let schema = fixed(
        &vault,
        vec![
            FileClassDefinition::new("book").mapped_to_tags(["reading"]),
            FileClassDefinition::new("movie"),
        ],
    );
    let mut settings = FileClassSettings::default();
    settings.folder_mappings = vec![mapping("Media/**", "movie", false, 0)];
    let path = VaultPath::new("Media/Films/Dune.md")?;

    let resolve = |m: &Mapping, body: &str| resolve_file_class(&path, m, body, &settings, &schema);

    assert_eq!(resolve(&meta("fileClass: essay\n"), "#reading").as_deref(), Some("essay"));
    assert_eq!(resolve(&meta("fileclass: [essay]\n"), "").as_deref(), Some("essay"));
    assert_eq!(resolve(&meta("tags: [Reading]\n"), "").as_deref(), Some("book"));
    assert_eq!(resolve(&Mapping::new(), "see #reading later").as_deref(), Some("book"));
    assert_eq!(resolve(&Mapping::new(), "no tags").as_deref(), Some("movie"));
    // Lists of several classes are ambiguous.
    assert_eq!(
        resolve(&meta("fileClass: [a, b]\ntags: [reading]\n"), "").as_deref(),
        Some("book")
    );

    settings.map_with_tags = false;
    let resolve = |m: &Mapping, body: &str| resolve_file_class(&path, m, body, &settings, &schema);
    assert_eq!(resolve(&meta("tags: [reading]\n"), "").as_deref(), Some("movie"));
    Ok(())
}

#[test]
fn folder_mappings_follow_their_order() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let vault = Vault::open(temp.path())?;
    let schema = fixed(&vault, Vec::new());
    let mut settings = FileClassSettings::default();
    settings.folder_mappings = vec![
        mapping("Library", "book", false, 2),
        mapping(r"^Library/Comics/.*\.md$", "comic", true, 1),
        mapping("Journal/*/day-??.md", "daily", false, 3),
        mapping("([", "broken", true, 0),
    ];

    let class_of = |rel: &str| -> anyhow::Result<Option<String>> {
        let path = VaultPath::new(rel)?;
        Ok(resolve_file_class(&path, &Mapping::new(), "", &settings, &schema))
    };
    assert_eq!(class_of("Library/Dune.md")?.as_deref(), Some("book"));
    assert_eq!(class_of("Library/Comics/Saga.md")?.as_deref(), Some("comic"));
    assert_eq!(class_of("Journal/2024/day-01.md")?.as_deref(), Some("daily"));
    assert_eq!(class_of("Journal/2024/05/day-01.md")?, None);
    assert_eq!(class_of("Inbox/x.md")?, None);
    Ok(())
}

#[test]
fn registry_reads_definition_notes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "Schema/base.md", "---\nfields: [created]\n---\n")?;
    write(
        root,
        "Schema/book.md",
        "---\nextends: \"[[base|Base]]\"\nmapWithTag: true\ntagNames: \"Books, #novel/\"\nfields:\n  - author\n  - name: isbn\n  - 3\n---\n",
    )?;
    write(root, "Schema/broken.md", "---\nfields: [\n---\n")?;
    write(root, "Notes/not-a-class.md", "---\nfields: [x]\n---\n")?;

    let vault = Vault::open(root)?;
    let registry = FileClassRegistry::load(vault, "/Schema/");
    assert!(registry.is_available());
    assert!(matches!(registry.status(), SchemaStatus::Loaded { classes: 2, .. }));
    assert_eq!(registry.class_names(), vec!["base", "book"]);

    let book = registry.get_file_class_by_name("book").expect("book");
    assert_eq!(book.extends.as_deref(), Some("base"));
    assert_eq!(book.fields, vec!["author", "isbn"]);
    assert_eq!(book.mapped_tags(), vec!["books", "novel"]);

    let mut tags = registry.tag_mapped_classes();
    tags.sort();
    assert_eq!(
        tags,
        vec![
            ("books".to_string(), "book".to_string()),
            ("novel".to_string(), "book".to_string())
        ]
    );
    assert!(registry.is_definition_path(&VaultPath::new("Schema/book.md")?));
    assert!(!registry.is_definition_path(&VaultPath::new("Schemata/x.md")?));
    Ok(())
}

#[test]
fn missing_folder_leaves_schema_unavailable() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let registry = FileClassRegistry::load(Vault::open(temp.path())?, "fileClasses");
    assert!(!registry.is_available());
    assert_eq!(registry.status(), SchemaStatus::Disabled);
    assert!(registry.class_names().is_empty());
    Ok(())
}

#[test]
fn insertion_order_survives_cycles() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let vault = Vault::open(temp.path())?;
    let schema = fixed(
        &vault,
        vec![
            FileClassDefinition::new("a").extending("b"),
            FileClassDefinition::new("b").extending("c"),
            FileClassDefinition::new("c").extending("a"),
            FileClassDefinition::new("solo").extending("solo"),
        ],
    );
    assert_eq!(insertion_order("a", &schema), vec!["c", "b", "a"]);
    assert_eq!(insertion_order("solo", &schema), vec!["solo"]);
    assert_eq!(insertion_order("unknown", &schema), vec!["unknown"]);
    Ok(())
}

#[test]
fn registry_chain_is_nearest_first_and_insertion_is_most_general_first() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let vault = Vault::open(temp.path())?;
    let schema = fixed(
        &vault,
        vec![
            FileClassDefinition::new("base"),
            FileClassDefinition::new("media").extending("base"),
            FileClassDefinition::new("book").extending("media"),
        ],
    );
    assert_eq!(schema.get_ancestor_chain("book"), vec!["media", "base"]);
    assert_eq!(insertion_order("book", &schema), vec!["base", "media", "book"]);
    Ok(())
}

#[tokio::test]
async fn layered_insertion_creates_a_block_when_missing() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "Dune.md", "# Dune\n\nSand.\n")?;
    let vault = Vault::open(root)?;
    let schema = fixed(
        &vault,
        vec![
            FileClassDefinition::new("base").with_fields(["created", "status"]),
            FileClassDefinition::new("book")
                .extending("base")
                .with_fields(["status", "author"]),
        ],
    );

    let path = VaultPath::new("Dune.md")?;
    assert_eq!(insert_fields_layered(&path, "book", &schema).await?, 3);
    let text = std::fs::read_to_string(root.join("Dune.md"))?;
    let doc = frontmatter::parse(&text)?.expect("block inserted");
    let keys: Vec<&str> = doc.metadata.keys().filter_map(|k| k.as_str()).collect();
    assert_eq!(keys, vec!["created", "status", "author"]);
    assert_eq!(doc.body, "# Dune\n\nSand.\n");

    assert_eq!(insert_fields_layered(&path, "book", &schema).await?, 0);
    Ok(())
}
