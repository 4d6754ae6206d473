use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use oxiprops::{
    ChronoTemplating, EventOutcome, FileClassRegistry, FileStateCache, PropertyDefaultValueScript,
    PropertyManager, SchemaPlugin, Settings, Vault, VaultConfig, VaultPath, VaultService,
    frontmatter,
};

fn write(root: &Path, rel: &str, text: &str) -> anyhow::Result<VaultPath> {
    let abs = root.join(rel);
    if let Some(parent) = abs.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(abs, text)?;
    Ok(VaultPath::new(rel)?)
}

fn keys(root: &Path, rel: &str) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(root.join(rel))?;
    let doc = frontmatter::parse(&text)?.expect("managed note");
    Ok(doc
        .metadata
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect())
}

fn script(property: &str, body: &str, order: i32) -> PropertyDefaultValueScript {
    PropertyDefaultValueScript {
        property_name: property.into(),
        script_body: body.into(),
        enabled: true,
        order,
        owning_file_classes: Vec::new(),
    }
}

fn manager(vault: &Vault, settings: Settings) -> PropertyManager {
    let schema: Arc<dyn SchemaPlugin> = Arc::new(FileClassRegistry::load(
        vault.clone(),
        &settings.file_class.classes_folder,
    ));
    let clock = Local
        .with_ymd_and_hms(2024, 5, 6, 9, 30, 0)
        .single()
        .expect("valid clock");
    let cache = Arc::new(FileStateCache::persistent(
        vault.root().join(vault.config().file_state_path()),
    ));
    PropertyManager::builder(Arc::new(vault.clone()), settings, vault.config().clone())
        .schema(schema)
        .utilities(Arc::new(ChronoTemplating::with_clock(clock)))
        .cache(cache)
        .build()
}

fn book_classes(root: &Path) -> anyhow::Result<()> {
    write(root, "fileClasses/default-basic.md", "---\nfields: [created]\n---\n")?;
    write(
        root,
        "fileClasses/default.md",
        "---\nextends: default-basic\nfields: [status]\n---\n",
    )?;
    write(
        root,
        "fileClasses/book.md",
        "---\nextends: \"[[default]]\"\nfields:\n  - name: author\n---\n",
    )?;
    Ok(())
}

#[tokio::test]
async fn fields_are_inserted_ancestors_first() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    book_classes(&root)?;
    let note = write(&root, "Library/Dune.md", "---\nfileClass: book\ntitle: Dune\n---\nBody\n")?;

    let mut settings = Settings::default();
    settings.sort_on_change = false;
    let vault = Vault::open(&root)?;
    let manager = manager(&vault, settings);

    let report = manager.process_file(&note).await?;
    assert_eq!(report.file_class.as_deref(), Some("book"));
    assert_eq!(report.inserted_fields, 3);
    assert_eq!(
        keys(&root, "Library/Dune.md")?,
        vec!["fileClass", "title", "created", "status", "author"]
    );
    let text = std::fs::read_to_string(root.join("Library/Dune.md"))?;
    assert!(text.ends_with("---\nBody\n"));
    Ok(())
}

#[tokio::test]
async fn pipeline_sorts_and_backfills_inserted_fields() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    book_classes(&root)?;
    let note = write(&root, "Library/Dune.md", "---\ntitle: Dune\nfileClass: book\n---\nBody\n")?;

    let mut settings = Settings::default();
    settings.defaults.scripts = vec![
        script("status", "return metadata.created ? 'draft' : 'new';", 1),
        script("created", "return utils.now('YYYY-MM-DD');", 0),
        script("title", "return 'never used';", 2),
    ];
    let vault = Vault::open(&root)?;
    let manager = manager(&vault, settings);

    let report = manager.process_file(&note).await?;
    assert!(report.written);
    assert_eq!(report.filled, vec!["created", "status"]);
    assert!(report.notices.is_empty());

    assert_eq!(
        keys(&root, "Library/Dune.md")?,
        vec!["fileClass", "title", "author", "created", "status"]
    );
    let text = std::fs::read_to_string(root.join("Library/Dune.md"))?;
    let doc = frontmatter::parse(&text)?.expect("managed");
    assert_eq!(doc.get_str("created"), Some("2024-05-06"));
    assert_eq!(doc.get_str("status"), Some("draft"));
    assert_eq!(doc.get_str("title"), Some("Dune"));
    assert_eq!(doc.body, "Body\n");
    Ok(())
}

#[tokio::test]
async fn hashtags_select_tag_mapped_classes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    write(&root, "fileClasses/book.md", "---\nmapWithTag: true\nfields: [author]\n---\n")?;
    let note = write(&root, "inbox.md", "---\ntitle: x\n---\nRead #book today\n")?;

    let vault = Vault::open(&root)?;
    let manager = manager(&vault, Settings::default());
    let report = manager.process_file(&note).await?;
    assert_eq!(report.file_class.as_deref(), Some("book"));
    assert_eq!(keys(&root, "inbox.md")?, vec!["title", "author"]);
    Ok(())
}

#[tokio::test]
async fn batch_update_isolates_failures() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    std::fs::create_dir_all(root.join("fileClasses"))?;
    write(&root, "a.md", "---\nz: 1\na: 2\n---\n")?;
    write(&root, "b.md", "no frontmatter\n")?;
    write(&root, "c.md", "---\nbroken: [\n---\n")?;
    std::fs::write(root.join("bad.md"), [0xff, 0xfe, 0x00])?;

    let vault = Vault::open(&root)?;
    let manager = manager(&vault, Settings::default());
    let report = manager.auto_update_vault().await?;

    assert_eq!(report.processed, 3);
    assert_eq!(report.written, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0.as_str_lossy(), "bad.md");
    assert_eq!(keys(&root, "a.md")?, vec!["a", "z"]);
    Ok(())
}

#[tokio::test]
async fn batch_refuses_without_schema() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    write(&root, "a.md", "---\nz: 1\na: 2\n---\n")?;

    let vault = Vault::open(&root)?;
    let manager = manager(&vault, Settings::default());
    let err = manager.auto_update_vault().await.unwrap_err();
    assert!(matches!(err, oxiprops::Error::ExternalPluginUnavailable("schema")));
    assert_eq!(keys(&root, "a.md")?, vec!["z", "a"]);
    Ok(())
}

#[tokio::test]
async fn file_state_survives_restart() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    let note = write(&root, "a.md", "---\nb: 1\na: 2\n---\n")?;
    let gone = write(&root, "gone.md", "---\nx: 1\n---\n")?;
    let vault = Vault::open(&root)?;

    let first = manager(&vault, Settings::default());
    first.process_file(&note).await?;
    assert_eq!(first.on_file_modified(&gone).await, EventOutcome::Recorded);
    first.shutdown().await;
    assert!(root.join(vault.config().file_state_path()).is_file());

    std::fs::remove_file(root.join("gone.md"))?;
    let second = manager(&vault, Settings::default());
    assert_eq!(second.start().await?, 2);
    assert!(second.cache().get(&gone).is_none());
    assert_eq!(second.on_file_modified(&note).await, EventOutcome::Unchanged);

    write(&root, "a.md", "---\na: 3\nb: 1\n---\n")?;
    assert_eq!(second.on_file_modified(&note).await, EventOutcome::Scheduled);
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn definition_edits_refresh_the_registry() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    let def = write(&root, "fileClasses/book.md", "---\nfields: [author]\n---\n")?;
    let vault = Vault::open(&root)?;
    let manager = manager(&vault, Settings::default());
    assert!(manager.schema().get_file_class_by_name("movie").is_none());

    write(&root, "fileClasses/movie.md", "---\nfields: [director]\n---\n")?;
    let movie = VaultPath::new("fileClasses/movie.md")?;
    assert_eq!(manager.on_file_created(&movie).await, EventOutcome::SchemaRefreshed);
    assert!(manager.schema().get_file_class_by_name("movie").is_some());
    assert_eq!(manager.on_file_modified(&def).await, EventOutcome::SchemaRefreshed);
    Ok(())
}

#[tokio::test]
async fn watcher_drives_reactions_end_to_end() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    let note = write(&root, "notes/a.md", "---\nb: 1\n---\nbody\n")?;

    let mut cfg = VaultConfig::default();
    cfg.watch_debounce = Duration::from_millis(100);
    cfg.save_debounce = Duration::from_millis(100);
    let vault = Vault::with_config(&root, cfg)?;
    let manager = Arc::new(manager(&vault, Settings::default()));
    assert_eq!(manager.on_file_modified(&note).await, EventOutcome::Recorded);

    let mut service = VaultService::new(vault, Arc::clone(&manager));
    service.start_watching().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(root.join("notes/a.md"), "---\nz: 1\nb: 2\n---\nbody\n")?;

    let mut sorted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if keys(&root, "notes/a.md")? == ["b", "z"] {
            sorted = true;
            break;
        }
    }
    assert!(sorted, "watcher never triggered the reaction");

    service.shutdown().await;
    Ok(())
}
