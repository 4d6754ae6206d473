use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use oxiprops::{
    FileClassRegistry, FileStateCache, LintSeverity, PropertyManager, SchemaPlugin, ServiceEvent,
    Settings, Vault, VaultPath, VaultService, frontmatter, insertion_order, resolve_file_class,
    validate_script,
};

#[derive(Debug, Parser)]
#[command(
    name = "oxp",
    version,
    about = "Keeps Obsidian note properties sorted and filled in"
)]
struct Cli {
    /// Path to the Obsidian vault.
    #[arg(long, env = "OBSIDIAN_VAULT", global = true)]
    vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sort one note's properties.
    Sort { note: String },
    /// Run the full pipeline once on a note.
    Process { note: String },
    /// Run the pipeline on every note in the vault.
    #[command(name = "auto-update")]
    AutoUpdate,
    /// Lint a default-value script (`-` reads stdin).
    Lint { script: PathBuf },
    /// Print a note's fileClass and field insertion order.
    Fileclass { note: String },
    /// React to filesystem changes until Ctrl-C.
    Watch,
    /// Plugin settings.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    /// Write settings, defaults or imported from a TOML file.
    Init {
        #[arg(long)]
        force: bool,
        #[arg(long = "from-toml")]
        from_toml: Option<PathBuf>,
    },
    /// Print the effective settings as JSON.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Sort { note } => handle_sort(cli.vault, &note).await?,
        Command::Process { note } => handle_process(cli.vault, &note).await?,
        Command::AutoUpdate => handle_auto_update(cli.vault).await?,
        Command::Lint { script } => handle_lint(&script)?,
        Command::Fileclass { note } => handle_fileclass(cli.vault, &note)?,
        Command::Watch => handle_watch(cli.vault).await?,
        Command::Settings { command } => handle_settings(cli.vault, command)?,
    }

    Ok(())
}

async fn handle_sort(vault: Option<PathBuf>, note: &str) -> anyhow::Result<()> {
    let (vault, settings) = open_vault(vault)?;
    let manager = build_manager(&vault, settings);
    let path = VaultPath::new(note)?;
    if manager.sort_file(&path).await? {
        println!("sorted {path}");
    } else {
        println!("{path} already sorted");
    }
    Ok(())
}

async fn handle_process(vault: Option<PathBuf>, note: &str) -> anyhow::Result<()> {
    let (vault, settings) = open_vault(vault)?;
    let manager = build_manager(&vault, settings);
    manager.start().await?;
    let path = VaultPath::new(note)?;
    let report = manager.process_file(&path).await?;

    if let Some(reason) = &report.skipped {
        println!("{path}: skipped ({reason:?})");
        return Ok(());
    }
    println!("{path}");
    println!(
        "  fileClass: {}",
        report.file_class.as_deref().unwrap_or("-")
    );
    println!("  inserted fields: {}", report.inserted_fields);
    if !report.filled.is_empty() {
        println!("  filled: {}", report.filled.join(", "));
    }
    for notice in &report.notices {
        println!("  warning: {}: {}", notice.property, notice.message);
    }
    println!("  written: {}", report.written);
    if let Some(to) = &report.moved_to {
        println!("  moved to: {to}");
    }
    Ok(())
}

async fn handle_auto_update(vault: Option<PathBuf>) -> anyhow::Result<()> {
    let (vault, settings) = open_vault(vault)?;
    let manager = build_manager(&vault, settings);
    manager.start().await?;
    let report = manager.auto_update_vault().await?;

    println!("auto-update");
    println!("  processed: {}", report.processed);
    println!("  written: {}", report.written);
    println!("  skipped: {}", report.skipped);
    println!("  failed: {}", report.failures.len());
    for (path, error) in &report.failures {
        println!("- {path}: {error}");
    }
    Ok(())
}

fn handle_lint(script: &Path) -> anyhow::Result<()> {
    let source = if script.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(script)?
    };

    let report = validate_script(&source);
    let label = match report.severity {
        LintSeverity::Error => "error",
        LintSeverity::Warning => "warning",
        LintSeverity::Success => "ok",
    };
    println!("{label}: {}", report.message);
    if !report.is_valid {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_fileclass(vault: Option<PathBuf>, note: &str) -> anyhow::Result<()> {
    let (vault, settings) = open_vault(vault)?;
    let schema = FileClassRegistry::load(vault.clone(), &settings.file_class.classes_folder);
    let path = VaultPath::new(note)?;
    let text = std::fs::read_to_string(vault.to_abs(&path))?;
    let (metadata, body) = match frontmatter::parse(&text)? {
        Some(doc) => (doc.metadata, doc.body),
        None => (Default::default(), text),
    };

    match resolve_file_class(&path, &metadata, &body, &settings.file_class, &schema) {
        Some(class) => {
            println!("fileClass: {class}");
            println!("insertion order: {}", insertion_order(&class, &schema).join(" -> "));
            if !schema.is_available() {
                println!("(schema unavailable: {:?})", schema.status());
            }
        }
        None => println!("fileClass: -"),
    }
    Ok(())
}

async fn handle_watch(vault: Option<PathBuf>) -> anyhow::Result<()> {
    let (vault, settings) = open_vault(vault)?;
    let manager = Arc::new(build_manager(&vault, settings));
    let loaded = manager.start().await?;
    let mut service = VaultService::new(vault, manager);
    let mut rx = service.subscribe();

    service.start_watching().await?;
    println!("watching ({loaded} known notes)... (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = rx.recv() => {
                match ev {
                    Ok(ServiceEvent::Handled { event, outcome }) => {
                        println!("{event:?} -> {outcome:?}");
                    }
                    Ok(ServiceEvent::Error { path, error }) => {
                        eprintln!("error {path:?}: {error}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("(lagged {n} events)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

fn handle_settings(vault: Option<PathBuf>, command: SettingsCommand) -> anyhow::Result<()> {
    let root = require_vault(vault)?;
    let vault = Vault::open(&root)?;
    let path = vault.root().join(vault.config().settings_path());

    match command {
        SettingsCommand::Init { force, from_toml } => {
            if path.exists() && !force {
                eprintln!(
                    "settings already exist at {}; use --force to overwrite",
                    path.display()
                );
                anyhow::bail!("settings already exist");
            }
            let settings = match from_toml {
                Some(src) => Settings::from_toml_str(&std::fs::read_to_string(&src)?)?,
                None => Settings::default(),
            };
            settings.save(&path)?;
            println!("settings written to {}", path.display());
        }
        SettingsCommand::Show => {
            let settings = Settings::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}

fn open_vault(vault: Option<PathBuf>) -> anyhow::Result<(Vault, Settings)> {
    let vault = Vault::open(require_vault(vault)?)?;
    let settings = Settings::load(&vault.root().join(vault.config().settings_path()))?;
    Ok((vault, settings))
}

fn build_manager(vault: &Vault, settings: Settings) -> PropertyManager {
    let cache = Arc::new(FileStateCache::persistent(
        vault.root().join(vault.config().file_state_path()),
    ));
    let schema: Arc<dyn SchemaPlugin> = Arc::new(FileClassRegistry::load(
        vault.clone(),
        &settings.file_class.classes_folder,
    ));
    PropertyManager::builder(Arc::new(vault.clone()), settings, vault.config().clone())
        .schema(schema)
        .cache(cache)
        .build()
}

fn require_vault(vault: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    vault.ok_or_else(|| anyhow::anyhow!("--vault is required (or set OBSIDIAN_VAULT)"))
}
