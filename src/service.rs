use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::manager::{EventOutcome, PropertyManager};
use crate::{Result, Vault, VaultPath};

/// Raw watcher events arriving within this window are merged.
const COALESCE: Duration = Duration::from_millis(50);

/// Note-level events the host reports to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    MetadataChanged(VaultPath),
    ActiveFileChanged(VaultPath),
    Modified(VaultPath),
    Created(VaultPath),
    Deleted(VaultPath),
    Renamed { from: VaultPath, to: VaultPath },
}

impl HostEvent {
    pub fn path(&self) -> &VaultPath {
        match self {
            Self::MetadataChanged(p)
            | Self::ActiveFileChanged(p)
            | Self::Modified(p)
            | Self::Created(p)
            | Self::Deleted(p) => p,
            Self::Renamed { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Handled {
        event: HostEvent,
        outcome: EventOutcome,
    },
    Error {
        path: Option<VaultPath>,
        error: String,
    },
}

/// Watches a vault and feeds filesystem changes to a [`PropertyManager`].
pub struct VaultService {
    vault: Vault,
    manager: Arc<PropertyManager>,
    events: broadcast::Sender<ServiceEvent>,
    shutdown_tx: watch::Sender<bool>,
    watcher: Option<notify::RecommendedWatcher>,
    watch_task: Option<tokio::task::JoinHandle<()>>,
}

impl VaultService {
    pub fn new(vault: Vault, manager: Arc<PropertyManager>) -> Self {
        let (events, _) = broadcast::channel(512);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            vault,
            manager,
            events,
            shutdown_tx,
            watcher: None,
            watch_task: None,
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn manager(&self) -> &Arc<PropertyManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Hands one event to the manager and broadcasts the outcome.
    pub async fn dispatch(&self, event: HostEvent) -> EventOutcome {
        dispatch(&self.manager, &self.events, event).await
    }

    pub async fn start_watching(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let (raw_tx, raw_rx) =
            mpsc::unbounded_channel::<std::result::Result<notify::Event, notify::Error>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })?;
        watcher.watch(self.vault.root(), RecursiveMode::Recursive)?;

        let vault = self.vault.clone();
        let manager = Arc::clone(&self.manager);
        let events = self.events.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.watch_task = Some(tokio::spawn(async move {
            watch_loop(vault, manager, events, raw_rx, &mut shutdown_rx).await;
        }));
        self.watcher = Some(watcher);

        Ok(())
    }

    /// Stops the watcher, then shuts the manager down.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.watcher.take();
        if let Some(handle) = self.watch_task.take() {
            let _ = handle.await;
        }
        self.manager.shutdown().await;
    }
}

impl Drop for VaultService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn dispatch(
    manager: &PropertyManager,
    events: &broadcast::Sender<ServiceEvent>,
    event: HostEvent,
) -> EventOutcome {
    let outcome = manager.handle(event.clone()).await;
    debug!(path = %event.path(), ?outcome, "event handled");
    let _ = events.send(ServiceEvent::Handled {
        event,
        outcome: outcome.clone(),
    });
    outcome
}

async fn watch_loop(
    vault: Vault,
    manager: Arc<PropertyManager>,
    events: broadcast::Sender<ServiceEvent>,
    mut raw_rx: mpsc::UnboundedReceiver<std::result::Result<notify::Event, notify::Error>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut pending: Vec<notify::Event> = Vec::new();
    let mut coalesce_armed = false;
    let coalesce_timer = tokio::time::sleep(Duration::from_secs(60 * 60 * 24 * 365 * 10));
    tokio::pin!(coalesce_timer);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            maybe = raw_rx.recv() => {
                let Some(res) = maybe else { break; };
                match res {
                    Ok(ev) => {
                        pending.push(ev);
                        coalesce_armed = true;
                        coalesce_timer
                            .as_mut()
                            .reset(tokio::time::Instant::now() + COALESCE);
                    }
                    Err(err) => {
                        warn!(error = %err, "watcher error");
                        let _ = events.send(ServiceEvent::Error { path: None, error: err.to_string() });
                    }
                }
            }

            _ = &mut coalesce_timer, if coalesce_armed => {
                coalesce_armed = false;
                let batch = std::mem::take(&mut pending);
                for event in events_to_host_events(&vault, &batch) {
                    dispatch(&manager, &events, event).await;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Modified,
    Created,
    Deleted,
}

/// Converts a batch of raw notify events into note events. Access and
/// metadata-only events are dropped since reading a file produces them.
fn events_to_host_events(vault: &Vault, batch: &[notify::Event]) -> Vec<HostEvent> {
    use notify::event::{ModifyKind, RenameMode};

    let mut out: Vec<HostEvent> = Vec::new();
    let mut by_path: std::collections::HashMap<VaultPath, (usize, Rank)> =
        std::collections::HashMap::new();

    let mut push = |out: &mut Vec<HostEvent>, path: VaultPath, rank: Rank| {
        if let Some((ix, old)) = by_path.get(&path).copied() {
            // A create followed by writes stays a create.
            if rank > old {
                out[ix] = make_event(path.clone(), rank);
                by_path.insert(path, (ix, rank));
            }
            return;
        }
        by_path.insert(path.clone(), (out.len(), rank));
        out.push(make_event(path, rank));
    };

    for ev in batch {
        match &ev.kind {
            EventKind::Access(_) => continue,
            EventKind::Modify(ModifyKind::Metadata(_)) => continue,
            _ => {}
        }

        match &ev.kind {
            EventKind::Modify(ModifyKind::Name(_)) if ev.paths.len() == 2 => {
                let from = to_note_path(vault, &ev.paths[0]);
                let to = to_note_path(vault, &ev.paths[1]);
                match (from, to) {
                    (Some(from), Some(to)) => out.push(HostEvent::Renamed { from, to }),
                    (Some(from), None) => push(&mut out, from, Rank::Deleted),
                    (None, Some(to)) => push(&mut out, to, Rank::Created),
                    (None, None) => {}
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for p in &ev.paths {
                    if let Some(rel) = to_note_path(vault, p) {
                        push(&mut out, rel, Rank::Deleted);
                    }
                }
            }
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for p in &ev.paths {
                    if p.is_file() {
                        if let Some(rel) = to_note_path(vault, p) {
                            push(&mut out, rel, Rank::Created);
                        }
                    }
                }
            }
            _ => {
                for p in &ev.paths {
                    if p.is_file() {
                        if let Some(rel) = to_note_path(vault, p) {
                            push(&mut out, rel, Rank::Modified);
                        }
                    }
                }
            }
        }
    }

    // Atomic saves remove and recreate the file; it is still there.
    for (path, (ix, rank)) in &by_path {
        if *rank == Rank::Deleted && vault.to_abs(path).is_file() {
            out[*ix] = HostEvent::Modified(path.clone());
        }
    }
    out
}

fn make_event(path: VaultPath, rank: Rank) -> HostEvent {
    match rank {
        Rank::Modified => HostEvent::Modified(path),
        Rank::Created => HostEvent::Created(path),
        Rank::Deleted => HostEvent::Deleted(path),
    }
}

fn to_note_path(vault: &Vault, abs: &Path) -> Option<VaultPath> {
    let rel = vault.to_rel(abs).ok()?;
    vault.is_note_rel(rel.as_path()).then_some(rel)
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, AccessMode, CreateKind, DataChange, ModifyKind, RemoveKind};

    use super::*;

    fn make_vault() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("vault");
        std::fs::create_dir_all(&root).expect("create vault root");
        let vault = Vault::open(&root).expect("open vault");
        (dir, vault)
    }

    fn event(kind: EventKind, paths: Vec<std::path::PathBuf>) -> notify::Event {
        notify::Event {
            kind,
            paths,
            attrs: Default::default(),
        }
    }

    fn note(vault: &Vault, rel: &str) -> std::path::PathBuf {
        let p = vault.root().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, "---\na: 1\n---\n").unwrap();
        p
    }

    #[test]
    fn ignores_access_events() {
        let (_temp, vault) = make_vault();
        let p = note(&vault, "notes/a.md");
        let ev = event(EventKind::Access(AccessKind::Open(AccessMode::Any)), vec![p]);
        assert!(events_to_host_events(&vault, &[ev]).is_empty());
    }

    #[test]
    fn skips_directories_and_non_notes() {
        let (_temp, vault) = make_vault();
        let dir_path = vault.root().join("folder");
        std::fs::create_dir_all(&dir_path).unwrap();
        let png = vault.root().join("image.png");
        std::fs::write(&png, b"x").unwrap();
        let plugin = note(&vault, ".obsidian/plugins/oxiprops/notes.md");

        let evs = vec![
            event(EventKind::Create(CreateKind::Folder), vec![dir_path]),
            event(EventKind::Create(CreateKind::File), vec![png]),
            event(EventKind::Modify(ModifyKind::Any), vec![plugin]),
        ];
        assert!(events_to_host_events(&vault, &evs).is_empty());
    }

    #[test]
    fn create_then_write_stays_a_create() {
        let (_temp, vault) = make_vault();
        let p = note(&vault, "a.md");
        let evs = vec![
            event(EventKind::Create(CreateKind::File), vec![p.clone()]),
            event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), vec![p.clone()]),
            event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), vec![p]),
        ];
        let out = events_to_host_events(&vault, &evs);
        assert_eq!(out, vec![HostEvent::Created(VaultPath::new("a.md").unwrap())]);
    }

    #[test]
    fn atomic_save_is_a_modification() {
        let (_temp, vault) = make_vault();
        let p = note(&vault, "a.md");
        let evs = vec![
            event(EventKind::Remove(RemoveKind::File), vec![p.clone()]),
            event(EventKind::Create(CreateKind::File), vec![p]),
        ];
        let out = events_to_host_events(&vault, &evs);
        assert_eq!(out, vec![HostEvent::Modified(VaultPath::new("a.md").unwrap())]);
    }

    #[test]
    fn renames_and_removals() {
        let (_temp, vault) = make_vault();
        let to = note(&vault, "b.md");
        let from = vault.root().join("a.md");
        let gone = vault.root().join("c.md");
        let evs = vec![
            event(
                EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::Both)),
                vec![from, to],
            ),
            event(EventKind::Remove(RemoveKind::File), vec![gone]),
        ];
        let out = events_to_host_events(&vault, &evs);
        assert_eq!(
            out,
            vec![
                HostEvent::Renamed {
                    from: VaultPath::new("a.md").unwrap(),
                    to: VaultPath::new("b.md").unwrap(),
                },
                HostEvent::Deleted(VaultPath::new("c.md").unwrap()),
            ]
        );
    }
}
