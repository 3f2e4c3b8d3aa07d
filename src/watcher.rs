//! Change detector: native folder watches feeding a channel of file events.
//!
//! Each watched folder gets its own `notify` watcher so a fault in one handle
//! can be repaired without touching the others. Callbacks run on notify's
//! threads and only ever send on the channel.

use anyhow::{anyhow, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::model::WatchedFolder;

/// A path that was created, modified or renamed inside a watched folder.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub filter: Arc<FolderFilter>,
}

/// Compiled include/exclude globs and the size ceiling of one folder.
#[derive(Debug)]
pub struct FolderFilter {
    folder: WatchedFolder,
    root: PathBuf,
    include: Option<GlobSet>,
    exclude: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .with_context(|| format!("invalid glob pattern {:?}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

impl FolderFilter {
    pub fn new(folder: &WatchedFolder) -> Result<Self> {
        let include = if folder.include.is_empty() {
            None
        } else {
            Some(build_globset(&folder.include)?)
        };
        Ok(Self {
            folder: folder.clone(),
            root: folder.path.clone(),
            include,
            exclude: build_globset(&folder.exclude)?,
        })
    }

    /// Match events against `root` as well as the configured path. Watch
    /// backends report resolved paths (symlinked roots, `/private/var` on macOS).
    pub fn rooted_at(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    pub fn folder(&self) -> &WatchedFolder {
        &self.folder
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.folder.max_file_size
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let by_name = path
            .file_name()
            .map(|name| self.exclude.is_match(name))
            .unwrap_or(false);
        by_name || self.exclude.is_match(path)
    }

    /// Whether a path is a candidate by location and name; size and existence
    /// are checked later by the coordinator.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(root) = [self.root.as_path(), self.folder.path.as_path()]
            .into_iter()
            .find(|root| path.starts_with(root))
        else {
            return false;
        };
        if !self.folder.recursive && path.parent() != Some(root) {
            return false;
        }
        let Some(name) = path.file_name() else {
            return false;
        };
        if let Some(include) = &self.include {
            if !include.is_match(name) {
                return false;
            }
        }
        !self.is_excluded(path)
    }
}

/// Outcome of [`ChangeDetector::start`] and [`ChangeDetector::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub watching: Vec<PathBuf>,
    pub skipped: Vec<(PathBuf, String)>,
}

struct ActiveWatch {
    filter: Arc<FolderFilter>,
    _watcher: RecommendedWatcher,
    faulted: bool,
}

#[derive(Clone)]
struct Shared {
    events: mpsc::UnboundedSender<FileEvent>,
    watches: Arc<Mutex<HashMap<PathBuf, ActiveWatch>>>,
    reinstall_delay: Duration,
}

/// Fault channel and supervisor of one start..stop cycle.
struct Session {
    faults: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
}

/// Watches a set of folders and reports file changes on an unbounded channel.
pub struct ChangeDetector {
    shared: Shared,
    session: Mutex<Option<Session>>,
}

impl ChangeDetector {
    pub fn new(events: mpsc::UnboundedSender<FileEvent>, reinstall_delay: Duration) -> Self {
        Self {
            shared: Shared {
                events,
                watches: Arc::new(Mutex::new(HashMap::new())),
                reinstall_delay,
            },
            session: Mutex::new(None),
        }
    }

    /// Install a watch per folder, then scan each for files that already exist.
    /// Folders that cannot be watched are logged and skipped. Must be called
    /// from within a tokio runtime.
    pub fn start(&self, folders: &[WatchedFolder]) -> StartReport {
        let faults = self.session_faults();

        let mut report = StartReport::default();
        for folder in folders {
            match self.shared.install(folder, &faults) {
                Ok(filter) => {
                    let queued = scan_folder(&filter, &self.shared.events);
                    info!(path = %folder.path.display(), existing = queued, "watching folder");
                    report.watching.push(folder.path.clone());
                }
                Err(err) => {
                    warn!(path = %folder.path.display(), error = %err, "skipping folder");
                    report.skipped.push((folder.path.clone(), err.to_string()));
                }
            }
        }
        report
    }

    /// Fault sender of the running session, starting a session and its
    /// supervisor if there is none.
    fn session_faults(&self) -> mpsc::UnboundedSender<PathBuf> {
        let mut session = self.session.lock();
        if let Some(active) = session.as_ref() {
            return active.faults.clone();
        }
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(supervise(
            self.shared.clone(),
            faults.clone(),
            fault_rx,
            cancel.clone(),
        ));
        *session = Some(Session {
            faults: faults.clone(),
            cancel,
        });
        faults
    }

    /// Drop every watch. Pending reinstalls are abandoned; a later `start`
    /// begins a fresh session.
    pub fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
        }
        let removed = {
            let mut watches = self.shared.watches.lock();
            let n = watches.len();
            watches.clear();
            n
        };
        info!(removed, "change detector stopped");
    }

    /// Replace the watched set: folders no longer configured are unwatched,
    /// new ones are installed and scanned, unchanged ones keep their handle.
    pub fn refresh(&self, folders: &[WatchedFolder]) -> StartReport {
        let wanted: HashMap<&Path, &WatchedFolder> =
            folders.iter().map(|f| (f.path.as_path(), f)).collect();
        let to_install: Vec<WatchedFolder> = {
            let mut watches = self.shared.watches.lock();
            watches.retain(|path, watch| match wanted.get(path.as_path()) {
                Some(folder) => watch.filter.folder() == *folder,
                None => {
                    info!(path = %path.display(), "unwatching folder");
                    false
                }
            });
            folders
                .iter()
                .filter(|f| !watches.contains_key(&f.path))
                .cloned()
                .collect()
        };
        self.start(&to_install)
    }

    pub fn watched_folders(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.shared.watches.lock().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl Drop for ChangeDetector {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

impl Shared {
    fn install(
        &self,
        folder: &WatchedFolder,
        faults: &mpsc::UnboundedSender<PathBuf>,
    ) -> Result<Arc<FolderFilter>> {
        if !folder.path.is_dir() {
            return Err(anyhow!("folder does not exist or is not a directory"));
        }
        let root = folder
            .path
            .canonicalize()
            .context("failed to resolve folder path")?;
        let filter = Arc::new(FolderFilter::new(folder)?.rooted_at(root));
        let watcher = self.new_watcher(&filter, faults)?;
        self.watches.lock().insert(
            folder.path.clone(),
            ActiveWatch {
                filter: filter.clone(),
                _watcher: watcher,
                faulted: false,
            },
        );
        Ok(filter)
    }

    fn new_watcher(
        &self,
        filter: &Arc<FolderFilter>,
        faults: &mpsc::UnboundedSender<PathBuf>,
    ) -> Result<RecommendedWatcher> {
        let events = self.events.clone();
        let faults = faults.clone();
        let cb_filter = filter.clone();
        let key = filter.folder().path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => forward_event(&event, &cb_filter, &events),
            Err(err) => {
                warn!(path = %key.display(), error = %err, "watch handle faulted");
                let _ = faults.send(key.clone());
            }
        })
        .context("failed to create watcher")?;

        let mode = if filter.folder().recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(filter.root(), mode)
            .context("failed to install watch")?;
        Ok(watcher)
    }

    /// Rebuild the watch for `path` if it is still configured and faulted.
    fn reinstall(&self, path: &Path, faults: &mpsc::UnboundedSender<PathBuf>) -> Result<bool> {
        let filter = match self.watches.lock().get(path) {
            Some(watch) if watch.faulted => watch.filter.clone(),
            _ => return Ok(false),
        };
        if !path.is_dir() {
            return Err(anyhow!("folder is missing"));
        }
        let watcher = self.new_watcher(&filter, faults)?;
        let mut watches = self.watches.lock();
        match watches.get_mut(path) {
            Some(watch) if watch.faulted => {
                watch._watcher = watcher;
                watch.faulted = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn forward_event(event: &Event, filter: &Arc<FolderFilter>, events: &mpsc::UnboundedSender<FileEvent>) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        if !filter.accepts(path) {
            continue;
        }
        let sent = events.send(FileEvent {
            path: path.clone(),
            filter: filter.clone(),
        });
        if sent.is_err() {
            debug!("event receiver closed; dropping file event");
            return;
        }
    }
}

/// Queue every existing file under the folder. Returns how many were queued.
fn scan_folder(filter: &Arc<FolderFilter>, events: &mpsc::UnboundedSender<FileEvent>) -> usize {
    let folder = filter.folder();
    let mut walker = WalkDir::new(filter.root()).follow_links(false);
    if !folder.recursive {
        walker = walker.max_depth(1);
    }
    let mut queued = 0;
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || !filter.accepts(entry.path()) {
            continue;
        }
        let event = FileEvent {
            path: entry.into_path(),
            filter: filter.clone(),
        };
        if events.send(event).is_err() {
            break;
        }
        queued += 1;
    }
    queued
}

/// Reinstalls faulted watches after the configured delay.
async fn supervise(
    shared: Shared,
    faults: mpsc::UnboundedSender<PathBuf>,
    mut fault_rx: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            next = fault_rx.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };

        let first_fault = match shared.watches.lock().get_mut(&path) {
            Some(watch) if !watch.faulted => {
                watch.faulted = true;
                true
            }
            _ => false,
        };
        if !first_fault {
            continue;
        }

        let shared = shared.clone();
        let faults = faults.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(shared.reinstall_delay) => {}
                }
                match shared.reinstall(&path, &faults) {
                    Ok(true) => {
                        info!(path = %path.display(), "watch reinstalled");
                        let filter = shared.watches.lock().get(&path).map(|w| w.filter.clone());
                        if let Some(filter) = filter {
                            scan_folder(&filter, &shared.events);
                        }
                        return;
                    }
                    Ok(false) => return,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "watch reinstall failed; will retry");
                    }
                }
            }
        });
    }
    debug!("watch supervisor stopped");
}
