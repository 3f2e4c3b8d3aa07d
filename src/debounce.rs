//! Debounce and dedup coordinator.
//!
//! A single task owns every [`PendingFileEntry`]. Watch callbacks reach it only
//! through the event channel; a fixed tick promotes quiet entries to workers
//! bounded by a semaphore.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Watch;
use crate::watcher::{FileEvent, FolderFilter};

#[derive(Debug, Clone)]
pub struct DebounceSettings {
    pub window: Duration,
    pub tick: Duration,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub hash_cache_size: usize,
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self::from_config(&Watch::default())
    }
}

impl DebounceSettings {
    pub fn from_config(watch: &Watch) -> Self {
        Self {
            window: watch.debounce_window(),
            tick: watch.tick_interval(),
            batch_size: watch.batch_size.max(1),
            max_concurrency: watch.max_concurrency.max(1),
            hash_cache_size: watch.hash_cache_size.max(1),
        }
    }
}

/// A file that stayed quiet for the debounce window and passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub size: u64,
}

#[async_trait]
pub trait ReadyFileHandler: Send + Sync {
    async fn handle(&self, file: ReadyFile) -> Result<()>;
}

/// Coalesced state for one path.
#[derive(Debug, Clone)]
pub struct PendingFileEntry {
    pub path: PathBuf,
    pub filter: Arc<FolderFilter>,
    pub first_seen: Instant,
    pub last_update: Instant,
    pub update_count: u32,
    pub in_flight: bool,
    dispatched_at: Option<Instant>,
}

impl PendingFileEntry {
    fn new(event: FileEvent, now: Instant) -> Self {
        Self {
            path: event.path,
            filter: event.filter,
            first_seen: now,
            last_update: now,
            update_count: 1,
            in_flight: false,
            dispatched_at: None,
        }
    }

    fn touch(&mut self, filter: Arc<FolderFilter>, now: Instant) {
        self.filter = filter;
        self.last_update = now;
        self.update_count = self.update_count.saturating_add(1);
    }

    fn is_quiet(&self, window: Duration, now: Instant) -> bool {
        !self.in_flight && now.saturating_duration_since(self.last_update) >= window
    }
}

/// Bounded set of content hashes already handed to processing. The oldest
/// hash is forgotten first once the capacity is reached.
#[derive(Debug)]
pub struct ProcessedHashes {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ProcessedHashes {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.set.contains(hash)
    }

    /// Returns false when the hash was already present.
    pub fn insert(&mut self, hash: &str) -> bool {
        if self.set.contains(hash) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.set.insert(hash.to_string());
        self.order.push_back(hash.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceReport {
    pub dispatched: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub flushed: usize,
}

enum WorkOutcome {
    Handled,
    Duplicate,
    Failed,
}

struct Completion {
    path: PathBuf,
    outcome: WorkOutcome,
}

enum Readiness {
    Ready { size: u64 },
    NotYet,
    Drop(&'static str),
}

pub struct DebounceCoordinator {
    settings: DebounceSettings,
    events: mpsc::UnboundedReceiver<FileEvent>,
    handler: Arc<dyn ReadyFileHandler>,
    pending: HashMap<PathBuf, PendingFileEntry>,
    hashes: Arc<parking_lot::Mutex<ProcessedHashes>>,
    permits: Arc<Semaphore>,
    workers: JoinSet<Completion>,
    report: DebounceReport,
}

impl DebounceCoordinator {
    pub fn new(
        settings: DebounceSettings,
        events: mpsc::UnboundedReceiver<FileEvent>,
        handler: Arc<dyn ReadyFileHandler>,
    ) -> Self {
        let hashes = ProcessedHashes::new(settings.hash_cache_size);
        let permits = Arc::new(Semaphore::new(settings.max_concurrency));
        Self {
            settings,
            events,
            handler,
            pending: HashMap::new(),
            hashes: Arc::new(parking_lot::Mutex::new(hashes)),
            permits,
            workers: JoinSet::new(),
            report: DebounceReport::default(),
        }
    }

    /// Run until cancelled or until the event channel closes, then flush.
    pub async fn run(mut self, cancel: CancellationToken) -> DebounceReport {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.observe(event, Instant::now()),
                    None => break,
                },
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.on_joined(joined);
                }
                _ = ticker.tick() => self.dispatch_ready(Instant::now()),
            }
        }

        self.flush().await;
        info!(
            dispatched = self.report.dispatched,
            duplicates = self.report.duplicates,
            flushed = self.report.flushed,
            "debounce coordinator stopped"
        );
        self.report
    }

    fn observe(&mut self, event: FileEvent, now: Instant) {
        match self.pending.get_mut(&event.path) {
            Some(entry) => entry.touch(event.filter, now),
            None => {
                debug!(path = %event.path.display(), "tracking file");
                self.pending
                    .insert(event.path.clone(), PendingFileEntry::new(event, now));
            }
        }
    }

    fn dispatch_ready(&mut self, now: Instant) {
        let mut quiet: Vec<(Instant, PathBuf)> = self
            .pending
            .values()
            .filter(|entry| entry.is_quiet(self.settings.window, now))
            .map(|entry| (entry.last_update, entry.path.clone()))
            .collect();
        quiet.sort();

        let mut dispatched = 0;
        for (_, path) in quiet {
            if dispatched >= self.settings.batch_size {
                break;
            }
            let Some(entry) = self.pending.get(&path) else {
                continue;
            };
            let size = match check_ready(&path, &entry.filter) {
                Readiness::Ready { size } => size,
                Readiness::NotYet => {
                    debug!(path = %path.display(), "file not ready; retrying next tick");
                    continue;
                }
                Readiness::Drop(reason) => {
                    debug!(path = %path.display(), reason, "dropping pending file");
                    self.pending.remove(&path);
                    self.report.dropped += 1;
                    continue;
                }
            };
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.spawn_worker(path, size, permit, now);
            dispatched += 1;
        }
    }

    fn spawn_worker(&mut self, path: PathBuf, size: u64, permit: OwnedSemaphorePermit, now: Instant) {
        if let Some(entry) = self.pending.get_mut(&path) {
            entry.in_flight = true;
            entry.dispatched_at = Some(now);
        }
        self.report.dispatched += 1;
        let handler = self.handler.clone();
        let hashes = self.hashes.clone();
        self.workers.spawn(async move {
            let outcome = process_file(handler, hashes, &path, size).await;
            drop(permit);
            Completion { path, outcome }
        });
    }

    fn on_joined(&mut self, joined: Result<Completion, tokio::task::JoinError>) {
        let completion = match joined {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "file worker panicked");
                return;
            }
        };
        match completion.outcome {
            WorkOutcome::Duplicate => self.report.duplicates += 1,
            WorkOutcome::Handled | WorkOutcome::Failed => {}
        }
        let rearm = match self.pending.get_mut(&completion.path) {
            Some(entry) => {
                let touched_since = entry
                    .dispatched_at
                    .map(|at| entry.last_update > at)
                    .unwrap_or(false);
                entry.in_flight = false;
                entry.dispatched_at = None;
                touched_since
            }
            None => false,
        };
        if !rearm {
            self.pending.remove(&completion.path);
        }
    }

    /// Push every remaining entry through processing, ignoring the window, and
    /// wait for all workers.
    async fn flush(&mut self) {
        while let Some(joined) = self.workers.join_next().await {
            self.on_joined(joined);
        }
        while let Ok(event) = self.events.try_recv() {
            self.observe(event, Instant::now());
        }

        let mut remaining: Vec<(Instant, PathBuf)> = self
            .pending
            .values()
            .map(|entry| (entry.last_update, entry.path.clone()))
            .collect();
        remaining.sort();
        for (_, path) in remaining {
            let Some(entry) = self.pending.get(&path) else {
                continue;
            };
            match check_ready(&path, &entry.filter) {
                Readiness::Ready { size } => {
                    let permit = match self.permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.spawn_worker(path, size, permit, Instant::now());
                    self.report.flushed += 1;
                }
                Readiness::NotYet => {
                    warn!(path = %path.display(), "file still locked at shutdown; left for next start");
                    self.pending.remove(&path);
                }
                Readiness::Drop(reason) => {
                    debug!(path = %path.display(), reason, "dropping pending file");
                    self.pending.remove(&path);
                    self.report.dropped += 1;
                }
            }
        }

        while let Some(joined) = self.workers.join_next().await {
            self.on_joined(joined);
        }
    }
}

fn check_ready(path: &Path, filter: &FolderFilter) -> Readiness {
    if filter.is_excluded(path) {
        return Readiness::Drop("excluded");
    }
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Readiness::Drop("gone"),
        Err(_) => return Readiness::NotYet,
    };
    if !meta.is_file() {
        return Readiness::Drop("not a file");
    }
    if meta.len() > filter.max_file_size() {
        warn!(path = %path.display(), size = meta.len(), max = filter.max_file_size(), "file too large");
        return Readiness::Drop("too large");
    }
    match probe_exclusive(path) {
        Ok(()) => Readiness::Ready { size: meta.len() },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Readiness::Drop("gone"),
        Err(_) => Readiness::NotYet,
    }
}

/// Open the file the way a finished writer would allow. On Windows the open
/// denies all sharing so it fails while another process still holds the file.
fn probe_exclusive(path: &Path) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        opts.share_mode(0);
    }
    opts.open(path).map(|_| ())
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

async fn process_file(
    handler: Arc<dyn ReadyFileHandler>,
    hashes: Arc<parking_lot::Mutex<ProcessedHashes>>,
    path: &Path,
    size: u64,
) -> WorkOutcome {
    let owned = path.to_path_buf();
    let hashed = tokio::task::spawn_blocking(move || hash_file(&owned)).await;
    let content_hash = match hashed {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            warn!(path = %path.display(), error = %err, "failed to hash file");
            return WorkOutcome::Failed;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "hash task failed");
            return WorkOutcome::Failed;
        }
    };

    if !hashes.lock().insert(&content_hash) {
        info!(path = %path.display(), hash = %content_hash, "duplicate content; skipping");
        return WorkOutcome::Duplicate;
    }

    let file = ReadyFile {
        path: path.to_path_buf(),
        content_hash,
        size,
    };
    match handler.handle(file).await {
        Ok(()) => WorkOutcome::Handled,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ready-file handler failed");
            WorkOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WatchedFolder;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<(ReadyFile, Instant)>>>,
    }

    #[async_trait]
    impl ReadyFileHandler for RecordingHandler {
        async fn handle(&self, file: ReadyFile) -> Result<()> {
            self.seen.lock().await.push((file, Instant::now()));
            Ok(())
        }
    }

    fn fast_settings(window_ms: u64) -> DebounceSettings {
        DebounceSettings {
            window: Duration::from_millis(window_ms),
            tick: Duration::from_millis(20),
            batch_size: 20,
            max_concurrency: 5,
            hash_cache_size: 100,
        }
    }

    fn filter_for(dir: &Path) -> Arc<FolderFilter> {
        Arc::new(FolderFilter::new(&WatchedFolder::new(dir)).unwrap())
    }

    #[test]
    fn processed_hashes_evict_oldest() {
        let mut hashes = ProcessedHashes::new(2);
        assert!(hashes.insert("a"));
        assert!(!hashes.insert("a"));
        assert!(hashes.insert("b"));
        assert!(hashes.insert("c"));
        assert_eq!(hashes.len(), 2);
        assert!(!hashes.contains("a"));
        assert!(hashes.contains("b"));
        assert!(hashes.contains("c"));
    }

    #[tokio::test]
    async fn burst_for_one_path_dispatches_once_after_quiet_period() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, "<doc>1</doc>").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = RecordingHandler::default();
        let coordinator = DebounceCoordinator::new(fast_settings(300), rx, Arc::new(handler.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        let filter = filter_for(dir.path());
        tx.send(FileEvent { path: path.clone(), filter: filter.clone() }).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "<doc>2</doc>").unwrap();
        let last_event = Instant::now();
        tx.send(FileEvent { path: path.clone(), filter }).unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        {
            let seen = handler.seen.lock().await;
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0.path, path);
            assert!(seen[0].1.duration_since(last_event) >= Duration::from_millis(300));
        }

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_content_under_new_name_is_skipped() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.xml");
        let b = dir.path().join("copy-of-a.xml");
        std::fs::write(&a, "<same/>").unwrap();
        std::fs::write(&b, "<same/>").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = RecordingHandler::default();
        let coordinator = DebounceCoordinator::new(fast_settings(50), rx, Arc::new(handler.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        let filter = filter_for(dir.path());
        tx.send(FileEvent { path: a.clone(), filter: filter.clone() }).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(FileEvent { path: b, filter }).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        cancel.cancel();
        let report = task.await.unwrap();
        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.path, a);
        assert_eq!(report.duplicates, 1);
    }

    #[tokio::test]
    async fn vanished_and_oversized_files_are_dropped() {
        let dir = tempdir().unwrap();
        let big = dir.path().join("big.xml");
        std::fs::write(&big, vec![b'x'; 64]).unwrap();
        let mut folder = WatchedFolder::new(dir.path());
        folder.max_file_size = 16;
        let filter = Arc::new(FolderFilter::new(&folder).unwrap());

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = RecordingHandler::default();
        let coordinator = DebounceCoordinator::new(fast_settings(30), rx, Arc::new(handler.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        tx.send(FileEvent { path: big, filter: filter.clone() }).unwrap();
        tx.send(FileEvent { path: dir.path().join("never-existed.xml"), filter }).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.dropped, 2);
        assert!(handler.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_flushes_entries_still_in_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("late.xml");
        std::fs::write(&path, "<late/>").unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = RecordingHandler::default();
        let coordinator =
            DebounceCoordinator::new(fast_settings(60_000), rx, Arc::new(handler.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(cancel.clone()));

        tx.send(FileEvent { path: path.clone(), filter: filter_for(dir.path()) }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.seen.lock().await.is_empty());

        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.flushed, 1);
        let seen = handler.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.path, path);
    }
}
