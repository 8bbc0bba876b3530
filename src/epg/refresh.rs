//! Refresh coordinator: warm start, staleness, download, re-parse, publish
//!
//! The adopted guide lives behind a single `RwLock<Arc<GuideStore>>`. Work
//! happens on one background worker at a time; readers clone the `Arc` and
//! never wait on a parse or a download.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::GuideConfig;
use crate::epg::downloader::{DownloadOutcome, DownloadProgress, DownloadState, GuideDownloader};
use crate::epg::matcher::{self, MatchTier};
use crate::epg::parser::{GuideParser, ParseFailure, ParsedGuide};
use crate::epg::snapshot::SnapshotCache;
use crate::epg::state::StateStore;
use crate::epg::store::{GuideStore, Schedule};
use crate::error::{GuideError, Result};
use crate::models::Program;

/// Lifecycle phase of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing adopted yet
    Cold,
    WarmFromSnapshot,
    Live,
    Downloading,
    Reparsing,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Cold => "cold",
            Phase::WarmFromSnapshot => "warm (snapshot)",
            Phase::Live => "live",
            Phase::Downloading => "downloading",
            Phase::Reparsing => "re-parsing",
        }
    }
}

/// Notifications sent to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum GuideEvent {
    Phase(Phase),
    Progress(DownloadProgress),
    /// A new store was published
    Updated { channels: usize, programs: usize },
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GuideStatus {
    pub phase: Phase,
    pub channel_count: usize,
    pub program_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub download: DownloadState,
}

/// Owned answer to "what is on this channel now"
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelLookup {
    pub tier: MatchTier,
    /// Guide display name the query resolved to
    pub display_name: String,
    pub current: Option<Program>,
    pub next: Option<Program>,
}

struct Inner {
    config: GuideConfig,
    downloader: Arc<GuideDownloader>,
    snapshots: SnapshotCache,
    state: Arc<StateStore>,
    store: RwLock<Arc<GuideStore>>,
    phase: Mutex<Phase>,
    message: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<GuideEvent>>>,
    /// One worker at a time
    refreshing: AtomicBool,
    cancel_requested: AtomicBool,
}

/// Lets a progress report through only when its percent (or MB, for an
/// unknown length) differs from the last one let through
#[derive(Default)]
pub(crate) struct ProgressThrottle {
    last: Cell<Option<(bool, u64)>>,
}

impl ProgressThrottle {
    pub(crate) fn advance(&self, progress: &DownloadProgress) -> bool {
        let step = match progress.fraction() {
            Some(fraction) => (true, (fraction * 100.0) as u64),
            None => (false, progress.received / 1_048_576),
        };
        if self.last.get() == Some(step) {
            return false;
        }
        self.last.set(Some(step));
        true
    }
}

/// Releases the worker slot even if the job panics
struct WorkerSlot<'a>(&'a AtomicBool);

impl Drop for WorkerSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        config: GuideConfig,
        downloader: Arc<GuideDownloader>,
        snapshots: SnapshotCache,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                downloader,
                snapshots,
                state,
                store: RwLock::new(Arc::new(GuideStore::empty())),
                phase: Mutex::new(Phase::Cold),
                message: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                refreshing: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Wire up every component under `config.storage_dir()`
    pub fn from_config(config: GuideConfig) -> Self {
        let storage_dir = config.storage_dir();
        let state = Arc::new(StateStore::open(&storage_dir));
        let downloader = Arc::new(GuideDownloader::new(
            config.download_config(),
            &storage_dir,
            state.clone(),
        ));
        let snapshots = SnapshotCache::new(&storage_dir);
        Self::new(config, downloader, snapshots, state)
    }

    pub fn config(&self) -> &GuideConfig {
        &self.inner.config
    }

    pub fn downloader(&self) -> &GuideDownloader {
        &self.inner.downloader
    }

    /// Warm start on a worker: snapshot first, then the last guide file,
    /// then the network. `None` when auto-load is off or a worker is busy.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.auto_load_on_launch {
            info!("auto-load disabled, staying cold");
            return None;
        }
        self.spawn_worker(|this| this.warm_start())
    }

    /// Adopt whatever is on disk without touching the network
    pub fn load_cached(&self) -> Option<JoinHandle<()>> {
        self.spawn_worker(|this| this.adopt_local())
    }

    /// The currently adopted guide
    pub fn store(&self) -> Arc<GuideStore> {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events are buffered per receiver until read. Progress is sent at
    /// most once per whole percent (per MB when the size is unknown).
    pub fn subscribe(&self) -> Receiver<GuideEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    pub fn status(&self) -> GuideStatus {
        let store = self.store();
        GuideStatus {
            phase: *lock(&self.inner.phase),
            channel_count: store.channel_count(),
            program_count: store.program_count(),
            last_updated: store.captured_at(),
            last_message: lock(&self.inner.message).clone(),
            download: self.inner.downloader.state(),
        }
    }

    /// Download and adopt the configured guide regardless of age
    pub fn refresh_now(&self) -> Option<JoinHandle<()>> {
        if self.inner.downloader.is_in_progress() {
            debug!("refresh skipped, download in flight");
            return None;
        }
        self.spawn_worker(|this| this.run_refresh())
    }

    pub fn maybe_refresh(&self) -> Option<JoinHandle<()>> {
        self.maybe_refresh_at(Utc::now())
    }

    /// Refresh only when the adopted guide is older than the threshold
    pub fn maybe_refresh_at(&self, now: DateTime<Utc>) -> Option<JoinHandle<()>> {
        if !self.is_stale(now) {
            return None;
        }
        self.refresh_now()
    }

    /// Re-parse the last successfully loaded guide file without the network
    pub fn reload_last_file(&self) -> Result<Option<JoinHandle<()>>> {
        let path = self
            .inner
            .state
            .last_source_path()
            .filter(|p| p.exists())
            .ok_or(GuideError::NoSource)?;
        Ok(self.spawn_worker(move |this| {
            this.set_phase(Phase::Reparsing);
            this.load_file(&path);
        }))
    }

    /// Abort the in-flight download, and any pending retry
    pub fn cancel_refresh(&self) {
        if self.inner.refreshing.load(Ordering::SeqCst) {
            self.inner.cancel_requested.store(true, Ordering::SeqCst);
        }
        self.inner.downloader.cancel();
    }

    /// Resolve a channel-list name and report what airs at `at`
    pub fn lookup(&self, name: &str, at: DateTime<Utc>) -> Option<ChannelLookup> {
        let store = self.store();
        let found = matcher::resolve(name, &store)?;
        let schedule = Schedule::new(found.programs);
        Some(ChannelLookup {
            tier: found.tier,
            display_name: found.key.to_string(),
            current: schedule.current_at(at).cloned(),
            next: schedule.next_at(at).cloned(),
        })
    }

    /// Path the configured URL downloads to
    pub fn cached_guide_path(&self) -> Option<PathBuf> {
        let config = &self.inner.config;
        config
            .has_source()
            .then(|| self.inner.downloader.cached_path_for(config.guide_url.trim()))
    }

    /// Whether an automatic refresh is due at `now`
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let config = &self.inner.config;
        if config.staleness_minutes == 0 || !config.has_source() {
            return false;
        }
        match self.store().captured_at() {
            Some(captured) => {
                let threshold = chrono::Duration::minutes(config.staleness_minutes as i64);
                now - captured >= threshold
            }
            None => true,
        }
    }

    fn spawn_worker<F>(&self, job: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        if self.inner.refreshing.swap(true, Ordering::SeqCst) {
            debug!("guide worker already running");
            return None;
        }
        self.inner.cancel_requested.store(false, Ordering::SeqCst);
        let this = self.clone();
        Some(thread::spawn(move || {
            let _slot = WorkerSlot(&this.inner.refreshing);
            job(&this);
        }))
    }

    fn warm_start(&self) {
        self.adopt_local();
        if self.store().is_empty() {
            if self.inner.config.has_source() {
                self.run_refresh();
            }
        } else if self.is_stale(Utc::now()) {
            self.run_refresh();
        }
    }

    /// Snapshot, else the last guide file still on disk
    fn adopt_local(&self) {
        if let Some(snapshot) = self.inner.snapshots.load() {
            let store = GuideStore::from_snapshot(snapshot);
            info!(
                channels = store.channel_count(),
                programs = store.program_count(),
                "warm start from snapshot"
            );
            let message = format!("Loaded {} programs from cache", store.program_count());
            self.publish(Arc::new(store), Phase::WarmFromSnapshot, message);
        } else if let Some(path) = self.inner.state.last_source_path().filter(|p| p.exists()) {
            info!(path = %path.display(), "no snapshot, parsing last guide file");
            self.set_phase(Phase::Reparsing);
            self.load_file(&path);
        }
    }

    fn run_refresh(&self) {
        let url = self.inner.config.guide_url.trim().to_string();
        if url.is_empty() {
            self.fail(GuideError::NoSource.to_string());
            return;
        }

        let attempts = self.inner.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.cancel_pending() {
                self.cancelled();
                return;
            }
            self.set_phase(Phase::Downloading);
            let throttle = ProgressThrottle::default();
            let outcome = self.inner.downloader.download(&url, &|p| {
                if throttle.advance(&p) {
                    self.broadcast(GuideEvent::Progress(p));
                }
            });

            match outcome {
                Some(DownloadOutcome::Completed) => {
                    self.set_phase(Phase::Reparsing);
                    self.load_file(&self.inner.downloader.cached_path_for(&url));
                    return;
                }
                Some(DownloadOutcome::NotModified) => {
                    self.not_modified(&self.inner.downloader.cached_path_for(&url));
                    return;
                }
                Some(DownloadOutcome::Cancelled) => {
                    self.cancelled();
                    return;
                }
                Some(DownloadOutcome::Failed(reason)) => {
                    if attempt < attempts && !self.cancel_pending() {
                        warn!(attempt, attempts, %reason, "guide download failed, retrying");
                        thread::sleep(Duration::from_millis(self.inner.config.retry_delay_ms));
                        continue;
                    }
                    self.fail(format!("Download failed: {}", reason));
                    return;
                }
                Some(DownloadOutcome::None) | None => {
                    debug!("download already in flight elsewhere");
                    self.settle();
                    return;
                }
            }
        }
    }

    /// 304: when the adopted guide is the cached file, only the age moves.
    /// Anything else adopted (another file, an older URL) yields to the
    /// cached copy.
    fn not_modified(&self, path: &Path) {
        let current = self.store();
        let on_disk = fs::metadata(path).map(|m| m.len()).ok();
        let adopted_from_cache =
            current.source_path() == Some(path) && on_disk == Some(current.source_size_bytes());
        if current.is_empty() || !adopted_from_cache {
            info!(path = %path.display(), "guide not modified, parsing cached copy");
            self.set_phase(Phase::Reparsing);
            self.load_file(path);
            return;
        }

        let store = Arc::new(current.with_captured_at(Utc::now()));
        self.publish(store.clone(), Phase::Live, "Guide is up to date".to_string());
        self.save_snapshot(&store);
    }

    /// Parse `path` and adopt it. A syntax error adopts the partial result
    /// only when nothing is adopted yet.
    fn load_file(&self, path: &Path) {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match GuideParser::parse_file(path) {
            Ok(parsed) => self.adopt(parsed, path, size),
            Err(ParseFailure { error, partial }) => {
                if self.store().is_empty() && !partial.is_empty() {
                    warn!(
                        path = %path.display(),
                        programs = partial.programs.len(),
                        "adopting partial guide"
                    );
                    self.adopt(partial, path, size);
                }
                self.fail(format!("Failed to parse guide: {}", error));
            }
        }
    }

    fn adopt(&self, parsed: ParsedGuide, path: &Path, size: u64) {
        if parsed.dropped_programmes > 0 {
            info!(dropped = parsed.dropped_programmes, "skipped malformed programmes");
        }
        let snapshot = parsed.into_snapshot(Utc::now()).with_source(path, size);
        let store = Arc::new(GuideStore::from_snapshot(snapshot));
        info!(
            channels = store.channel_count(),
            programs = store.program_count(),
            path = %path.display(),
            "adopted guide"
        );

        let message = format!(
            "Loaded {} programs for {} channels",
            store.program_count(),
            store.channel_count()
        );
        self.publish(store.clone(), Phase::Live, message);

        if let Err(e) = self.inner.state.set_last_source_path(path) {
            warn!(error = %e, "could not record last guide file");
        }
        self.save_snapshot(&store);
    }

    fn save_snapshot(&self, store: &GuideStore) {
        let Some(snapshot) = store.to_snapshot() else {
            return;
        };
        if let Err(e) = self.inner.snapshots.save(&snapshot) {
            warn!(error = %e, "could not save guide snapshot");
        }
    }

    fn publish(&self, store: Arc<GuideStore>, phase: Phase, message: String) {
        let event = GuideEvent::Updated {
            channels: store.channel_count(),
            programs: store.program_count(),
        };
        *self
            .inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner) = store;
        self.set_phase(phase);
        *lock(&self.inner.message) = Some(message);
        self.broadcast(event);
    }

    fn fail(&self, message: String) {
        warn!(%message, "guide refresh failed");
        *lock(&self.inner.message) = Some(message.clone());
        self.settle();
        self.broadcast(GuideEvent::Failed(message));
    }

    fn cancelled(&self) {
        info!("guide refresh cancelled");
        *lock(&self.inner.message) = Some("Download cancelled".to_string());
        self.settle();
        self.broadcast(GuideEvent::Cancelled);
    }

    /// Back to a resting phase after work ends without a new store
    fn settle(&self) {
        let resting = if self.store().is_empty() {
            Phase::Cold
        } else {
            Phase::Live
        };
        self.set_phase(resting);
    }

    fn cancel_pending(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: Phase) {
        let changed = {
            let mut current = lock(&self.inner.phase);
            std::mem::replace(&mut *current, phase) != phase
        };
        if changed {
            debug!(phase = phase.label(), "guide phase");
            self.broadcast(GuideEvent::Phase(phase));
        }
    }

    /// Send to every subscriber, dropping the ones that hung up
    fn broadcast(&self, event: GuideEvent) {
        lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
