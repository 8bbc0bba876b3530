//! Guide downloader: conditional GET into a stable per-URL file

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::epg::state::{ConditionalCacheEntry, StateStore};
use crate::error::{GuideError, Result};

/// Download configuration
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds
    pub read_timeout_secs: u64,
    /// Chunk size for reading (bytes)
    pub chunk_size: usize,
    /// User agent string
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            chunk_size: 64 * 1024, // 64KB chunks
            user_agent: concat!("epg-guide/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// How the most recent download ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DownloadOutcome {
    #[default]
    None,
    Completed,
    NotModified,
    Failed(String),
    Cancelled,
}

/// Snapshot of the downloader, safe to hand to any thread
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadState {
    pub in_progress: bool,
    pub bytes_received: u64,
    /// 0 when the server sent no length
    pub bytes_expected: u64,
    pub last_outcome: DownloadOutcome,
    pub saved_location: Option<PathBuf>,
}

/// Bytes received so far; `expected == 0` means indeterminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub expected: u64,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        (self.expected > 0).then(|| (self.received as f64 / self.expected as f64).min(1.0))
    }
}

impl fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dl_mb = self.received as f64 / 1_048_576.0;
        match self.fraction() {
            Some(fraction) => {
                let total_mb = self.expected as f64 / 1_048_576.0;
                write!(
                    f,
                    "Downloading: {:.1} / {:.1} MB ({}%)",
                    dl_mb,
                    total_mb,
                    (fraction * 100.0) as u32
                )
            }
            None => write!(f, "Downloading: {:.1} MB", dl_mb),
        }
    }
}

enum Fetched {
    Full { path: PathBuf, bytes: u64 },
    NotModified(PathBuf),
}

/// Identifies one download attempt; a newer ticket supersedes older ones
struct Ticket {
    generation: u64,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    state: DownloadState,
    generation: u64,
    cancel: Option<Arc<AtomicBool>>,
}

/// Single-flight XMLTV downloader with HTTPS and conditional requests.
///
/// `download` blocks; run it off any thread that must stay responsive.
/// `cancel` and `state` may be called from anywhere.
pub struct GuideDownloader {
    agent: ureq::Agent,
    config: DownloadConfig,
    storage_dir: PathBuf,
    validators: Arc<StateStore>,
    shared: Mutex<Shared>,
}

impl GuideDownloader {
    pub fn new(config: DownloadConfig, storage_dir: impl Into<PathBuf>, validators: Arc<StateStore>) -> Self {
        Self {
            agent: Self::create_agent(&config),
            config,
            storage_dir: storage_dir.into(),
            validators,
            shared: Mutex::new(Shared::default()),
        }
    }

    /// Create a configured ureq agent. Status codes are inspected by hand
    /// so 304 comes back as a normal response.
    fn create_agent(config: &DownloadConfig) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.read_timeout_secs)))
            .timeout_connect(Some(Duration::from_secs(config.connect_timeout_secs)))
            .http_status_as_error(false)
            .build()
            .new_agent()
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Stable location of the downloaded copy of `url`
    pub fn cached_path_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let hash: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        let path_part = url.split(['?', '#']).next().unwrap_or(url);
        let ext = if path_part.ends_with(".gz") { "xml.gz" } else { "xml" };
        self.storage_dir.join(format!("guide-{hash}.{ext}"))
    }

    pub fn state(&self) -> DownloadState {
        self.lock().state.clone()
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock().state.in_progress
    }

    /// Fetch `url` into its stable file. Returns `None` without touching
    /// anything when another download is already running.
    pub fn download(&self, url: &str, progress: &dyn Fn(DownloadProgress)) -> Option<DownloadOutcome> {
        let ticket = self.begin(url)?;
        info!(url, "downloading guide");
        let fetched = self.fetch(url, &ticket, progress);
        Some(self.complete(&ticket, url, fetched))
    }

    /// Abort the in-flight download. The state leaves `in_progress`
    /// right away even if the transport is still blocked. No-op when idle.
    ///
    /// Renaming the finished body over the stable file is the commit
    /// point: a cancel that lands after it is too late and the download
    /// still ends `Completed`.
    pub fn cancel(&self) {
        let mut shared = self.lock();
        if let Some(token) = shared.cancel.take() {
            token.store(true, Ordering::SeqCst);
        }
        if shared.state.in_progress {
            shared.state.in_progress = false;
            shared.state.last_outcome = DownloadOutcome::Cancelled;
            info!("guide download cancelled");
        }
    }

    /// Claim the single download slot
    fn begin(&self, url: &str) -> Option<Ticket> {
        let mut shared = self.lock();
        if shared.state.in_progress {
            debug!(url, "guide download already in flight");
            return None;
        }
        shared.generation += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        shared.cancel = Some(cancel.clone());
        shared.state = DownloadState {
            in_progress: true,
            saved_location: shared.state.saved_location.take(),
            ..DownloadState::default()
        };
        Some(Ticket {
            generation: shared.generation,
            cancel,
        })
    }

    /// Turn a fetch result into the final outcome and record it, unless a
    /// newer download has taken the slot since.
    fn complete(&self, ticket: &Ticket, url: &str, fetched: Result<Fetched>) -> DownloadOutcome {
        let (outcome, saved) = match fetched {
            Ok(Fetched::Full { path, bytes }) => {
                info!(url, bytes, path = %path.display(), "guide downloaded");
                (DownloadOutcome::Completed, Some(path))
            }
            Ok(Fetched::NotModified(path)) => {
                info!(url, "guide not modified, reusing cached copy");
                (DownloadOutcome::NotModified, Some(path))
            }
            // Transport errors caused by tearing down a cancelled transfer
            Err(_) if ticket.cancel.load(Ordering::SeqCst) => (DownloadOutcome::Cancelled, None),
            Err(e) => {
                warn!(url, error = %e, "guide download failed");
                (DownloadOutcome::Failed(e.to_string()), None)
            }
        };

        let mut shared = self.lock();
        if shared.generation == ticket.generation {
            shared.cancel = None;
            shared.state.in_progress = false;
            shared.state.last_outcome = outcome.clone();
            if saved.is_some() {
                shared.state.saved_location = saved;
            }
        }
        outcome
    }

    fn fetch(&self, url: &str, ticket: &Ticket, progress: &dyn Fn(DownloadProgress)) -> Result<Fetched> {
        let target = self.cached_path_for(url);

        let mut request = self
            .agent
            .get(url)
            .header("User-Agent", self.config.user_agent.as_str());
        // Validators only describe the copy on disk; without it, ask for everything
        if target.exists() {
            if let Some(cached) = self.validators.validators(url) {
                if let Some(ref etag) = cached.etag {
                    request = request.header("If-None-Match", etag.as_str());
                }
                if let Some(ref last_modified) = cached.last_modified {
                    request = request.header("If-Modified-Since", last_modified.as_str());
                }
            }
        }

        let response = request
            .call()
            .map_err(|e| GuideError::Network(format!("Request failed: {}", e)))?;
        Self::check_cancelled(ticket)?;

        let status = response.status();
        if status == 304 {
            if !target.exists() {
                return Err(GuideError::Network(
                    "server reported not modified but no cached copy exists".to_string(),
                ));
            }
            return Ok(Fetched::NotModified(target));
        }
        if !status.is_success() {
            return Err(GuideError::Network(format!("HTTP error: {}", status)));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        // Get content length if available
        let total_size: u64 = header("Content-Length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let validators = ConditionalCacheEntry {
            etag: header("ETag"),
            last_modified: header("Last-Modified"),
        };

        fs::create_dir_all(&self.storage_dir)
            .map_err(|e| GuideError::storage(&self.storage_dir, e))?;
        // Stream into a temp file next to the target; dropped (and deleted) on any error
        let mut file = NamedTempFile::new_in(&self.storage_dir)
            .map_err(|e| GuideError::storage(&self.storage_dir, e))?;

        let mut reader = response.into_body().into_reader();
        let mut buffer = vec![0u8; self.config.chunk_size.max(1024)];
        let mut downloaded: u64 = 0;
        self.report(ticket, progress, downloaded, total_size);

        loop {
            Self::check_cancelled(ticket)?;
            match reader.read(&mut buffer) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    file.write_all(&buffer[..n])
                        .map_err(|e| GuideError::storage(file.path(), e))?;
                    downloaded += n as u64;
                    self.report(ticket, progress, downloaded, total_size);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(GuideError::Network(format!("Read failed: {}", e))),
            }
        }

        file.flush().map_err(|e| GuideError::storage(file.path(), e))?;
        Self::check_cancelled(ticket)?;
        file.persist(&target)
            .map_err(|e| GuideError::storage(&target, e.error))?;

        if let Err(e) = self.validators.set_validators(url, validators) {
            warn!(url, error = %e, "could not record guide validators");
        }
        Ok(Fetched::Full {
            path: target,
            bytes: downloaded,
        })
    }

    fn check_cancelled(ticket: &Ticket) -> Result<()> {
        if ticket.cancel.load(Ordering::SeqCst) {
            Err(GuideError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn report(&self, ticket: &Ticket, progress: &dyn Fn(DownloadProgress), received: u64, expected: u64) {
        {
            let mut shared = self.lock();
            if shared.generation != ticket.generation || ticket.cancel.load(Ordering::SeqCst) {
                return;
            }
            shared.state.bytes_received = received;
            shared.state.bytes_expected = expected;
        }
        progress(DownloadProgress { received, expected });
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
