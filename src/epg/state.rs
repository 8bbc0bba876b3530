//! Small durable key-value state shared by the downloader and the
//! refresh coordinator: per-URL HTTP validators and the last guide file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{GuideError, Result};

const STATE_FILE: &str = "guide-state.json";

/// Validators from the last full response for one source URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalCacheEntry {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl ConditionalCacheEntry {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    validators: BTreeMap<String, ConditionalCacheEntry>,
    #[serde(default)]
    last_source_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl StateStore {
    /// Load `guide-state.json` from `storage_dir`. A missing or unreadable
    /// file starts empty.
    pub fn open(storage_dir: impl AsRef<Path>) -> Self {
        let path = storage_dir.as_ref().join(STATE_FILE);
        let state = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable guide state");
                StateFile::default()
            }),
            Err(_) => StateFile::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn validators(&self, url: &str) -> Option<ConditionalCacheEntry> {
        self.lock().validators.get(url).cloned()
    }

    /// Store validators for `url`; an empty entry removes it
    pub fn set_validators(&self, url: &str, entry: ConditionalCacheEntry) -> Result<()> {
        let mut state = self.lock();
        if entry.is_empty() {
            state.validators.remove(url);
        } else {
            state.validators.insert(url.to_string(), entry);
        }
        self.flush(&state)
    }

    pub fn last_source_path(&self) -> Option<PathBuf> {
        self.lock().last_source_path.clone()
    }

    pub fn set_last_source_path(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        state.last_source_path = Some(path.to_path_buf());
        self.flush(&state)
    }

    fn lock(&self) -> MutexGuard<'_, StateFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, state: &StateFile) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| GuideError::storage(dir, e))?;

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| GuideError::storage(&self.path, e.into()))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| GuideError::storage(dir, e))?;
        tmp.write_all(&content)
            .map_err(|e| GuideError::storage(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| GuideError::storage(&self.path, e.error))?;
        Ok(())
    }
}
