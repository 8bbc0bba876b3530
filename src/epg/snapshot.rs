//! Warm-start cache: the last adopted guide, flattened to JSON

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{GuideError, Result};
use crate::models::GuideSnapshot;

const SNAPSHOT_FILE: &str = "guide-snapshot.json";

/// Bumped whenever the snapshot layout changes; older files are ignored
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeOut<'a> {
    schema_version: u32,
    snapshot: &'a GuideSnapshot,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    schema_version: u32,
    snapshot: GuideSnapshot,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    /// Cache file lives directly inside `storage_dir`
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            path: storage_dir.as_ref().join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the old cache, so a
    /// failed save leaves the previous snapshot intact.
    pub fn save(&self, snapshot: &GuideSnapshot) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| GuideError::storage(dir, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| GuideError::storage(dir, e))?;
        let tmp_path = tmp.path().to_path_buf();
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let envelope = EnvelopeOut {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                snapshot,
            };
            serde_json::to_writer(&mut writer, &envelope)
                .map_err(|e| GuideError::storage(&tmp_path, e.into()))?;
            writer.flush().map_err(|e| GuideError::storage(&tmp_path, e))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| GuideError::storage(&self.path, e.error))?;

        debug!(
            path = %self.path.display(),
            programs = snapshot.programs.len(),
            "saved guide snapshot"
        );
        Ok(())
    }

    /// Restore the cached snapshot; any problem means "no snapshot"
    pub fn load(&self) -> Option<GuideSnapshot> {
        match self.try_load() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no usable guide snapshot");
                None
            }
        }
    }

    /// Like `load`, but says why nothing came back
    pub fn try_load(&self) -> Result<GuideSnapshot> {
        let file = fs::File::open(&self.path).map_err(|e| GuideError::storage(&self.path, e))?;
        let envelope: EnvelopeIn = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| GuideError::CacheCorrupt(e.to_string()))?;

        if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(GuideError::CacheCorrupt(format!(
                "schema version {} (expected {})",
                envelope.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }

        let mut snapshot = envelope.snapshot;
        snapshot.programs.retain(|p| p.is_well_formed());
        Ok(snapshot)
    }

    /// Remove the cache file; a missing file is fine
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GuideError::storage(&self.path, e)),
        }
    }
}
