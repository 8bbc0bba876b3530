//! Configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::epg::DownloadConfig;
use crate::error::{GuideError, Result};

const APP_DIR: &str = "epg-guide";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideConfig {
    /// XMLTV source; empty means none configured
    #[serde(default)]
    pub guide_url: String,
    /// Age after which the adopted guide is refreshed; 0 = never
    #[serde(default = "default_staleness")]
    pub staleness_minutes: u64,
    #[serde(default = "default_true")]
    pub auto_load_on_launch: bool,
    /// Overrides the platform cache directory
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_staleness() -> u64 { 24 * 60 } // 1 Day
fn default_true() -> bool { true }
fn default_user_agent() -> String { DownloadConfig::default().user_agent }
fn default_connect_timeout() -> u64 { 30 }
fn default_read_timeout() -> u64 { 300 }
fn default_chunk_size() -> usize { 64 * 1024 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay() -> u64 { 1000 }

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            guide_url: String::new(),
            staleness_minutes: default_staleness(),
            auto_load_on_launch: true,
            storage_dir: None,
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl GuideConfig {
    /// `<config dir>/epg-guide/config.json`
    pub fn config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(APP_DIR);
        path.push("config.json");
        path
    }

    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Read `path`; a missing or unreadable file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                Self::default()
            }),
            Err(_) => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| GuideError::storage(dir, e))?;

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| GuideError::storage(path, e.into()))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| GuideError::storage(dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| GuideError::storage(path, e))?;
        tmp.persist(path).map_err(|e| GuideError::storage(path, e.error))?;
        Ok(())
    }

    /// Where downloads, the snapshot and state live
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(APP_DIR);
            path
        })
    }

    pub fn has_source(&self) -> bool {
        !self.guide_url.trim().is_empty()
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            connect_timeout_secs: self.connect_timeout_secs,
            read_timeout_secs: self.read_timeout_secs,
            chunk_size: self.chunk_size,
            user_agent: self.user_agent.clone(),
        }
    }
}
