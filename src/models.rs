//! Data models for the program guide

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single scheduled airing on one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    channel_id: String,
    title: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Program {
    /// Returns `None` unless `start < end`.
    pub fn new(
        channel_id: impl Into<String>,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Self> {
        if start >= end {
            return None;
        }
        Some(Self {
            channel_id: channel_id.into(),
            title: title.into(),
            start,
            end,
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Empty when the guide gave no title
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Half-open: airing at `start`, over at `end`
    pub fn is_airing_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Snapshots are deserialized without going through `new`
    pub(crate) fn is_well_formed(&self) -> bool {
        self.start < self.end
    }
}

/// Channel id -> display name, as declared by the guide
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelCatalog {
    names: BTreeMap<String, String>,
}

impl ChannelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel id with no name yet. Existing entries are kept.
    pub fn open(&mut self, id: &str) {
        if !self.names.contains_key(id) {
            self.names.insert(id.to_string(), String::new());
        }
    }

    /// First non-empty name wins; later names for the same id are ignored.
    pub fn assign_name(&mut self, id: &str, name: &str) {
        let name = name.trim();
        let entry = self.names.entry(id.to_string()).or_default();
        if entry.is_empty() && !name.is_empty() {
            *entry = name.to_string();
        }
    }

    /// Known, non-empty display name for `id`
    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.names
            .get(id)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Display name, or the id itself when the guide never named it
    pub fn name_or_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.display_name(id).unwrap_or(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// (id, name) pairs in id order; name may be empty
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(id, name)| (id.as_str(), name.as_str()))
    }
}

/// Self-contained copy of a parsed guide - the unit of persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideSnapshot {
    pub catalog: ChannelCatalog,
    pub programs: Vec<Program>,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub source_size_bytes: u64,
}

impl GuideSnapshot {
    pub fn new(catalog: ChannelCatalog, programs: Vec<Program>, captured_at: DateTime<Utc>) -> Self {
        Self {
            catalog,
            programs,
            captured_at,
            source_path: None,
            source_size_bytes: 0,
        }
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        self.source_path = Some(path.into());
        self.source_size_bytes = size_bytes;
        self
    }
}
