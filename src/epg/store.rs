//! Read-only schedule indices built from one guide snapshot

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::models::{ChannelCatalog, GuideSnapshot, Program};

/// A start-ordered programme list for one channel
#[derive(Debug, Clone, Copy)]
pub struct Schedule<'a> {
    programs: &'a [Program],
}

impl<'a> Schedule<'a> {
    pub fn new(programs: &'a [Program]) -> Self {
        Self { programs }
    }

    pub fn programs(&self) -> &'a [Program] {
        self.programs
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// First programme with `start <= at < end`
    pub fn current_at(&self, at: DateTime<Utc>) -> Option<&'a Program> {
        // Only programmes that have started can be airing
        let started = self.programs.partition_point(|p| p.start() <= at);
        self.programs[..started].iter().find(|p| p.end() > at)
    }

    /// First programme with `start >= at`
    pub fn next_at(&self, at: DateTime<Utc>) -> Option<&'a Program> {
        let idx = self.programs.partition_point(|p| p.start() < at);
        self.programs.get(idx)
    }

    /// The airing programme (if any) followed by up to `count` total entries
    pub fn upcoming(&self, at: DateTime<Utc>, count: usize) -> Vec<&'a Program> {
        let started = self.programs.partition_point(|p| p.start() <= at);
        let from = self.programs[..started]
            .iter()
            .position(|p| p.end() > at)
            .unwrap_or(started);
        self.programs[from..]
            .iter()
            .filter(|p| p.end() > at)
            .take(count)
            .collect()
    }
}

/// Immutable guide indices. Built once per adopted snapshot and replaced
/// wholesale, never patched.
#[derive(Debug, Clone, Default)]
pub struct GuideStore {
    catalog: ChannelCatalog,
    by_channel_id: HashMap<String, Vec<Program>>,
    /// Ordered so name lookups visit candidates deterministically
    by_display_name: BTreeMap<String, Vec<Program>>,
    program_count: usize,
    captured_at: Option<DateTime<Utc>>,
    source_path: Option<PathBuf>,
    source_size_bytes: u64,
}

impl GuideStore {
    /// A store with nothing adopted
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: GuideSnapshot) -> Self {
        let GuideSnapshot {
            catalog,
            programs,
            captured_at,
            source_path,
            source_size_bytes,
        } = snapshot;

        let mut by_channel_id: HashMap<String, Vec<Program>> = HashMap::new();
        let mut by_display_name: BTreeMap<String, Vec<Program>> = BTreeMap::new();
        let program_count = programs.len();

        for program in programs {
            let name = catalog.name_or_id(program.channel_id()).to_string();
            by_display_name.entry(name).or_default().push(program.clone());
            by_channel_id
                .entry(program.channel_id().to_string())
                .or_default()
                .push(program);
        }

        // sort_by_key is stable: equal starts keep document order
        for list in by_channel_id.values_mut() {
            list.sort_by_key(|p| p.start());
        }
        for list in by_display_name.values_mut() {
            list.sort_by_key(|p| p.start());
        }

        Self {
            catalog,
            by_channel_id,
            by_display_name,
            program_count,
            captured_at: Some(captured_at),
            source_path,
            source_size_bytes,
        }
    }

    /// Flatten back into a snapshot: channel ids ascending, each
    /// schedule in start order.
    pub fn to_snapshot(&self) -> Option<GuideSnapshot> {
        let captured_at = self.captured_at?;
        let mut ids: Vec<&String> = self.by_channel_id.keys().collect();
        ids.sort();
        let programs = ids
            .into_iter()
            .flat_map(|id| self.by_channel_id[id].iter().cloned())
            .collect();

        Some(GuideSnapshot {
            catalog: self.catalog.clone(),
            programs,
            captured_at,
            source_path: self.source_path.clone(),
            source_size_bytes: self.source_size_bytes,
        })
    }

    /// Same guide, stamped as captured at `captured_at`
    pub fn with_captured_at(&self, captured_at: DateTime<Utc>) -> Self {
        let mut store = self.clone();
        store.captured_at = Some(captured_at);
        store
    }

    pub fn is_empty(&self) -> bool {
        self.captured_at.is_none()
    }

    pub fn catalog(&self) -> &ChannelCatalog {
        &self.catalog
    }

    pub fn channel_count(&self) -> usize {
        self.catalog.len()
    }

    pub fn program_count(&self) -> usize {
        self.program_count
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn source_size_bytes(&self) -> u64 {
        self.source_size_bytes
    }

    pub fn display_name<'a>(&'a self, channel_id: &'a str) -> &'a str {
        self.catalog.name_or_id(channel_id)
    }

    /// Lexicographically first channel id carrying `name`
    pub fn channel_id_for_display_name(&self, name: &str) -> Option<&str> {
        self.catalog
            .iter()
            .find(|(_, display)| *display == name)
            .map(|(id, _)| id)
    }

    pub fn schedule(&self, channel_id: &str) -> Schedule<'_> {
        Schedule::new(
            self.by_channel_id
                .get(channel_id)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        )
    }

    pub fn schedule_for_display_name(&self, name: &str) -> Schedule<'_> {
        Schedule::new(
            self.by_display_name
                .get(name)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        )
    }

    pub fn programs_for_channel(&self, channel_id: &str) -> &[Program] {
        self.schedule(channel_id).programs()
    }

    pub fn current_program(&self, channel_id: &str, at: DateTime<Utc>) -> Option<&Program> {
        self.schedule(channel_id).current_at(at)
    }

    pub fn next_program(&self, channel_id: &str, at: DateTime<Utc>) -> Option<&Program> {
        self.schedule(channel_id).next_at(at)
    }

    pub fn upcoming(&self, channel_id: &str, at: DateTime<Utc>, count: usize) -> Vec<&Program> {
        self.schedule(channel_id).upcoming(at, count)
    }

    /// Display-name keys in lexicographic order
    pub fn display_names(&self) -> impl Iterator<Item = &str> {
        self.by_display_name.keys().map(String::as_str)
    }

    pub(crate) fn display_name_index(&self) -> &BTreeMap<String, Vec<Program>> {
        &self.by_display_name
    }
}
