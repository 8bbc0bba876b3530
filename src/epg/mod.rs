//! EPG (Electronic Program Guide) module
//!
//! XMLTV parsing, indexing, name matching, snapshot persistence,
//! conditional downloads and the refresh lifecycle tying them together.

pub mod downloader;
pub mod matcher;
pub mod parser;
pub mod refresh;
pub mod snapshot;
pub mod state;
pub mod store;

#[cfg(test)]
mod parser_tests;
#[cfg(test)]
pub(crate) mod test_support;

// Re-export public types
pub use downloader::{DownloadConfig, DownloadOutcome, DownloadProgress, DownloadState, GuideDownloader};
pub use matcher::{normalize, resolve, resolve_all, ChannelMatch, MatchTier};
pub use parser::{parse_xmltv_time, GuideParser, ParseFailure, ParsedGuide};
pub use refresh::{ChannelLookup, GuideEvent, GuideStatus, Phase, RefreshCoordinator};
pub use snapshot::{SnapshotCache, SNAPSHOT_SCHEMA_VERSION};
pub use state::{ConditionalCacheEntry, StateStore};
pub use store::{GuideStore, Schedule};

use chrono::{DateTime, Local, Utc};

/// Format a timestamp as local time HH:MM
pub fn format_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M").to_string()
}

/// Format a timestamp as local datetime YYYY-MM-DD HH:MM
pub fn format_datetime(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
