//! Error taxonomy for the guide engine

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuideError {
    /// The XML document itself is malformed. Results gathered before
    /// `position` are handed back separately (see `ParseFailure`).
    #[error("XML error at byte {position}: {source}")]
    Parse {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("cache unreadable: {0}")]
    CacheCorrupt(String),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no guide source available")]
    NoSource,
}

impl GuideError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        GuideError::Storage {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, GuideError>;
