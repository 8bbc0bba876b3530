//! XMLTV guide engine: parse, index, match, cache and refresh program guides

pub mod config;
pub mod epg;
pub mod error;
pub mod models;

pub use config::GuideConfig;
pub use error::{GuideError, Result};
pub use models::{ChannelCatalog, GuideSnapshot, Program};
