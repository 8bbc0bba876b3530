//! EPG (Electronic Program Guide) Parser
//! Streaming parser for XMLTV format - one forward pass, never builds a tree
//! Supports both plain XML and gzip-compressed (.xml.gz) files

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::error::GuideError;
use crate::models::{ChannelCatalog, GuideSnapshot, Program};

const READ_BUFFER: usize = 64 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Catalog and programmes collected from one parse pass
#[derive(Debug, Clone, Default)]
pub struct ParsedGuide {
    pub catalog: ChannelCatalog,
    /// Programmes in document order
    pub programs: Vec<Program>,
    /// Programmes skipped for a missing channel or an absent/unparseable time
    pub dropped_programmes: usize,
}

impl ParsedGuide {
    pub fn into_snapshot(self, captured_at: DateTime<Utc>) -> GuideSnapshot {
        GuideSnapshot::new(self.catalog, self.programs, captured_at)
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty() && self.programs.is_empty()
    }
}

/// A parse pass that stopped early. Whatever was read before the
/// failure is kept in `partial`.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ParseFailure {
    #[source]
    pub error: GuideError,
    pub partial: ParsedGuide,
}

impl From<GuideError> for ParseFailure {
    fn from(error: GuideError) -> Self {
        Self {
            error,
            partial: ParsedGuide::default(),
        }
    }
}

/// Parser state
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Root,
    Channel,
    DisplayName,
    Programme,
    Title,
}

/// Attributes of an open `<programme>`, resolved as it opens
#[derive(Debug, Default)]
struct PendingProgramme {
    channel_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    title: String,
}

/// Accumulates catalog and programmes as events arrive
struct Collector {
    guide: ParsedGuide,
    state: ParserState,
    channel_id: Option<String>,
    programme: Option<PendingProgramme>,
    text: String,
}

impl Collector {
    fn new() -> Self {
        Self {
            guide: ParsedGuide::default(),
            state: ParserState::Root,
            channel_id: None,
            programme: None,
            text: String::new(),
        }
    }

    fn open(&mut self, e: &BytesStart, self_closing: bool) {
        match (e.local_name().as_ref(), self.state) {
            (b"channel", _) => {
                let id = get_attribute(e, b"id").filter(|id| !id.is_empty());
                if let Some(ref id) = id {
                    self.guide.catalog.open(id);
                }
                if self_closing {
                    self.state = ParserState::Root;
                    self.channel_id = None;
                } else {
                    self.state = ParserState::Channel;
                    self.channel_id = id;
                }
            }
            (b"display-name", ParserState::Channel) if !self_closing => {
                self.state = ParserState::DisplayName;
                self.text.clear();
            }
            (b"programme", _) => {
                self.programme = Some(PendingProgramme {
                    channel_id: get_attribute(e, b"channel").filter(|id| !id.is_empty()),
                    start: get_attribute(e, b"start").and_then(|s| parse_xmltv_time(&s)),
                    // some feeds say "end" instead of "stop"
                    end: get_attribute(e, b"stop")
                        .or_else(|| get_attribute(e, b"end"))
                        .and_then(|s| parse_xmltv_time(&s)),
                    title: String::new(),
                });
                self.state = ParserState::Programme;
                if self_closing {
                    self.finish_programme();
                }
            }
            (b"title", ParserState::Programme) if !self_closing => {
                self.state = ParserState::Title;
                self.text.clear();
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &[u8]) {
        match (name, self.state) {
            (b"display-name", ParserState::DisplayName) => {
                if let Some(ref id) = self.channel_id {
                    self.guide.catalog.assign_name(id, &decode_xml_entities(&self.text));
                }
                self.state = ParserState::Channel;
            }
            (b"channel", ParserState::Channel | ParserState::DisplayName) => {
                self.channel_id = None;
                self.state = ParserState::Root;
            }
            (b"title", ParserState::Title) => {
                if let Some(ref mut prog) = self.programme {
                    // first title wins when a feed lists several languages
                    if prog.title.is_empty() {
                        prog.title = decode_xml_entities(&self.text).trim().to_string();
                    }
                }
                self.state = ParserState::Programme;
            }
            (b"programme", _) => self.finish_programme(),
            _ => {}
        }
    }

    fn push_text(&mut self, raw: &str) {
        if matches!(self.state, ParserState::DisplayName | ParserState::Title) {
            self.text.push_str(raw);
        }
    }

    fn finish_programme(&mut self) {
        self.state = ParserState::Root;
        let Some(pending) = self.programme.take() else {
            return;
        };
        let program = match (pending.channel_id, pending.start, pending.end) {
            (Some(channel_id), Some(start), Some(end)) => {
                Program::new(channel_id, pending.title, start, end)
            }
            _ => None,
        };
        match program {
            Some(program) => self.guide.programs.push(program),
            None => self.guide.dropped_programmes += 1,
        }
    }
}

/// EPG Parser for XMLTV format - streaming, memory efficient
pub struct GuideParser;

impl GuideParser {
    /// Parse EPG from XMLTV string (for smaller documents)
    pub fn parse(xml: &str) -> Result<ParsedGuide, ParseFailure> {
        Self::parse_reader(xml.as_bytes())
    }

    /// Parse EPG from a reader - streaming, handles large files
    pub fn parse_reader<R: BufRead>(reader: R) -> Result<ParsedGuide, ParseFailure> {
        let mut xml_reader = Reader::from_reader(reader);
        // Text is trimmed per element instead; entity refs split text into pieces
        xml_reader.config_mut().trim_text(false);

        let mut collector = Collector::new();
        let mut buf = Vec::with_capacity(8192);

        loop {
            let position = xml_reader.buffer_position();
            match xml_reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => collector.open(e, false),
                Ok(Event::Empty(ref e)) => collector.open(e, true),
                Ok(Event::End(ref e)) => collector.close(e.local_name().as_ref()),
                Ok(Event::Text(ref e)) => collector.push_text(&String::from_utf8_lossy(e.as_ref())),
                Ok(Event::CData(ref e)) => {
                    // CDATA is literal; escape '&' so the entity pass leaves it alone
                    let raw = String::from_utf8_lossy(e.as_ref()).replace('&', "&amp;");
                    collector.push_text(&raw);
                }
                Ok(Event::GeneralRef(ref e)) => {
                    collector.push_text(&format!("&{};", String::from_utf8_lossy(e.as_ref())));
                }
                Ok(Event::Eof) => break,
                Err(source) => {
                    debug!(
                        position,
                        programs = collector.guide.programs.len(),
                        "XMLTV parse stopped at malformed markup"
                    );
                    return Err(ParseFailure {
                        error: GuideError::Parse {
                            position: position as u64,
                            source,
                        },
                        partial: collector.guide,
                    });
                }
                _ => {}
            }
            buf.clear();
        }

        let guide = collector.guide;
        debug!(
            channels = guide.catalog.len(),
            programs = guide.programs.len(),
            dropped = guide.dropped_programmes,
            "parsed XMLTV guide"
        );
        Ok(guide)
    }

    /// Parse EPG from file - auto-detects gzip compression
    pub fn parse_file(path: impl AsRef<Path>) -> Result<ParsedGuide, ParseFailure> {
        let path = path.as_ref();
        let storage = |e: io::Error| ParseFailure::from(GuideError::storage(path, e));

        let file = File::open(path).map_err(storage)?;
        let mut reader = BufReader::with_capacity(READ_BUFFER, file);

        // Peek without consuming: gzip streams start with 1f 8b
        let is_gzip = reader.fill_buf().map_err(storage)?.starts_with(&GZIP_MAGIC);
        if is_gzip {
            let decoder = GzDecoder::new(reader);
            Self::parse_reader(BufReader::with_capacity(READ_BUFFER, decoder))
        } else {
            Self::parse_reader(reader)
        }
    }
}

/// Decode XML entity references in one pass; unknown or malformed
/// references are left as written
fn decode_xml_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        result.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest
            .find(';')
            .filter(|&end| end <= 12)
            .and_then(|end| decode_entity(&rest[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                result.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                result.push('&');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    result
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Get attribute value from XML element
fn get_attribute(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .map(|attr| decode_xml_entities(&String::from_utf8_lossy(&attr.value)))
}

/// Parse XMLTV time: "20240115120000 +0000", "20240115120000+0000",
/// "20240115120000" (UTC) or the minute-precision "202401151200" forms.
pub fn parse_xmltv_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let digits_end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (stamp, zone) = raw.split_at(digits_end);
    let zone = zone.trim();

    let (zoned_format, bare_format) = match stamp.len() {
        14 => ("%Y%m%d%H%M%S %z", "%Y%m%d%H%M%S"),
        12 => ("%Y%m%d%H%M %z", "%Y%m%d%H%M"),
        _ => return None,
    };

    if zone.is_empty() {
        NaiveDateTime::parse_from_str(stamp, bare_format)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    } else {
        // The offset may be glued to the digits; rejoin with exactly one space
        DateTime::parse_from_str(&format!("{stamp} {zone}"), zoned_format)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
