//! Tests for XMLTV guide parsing

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::{DateTime, Utc};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    use crate::epg::parser::*;
    use crate::error::GuideError;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    const SIMPLE_GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE tv SYSTEM "xmltv.dtd">
<tv generator-info-name="test">
  <channel id="bbc1">
    <display-name>BBC One</display-name>
    <display-name>BBC 1 HD</display-name>
    <icon src="http://example.com/bbc1.png"/>
  </channel>
  <programme start="20240115120000 +0000" stop="20240115130000 +0000" channel="bbc1">
    <title lang="en">News at Noon</title>
    <desc>Daily news broadcast</desc>
    <category>News</category>
  </programme>
</tv>"#;

    #[test]
    fn test_parse_simple_epg() {
        let guide = GuideParser::parse(SIMPLE_GUIDE).unwrap();

        assert_eq!(guide.catalog.len(), 1);
        assert_eq!(guide.catalog.display_name("bbc1"), Some("BBC One"));
        assert_eq!(guide.programs.len(), 1);

        let program = &guide.programs[0];
        assert_eq!(program.channel_id(), "bbc1");
        assert_eq!(program.title(), "News at Noon");
        assert_eq!(program.start(), utc("2024-01-15T12:00:00Z"));
        assert_eq!(program.end(), utc("2024-01-15T13:00:00Z"));
        assert_eq!(guide.dropped_programmes, 0);
    }

    #[test]
    fn test_programmes_before_channels() {
        let xml = r#"<tv>
  <programme start="20240115120000" stop="20240115130000" channel="ch2"><title>Show</title></programme>
  <channel id="ch2"><display-name>Channel Two</display-name></channel>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs.len(), 1);
        assert_eq!(guide.catalog.display_name("ch2"), Some("Channel Two"));
    }

    #[test]
    fn test_channel_without_display_name_is_cataloged() {
        let xml = r#"<tv>
  <channel id="bare"></channel>
  <channel id="closed"/>
  <channel><display-name>No Id</display-name></channel>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.catalog.len(), 2);
        assert_eq!(guide.catalog.display_name("bare"), None);
        assert_eq!(guide.catalog.name_or_id("closed"), "closed");
    }

    #[test]
    fn test_malformed_programmes_are_dropped_and_counted() {
        let xml = r#"<tv>
  <programme start="20240115120000 +0000" stop="20240115130000 +0000" channel="a"><title>Good 1</title></programme>
  <programme start="not a time" stop="20240115130000 +0000" channel="a"><title>Bad start</title></programme>
  <programme stop="20240115130000 +0000" channel="a"><title>No start</title></programme>
  <programme start="20240115120000 +0000" channel="a"><title>No stop</title></programme>
  <programme start="20240115120000 +0000" stop="20240115130000 +0000"><title>No channel</title></programme>
  <programme start="20240115130000 +0000" stop="20240115120000 +0000" channel="a"><title>Backwards</title></programme>
  <programme start="20240115130000 +0000" stop="20240115140000 +0000" channel="a"><title>Good 2</title></programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs.len(), 2);
        assert_eq!(guide.dropped_programmes, 5);
        let titles: Vec<&str> = guide.programs.iter().map(|p| p.title()).collect();
        assert_eq!(titles, vec!["Good 1", "Good 2"]);
    }

    #[test]
    fn test_end_attribute_accepted_without_stop() {
        let xml = r#"<tv>
  <programme start="20240115120000+0000" end="20240115123000+0000" channel="a"><title>Short</title></programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs.len(), 1);
        assert_eq!(guide.programs[0].end(), utc("2024-01-15T12:30:00Z"));
    }

    #[test]
    fn test_missing_title_keeps_programme() {
        let xml = r#"<tv>
  <programme start="20240115120000" stop="20240115130000" channel="a"/>
  <programme start="20240115130000" stop="20240115140000" channel="a"><title>   </title></programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs.len(), 2);
        assert!(guide.programs.iter().all(|p| p.title().is_empty()));
    }

    #[test]
    fn test_entities_and_cdata_in_text() {
        let xml = r#"<tv>
  <channel id="at&amp;t"><display-name>AT&amp;T Sports</display-name></channel>
  <programme start="20240115120000" stop="20240115130000" channel="at&amp;t"><title>Tom &amp; Jerry &#8211; Caf&#233;</title></programme>
  <programme start="20240115130000" stop="20240115140000" channel="at&amp;t"><title><![CDATA[Q&A <Live>]]></title></programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.catalog.display_name("at&t"), Some("AT&T Sports"));
        assert_eq!(guide.programs[0].channel_id(), "at&t");
        assert_eq!(guide.programs[0].title(), "Tom & Jerry \u{2013} Café");
        assert_eq!(guide.programs[1].title(), "Q&A <Live>");
    }

    #[test]
    fn test_first_title_wins() {
        let xml = r#"<tv>
  <programme start="20240115120000" stop="20240115130000" channel="a">
    <title lang="fr">Le Journal</title>
    <title lang="en">The News</title>
  </programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs[0].title(), "Le Journal");
    }

    #[test]
    fn test_malformed_xml_keeps_partial_result() {
        let xml = r#"<tv>
  <channel id="a"><display-name>Alpha</display-name></channel>
  <programme start="20240115120000" stop="20240115130000" channel="a"><title>Before</title></programme>
  <programme start="20240115130000" stop="20240115140000" channel="a"><title>Broken</programme>
  <programme start="20240115140000" stop="20240115150000" channel="a"><title>After</title></programme>
</tv>"#;
        let failure = GuideParser::parse(xml).unwrap_err();
        assert!(matches!(failure.error, GuideError::Parse { .. }));
        assert_eq!(failure.partial.catalog.display_name("a"), Some("Alpha"));
        assert_eq!(failure.partial.programs.len(), 1);
        assert_eq!(failure.partial.programs[0].title(), "Before");
    }

    #[test]
    fn test_program_count() {
        let xml = r#"<tv>
  <programme start="20240115120000" stop="20240115130000" channel="ch1"><title>Show 1</title></programme>
  <programme start="20240115130000" stop="20240115140000" channel="ch1"><title>Show 2</title></programme>
  <programme start="20240115120000" stop="20240115130000" channel="ch2"><title>Show 3</title></programme>
</tv>"#;
        let guide = GuideParser::parse(xml).unwrap();
        assert_eq!(guide.programs.len(), 3);
    }

    #[test]
    fn test_parse_plain_and_gzip_files() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("guide.xml");
        std::fs::write(&plain, SIMPLE_GUIDE).unwrap();

        let gz = dir.path().join("guide.xml.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SIMPLE_GUIDE.as_bytes()).unwrap();
        std::fs::write(&gz, encoder.finish().unwrap()).unwrap();

        let from_plain = GuideParser::parse_file(&plain).unwrap();
        let from_gz = GuideParser::parse_file(&gz).unwrap();
        assert_eq!(from_plain.programs, from_gz.programs);
        assert_eq!(from_plain.catalog, from_gz.catalog);
    }

    #[test]
    fn test_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let failure = GuideParser::parse_file(dir.path().join("nope.xml")).unwrap_err();
        assert!(matches!(failure.error, GuideError::Storage { .. }));
        assert!(failure.partial.is_empty());
    }
}
