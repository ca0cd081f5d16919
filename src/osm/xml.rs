//! OSM XML writer

use super::OsmDocument;
use crate::config::OutputConfig;
use crate::error::{Error, Result};
use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

/// Drop characters that XML 1.0 does not allow
pub fn sanitize_xml_text(value: &str) -> String {
    value
        .chars()
        .filter(|c| {
            matches!(c, '\t' | '\n' | '\r')
                || (*c >= '\u{20}' && *c != '\u{FFFE}' && *c != '\u{FFFF}')
        })
        .collect()
}

fn coord(value: f64) -> String {
    format!("{:.7}", value)
}

fn element<'a>(name: &'a str, attrs: &[(&str, &str)]) -> BytesStart<'a> {
    BytesStart::new(name).with_attributes(attrs.iter().copied())
}

impl OsmDocument {
    /// Serialize as an OSM 0.6 XML document
    pub fn to_xml(&self, meta: &OutputConfig) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::Start(element(
            "osm",
            &[
                ("version", "0.6"),
                ("generator", meta.generator.as_str()),
                ("copyright", meta.copyright.as_str()),
                ("attribution", meta.attribution.as_str()),
                ("license", meta.license.as_str()),
            ],
        )))?;

        writer.write_event(Event::Empty(element(
            "bounds",
            &[
                ("minlat", coord(self.bounds.min_lat).as_str()),
                ("minlon", coord(self.bounds.min_lon).as_str()),
                ("maxlat", coord(self.bounds.max_lat).as_str()),
                ("maxlon", coord(self.bounds.max_lon).as_str()),
            ],
        )))?;

        for node in &self.nodes {
            writer.write_event(Event::Empty(element(
                "node",
                &[
                    ("id", node.id.to_string().as_str()),
                    ("visible", "true"),
                    ("version", "1"),
                    ("changeset", "1"),
                    ("timestamp", timestamp.as_str()),
                    ("user", meta.user.as_str()),
                    ("uid", "1"),
                    ("lat", coord(node.lat).as_str()),
                    ("lon", coord(node.lon).as_str()),
                ],
            )))?;
        }

        for way in &self.ways {
            writer.write_event(Event::Start(element(
                "way",
                &[
                    ("id", way.id.to_string().as_str()),
                    ("visible", "true"),
                    ("version", "1"),
                    ("changeset", "1"),
                    ("timestamp", timestamp.as_str()),
                    ("user", meta.user.as_str()),
                    ("uid", "1"),
                ],
            )))?;
            for node_ref in &way.refs {
                writer.write_event(Event::Empty(element(
                    "nd",
                    &[("ref", node_ref.to_string().as_str())],
                )))?;
            }
            for (key, value) in &way.tags {
                let value = sanitize_xml_text(value);
                writer.write_event(Event::Empty(element(
                    "tag",
                    &[("k", *key), ("v", value.as_str())],
                )))?;
            }
            writer.write_event(Event::End(BytesEnd::new("way")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("osm")))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::Parse(format!("Generated XML is not UTF-8: {}", e)))
    }
}
