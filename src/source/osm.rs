//! Streaming OSM XML reader

use super::SourceRecord;
use crate::error::{Error, Result};
use crate::geom::Coord;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::io::BufRead;
use tracing::debug;

#[derive(Default)]
struct WayBuilder {
    id: Option<i64>,
    refs: Vec<Option<i64>>,
    tags: BTreeMap<String, String>,
}

fn attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    let Some(attr) = e
        .try_get_attribute(name)
        .map_err(|err| Error::Parse(err.to_string()))?
    else {
        return Ok(None);
    };
    let value = attr
        .unescape_value()
        .map_err(|err| Error::Parse(err.to_string()))?;
    Ok(Some(value.into_owned()))
}

fn parse_attr<T: std::str::FromStr>(e: &BytesStart, name: &[u8]) -> Result<Option<T>> {
    Ok(attr(e, name)?.and_then(|v| v.trim().parse().ok()))
}

/// Parse an OSM XML document and return its building ways.
///
/// Ways without a `building` tag are skipped. Node references are resolved
/// after the whole document is read, so element order does not matter.
pub fn parse_osm<R: BufRead>(input: R, file: &str) -> Result<Vec<SourceRecord>> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut nodes: HashMap<i64, Coord> = HashMap::new();
    let mut ways: Vec<WayBuilder> = Vec::new();
    let mut current: Option<WayBuilder> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::Parse(format!("{} at byte {}: {}", file, reader.buffer_position(), e)))?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let self_closing = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    b"node" => {
                        let id = parse_attr::<i64>(e, b"id")?;
                        let lat = parse_attr::<f64>(e, b"lat")?;
                        let lon = parse_attr::<f64>(e, b"lon")?;
                        if let (Some(id), Some(lat), Some(lon)) = (id, lat, lon) {
                            nodes.insert(id, Coord::new(lon, lat));
                        }
                    }
                    b"way" => {
                        let way = WayBuilder {
                            id: parse_attr::<i64>(e, b"id")?,
                            ..Default::default()
                        };
                        if self_closing {
                            ways.push(way);
                        } else {
                            current = Some(way);
                        }
                    }
                    b"nd" => {
                        if let Some(way) = current.as_mut() {
                            way.refs.push(parse_attr::<i64>(e, b"ref")?);
                        }
                    }
                    b"tag" => {
                        if let Some(way) = current.as_mut() {
                            if let (Some(k), Some(v)) = (attr(e, b"k")?, attr(e, b"v")?) {
                                way.tags.insert(k, v);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) if e.name().as_ref() == b"way" => {
                if let Some(way) = current.take() {
                    ways.push(way);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let total_ways = ways.len();
    let records: Vec<SourceRecord> = ways
        .into_iter()
        .filter(|w| w.tags.contains_key("building"))
        .map(|w| {
            let mut coords = Vec::with_capacity(w.refs.len());
            let mut unresolved = 0;
            for r in &w.refs {
                match r.and_then(|id| nodes.get(&id)) {
                    Some(c) => coords.push(*c),
                    None => unresolved += 1,
                }
            }
            SourceRecord {
                way_id: w.id,
                file: file.to_string(),
                tags: w.tags,
                coords,
                unresolved_refs: unresolved,
            }
        })
        .collect();

    debug!(
        file,
        nodes = nodes.len(),
        ways = total_ways,
        buildings = records.len(),
        "Parsed OSM document"
    );

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="plateau2osm">
  <node id="1" lat="35.42" lon="133.33"/>
  <node id="2" lat="35.42" lon="133.34"/>
  <node id="3" lat="35.43" lon="133.34"/>
  <way id="100">
    <nd ref="1"/>
    <nd ref="2"/>
    <nd ref="3"/>
    <nd ref="1"/>
    <tag k="building" v="yes"/>
    <tag k="height" v="10.5"/>
    <tag k="name" v="A &amp; B"/>
  </way>
  <way id="101">
    <nd ref="1"/>
    <nd ref="2"/>
    <tag k="highway" v="footway"/>
  </way>
  <way id="102">
    <nd ref="1"/>
    <nd ref="99"/>
    <nd ref="3"/>
    <tag k="building" v="house"/>
  </way>
</osm>"#;

    #[test]
    fn test_parse_building_ways() {
        let records = parse_osm(SAMPLE.as_bytes(), "sample.osm").unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.way_id, Some(100));
        assert_eq!(first.file, "sample.osm");
        assert_eq!(first.coords.len(), 4);
        assert_eq!(first.coords[1], Coord::new(133.34, 35.42));
        assert_eq!(first.unresolved_refs, 0);
        assert_eq!(first.tags.get("height").map(String::as_str), Some("10.5"));
        assert_eq!(first.tags.get("name").map(String::as_str), Some("A & B"));
    }

    #[test]
    fn test_unresolved_refs_counted() {
        let records = parse_osm(SAMPLE.as_bytes(), "sample.osm").unwrap();
        let second = &records[1];
        assert_eq!(second.way_id, Some(102));
        assert_eq!(second.coords.len(), 2);
        assert_eq!(second.unresolved_refs, 1);
    }

    #[test]
    fn test_nodes_after_ways_resolve() {
        let xml = r#"<osm>
  <way id="7"><nd ref="1"/><nd ref="2"/><nd ref="3"/><tag k="building" v="yes"/></way>
  <node id="1" lat="1" lon="1"/><node id="2" lat="1" lon="2"/><node id="3" lat="2" lon="2"/>
</osm>"#;
        let records = parse_osm(xml.as_bytes(), "late.osm").unwrap();
        assert_eq!(records[0].coords.len(), 3);
    }

    #[test]
    fn test_malformed_xml_is_error() {
        let xml = "<osm><way id=\"1\"><nd ref=\"1\"></way></osm>";
        assert!(matches!(
            parse_osm(xml.as_bytes(), "bad.osm"),
            Err(Error::Parse(_))
        ));
    }
}
