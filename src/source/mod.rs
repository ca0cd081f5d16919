//! Source file reading
//!
//! PLATEAU conversions arrive as OSM XML, either loose or packed in zip
//! archives. Readers here only extract raw building ways; validation and
//! attribute mapping happen in [`crate::normalize`].

mod archive;
mod osm;

pub use archive::read_archive;
pub use osm::parse_osm;

use crate::error::Result;
use crate::geom::Coord;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// A building way as found in a source file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRecord {
    /// Way id inside the source file
    pub way_id: Option<i64>,
    /// Path relative to the ingest directory, `dir/archive.zip!dir/entry.osm`
    /// for archive members
    pub file: String,
    pub tags: BTreeMap<String, String>,
    /// Resolved vertices in way order
    pub coords: Vec<Coord>,
    /// Node references that could not be resolved to a position
    pub unresolved_refs: usize,
}

/// Supported source file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Osm,
    Zip,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "osm" => Some(SourceFormat::Osm),
            "zip" => Some(SourceFormat::Zip),
            _ => None,
        }
    }
}

/// Label used in record identifiers and provenance: the path below `root`
/// with `/` separators, or the file name when `path` is outside `root`.
///
/// Files of the same name in different subdirectories get distinct labels.
pub fn file_label(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
    }
}

/// Read every building way from an `.osm` file or `.zip` archive,
/// labelling records with `label` (see [`file_label`])
pub fn read_records(path: &Path, label: &str) -> Result<Vec<SourceRecord>> {
    match SourceFormat::from_path(path) {
        Some(SourceFormat::Osm) => {
            debug!("Reading OSM file {}", path.display());
            let reader = BufReader::new(File::open(path)?);
            parse_osm(reader, label)
        }
        Some(SourceFormat::Zip) => read_archive(path, label),
        None => Err(crate::error::Error::InvalidPath(format!(
            "unsupported source file: {}",
            path.display()
        ))),
    }
}
