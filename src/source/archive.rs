//! Zip archive sources

use super::{parse_osm, SourceRecord};
use crate::error::Result;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

/// Read building ways from every `.osm` member of a zip archive.
///
/// Members are read in name order and labelled `<label>!<member path>`.
/// A malformed member fails the whole archive so it is reported once at
/// file level.
pub fn read_archive(path: &Path, label: &str) -> Result<Vec<SourceRecord>> {
    debug!("Opening zip archive {}", path.display());
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut members: Vec<String> = archive
        .file_names()
        .filter(|n| n.to_ascii_lowercase().ends_with(".osm"))
        .map(str::to_owned)
        .collect();
    members.sort();

    if members.is_empty() {
        warn!("{}: no .osm members in archive", path.display());
    }

    let mut records = Vec::new();
    for name in members {
        let entry = archive.by_name(&name)?;
        let member_label = format!("{}!{}", label, name.trim_start_matches('/'));
        debug!("Reading archive member {}", member_label);
        records.extend(parse_osm(BufReader::new(entry), &member_label)?);
    }

    Ok(records)
}
