//! Building normalization
//!
//! Turns one [`SourceRecord`] into a validated [`NormalizedBuilding`] or a
//! [`Rejection`]. Pure: no I/O, no logging.

mod tags;

pub use tags::BuildingAttributes;

use crate::geom::{Coord, CoordBounds, Ring};
use crate::source::SourceRecord;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Per-run normalization settings
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub citycode: String,
    pub bounds: CoordBounds,
    /// Tag holding the stable source building id
    pub source_id_tag: String,
}

/// A building ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBuilding {
    pub source_id: String,
    pub citycode: String,
    pub provenance: String,
    pub ring: Ring,
    pub centroid: Coord,
    /// Unordered footprint hash used for cross-file duplicate detection
    pub geom_hash: String,
    /// Ordered vertex hash used to detect geometry changes
    pub ring_hash: String,
    pub attributes: BuildingAttributes,
}

/// Why a source record was not imported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingIdentifier,
    NotABuilding,
    UnresolvedNodes,
    InvalidCoordinate,
    Degenerate,
    OutOfBounds,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingIdentifier => "missing_identifier",
            RejectReason::NotABuilding => "not_a_building",
            RejectReason::UnresolvedNodes => "unresolved_nodes",
            RejectReason::InvalidCoordinate => "invalid_coordinate",
            RejectReason::Degenerate => "degenerate",
            RejectReason::OutOfBounds => "out_of_bounds",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Normalize one source record
pub fn normalize_record(
    record: &SourceRecord,
    ctx: &NormalizeContext,
) -> Result<NormalizedBuilding, Rejection> {
    let way_id = record.way_id.ok_or_else(|| {
        Rejection::new(
            RejectReason::MissingIdentifier,
            format!("way without id in {}", record.file),
        )
    })?;

    if record.tags.get("building").map(|v| v.trim()) == Some("no") {
        return Err(Rejection::new(
            RejectReason::NotABuilding,
            format!("way {} is tagged building=no", way_id),
        ));
    }

    if record.unresolved_refs > 0 {
        return Err(Rejection::new(
            RejectReason::UnresolvedNodes,
            format!("way {}: {} node refs not found", way_id, record.unresolved_refs),
        ));
    }

    if let Some(bad) = record.coords.iter().find(|c| !c.is_finite()) {
        return Err(Rejection::new(
            RejectReason::InvalidCoordinate,
            format!("way {}: non-finite vertex {:?}", way_id, bad),
        ));
    }

    let ring = Ring::from_coords(record.coords.clone()).ok_or_else(|| {
        Rejection::new(
            RejectReason::Degenerate,
            format!("way {}: fewer than 3 distinct vertices", way_id),
        )
    })?;

    if let Some(outside) = ring.coords().iter().find(|c| !ctx.bounds.contains(**c)) {
        return Err(Rejection::new(
            RejectReason::OutOfBounds,
            format!(
                "way {}: vertex ({}, {}) outside bounds",
                way_id, outside.lon, outside.lat
            ),
        ));
    }

    let source_id = match record
        .tags
        .get(&ctx.source_id_tag)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
    {
        Some(id) => format!("plateau:{}", id),
        None => format!("{}/{}/{}", ctx.citycode, label_stem(&record.file), way_id),
    };

    Ok(NormalizedBuilding {
        source_id,
        citycode: ctx.citycode.clone(),
        provenance: format!("plateau_{}_{}", ctx.citycode, record.file),
        centroid: ring.centroid(),
        geom_hash: geometry_hash(&ring),
        ring_hash: ring_hash(&ring),
        attributes: BuildingAttributes::from_tags(&record.tags),
        ring,
    })
}

/// File label without its `.osm` extension. Directories and archive
/// member paths stay in, so same-named files in different places differ.
fn label_stem(label: &str) -> &str {
    let cut = label.len().saturating_sub(4);
    match label.get(cut..) {
        Some(ext) if cut > 0 && ext.eq_ignore_ascii_case(".osm") => &label[..cut],
        _ => label,
    }
}

fn rounded_points(ring: &Ring) -> Vec<String> {
    ring.coords()
        .iter()
        .map(|c| format!("{:.7},{:.7}", c.lon, c.lat))
        .collect()
}

/// Orientation- and start-independent footprint hash.
///
/// Vertices are rounded to 7 decimals (about 1 cm) before hashing.
pub fn geometry_hash(ring: &Ring) -> String {
    let mut points = rounded_points(ring);
    points.sort();
    blake3::hash(points.join(";").as_bytes()).to_hex().to_string()
}

/// Hash of the vertex sequence in stored order
pub fn ring_hash(ring: &Ring) -> String {
    blake3::hash(rounded_points(ring).join(";").as_bytes())
        .to_hex()
        .to_string()
}
