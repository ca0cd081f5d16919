//! OSM document assembly
//!
//! Stored buildings become one way each, with one node per boundary
//! vertex. Ids are provisional negatives from a per-document
//! [`IdAllocator`], so editors treat every element as new.

mod ids;
mod xml;

pub use ids::IdAllocator;
pub use xml::sanitize_xml_text;

use crate::geom::BBox;
use crate::store::StoredBuilding;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsmNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsmWay {
    pub id: i64,
    pub refs: Vec<i64>,
    pub tags: Vec<(&'static str, String)>,
}

/// An OSM 0.6 document ready to serialize
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OsmDocument {
    pub bounds: BBox,
    pub nodes: Vec<OsmNode>,
    pub ways: Vec<OsmWay>,
}

impl OsmDocument {
    pub fn empty(bounds: BBox) -> Self {
        Self {
            bounds,
            nodes: Vec::new(),
            ways: Vec::new(),
        }
    }

    /// Build a document from buildings in the given order.
    ///
    /// Node ids are allocated in ring order before the way id. With
    /// `close_ways` each way repeats its first node ref at the end.
    pub fn from_buildings(bounds: BBox, buildings: &[StoredBuilding], close_ways: bool) -> Self {
        let mut ids = IdAllocator::new();
        let mut doc = Self::empty(bounds);

        for building in buildings {
            if building.nodes.len() < 3 {
                warn!(
                    source_id = %building.source_id,
                    nodes = building.nodes.len(),
                    "Skipping building with fewer than 3 nodes"
                );
                continue;
            }

            let mut refs = Vec::with_capacity(building.nodes.len() + 1);
            for node in &building.nodes {
                let id = ids.next_id();
                doc.nodes.push(OsmNode {
                    id,
                    lat: node.lat,
                    lon: node.lon,
                });
                refs.push(id);
            }
            if close_ways {
                refs.push(refs[0]);
            }

            doc.ways.push(OsmWay {
                id: ids.next_id(),
                refs,
                tags: building.attributes.tags(),
            });
        }

        doc
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Coord;
    use crate::normalize::BuildingAttributes;
    use crate::store::StoredNode;
    use std::collections::HashSet;

    fn stored(id: i64, coords: &[(f64, f64)]) -> StoredBuilding {
        StoredBuilding {
            id,
            source_id: format!("31202/test/{}", id),
            citycode: "31202".to_string(),
            provenance: "plateau_31202_test.osm".to_string(),
            attributes: BuildingAttributes {
                height: Some(10.5),
                ..Default::default()
            },
            centroid: Coord::new(coords[0].0, coords[0].1),
            nodes: coords
                .iter()
                .enumerate()
                .map(|(seq, (lon, lat))| StoredNode {
                    id: id * 100 + seq as i64,
                    building_id: id,
                    seq: seq as i64,
                    lon: *lon,
                    lat: *lat,
                })
                .collect(),
        }
    }

    fn bounds() -> BBox {
        BBox::new(133.32, 35.41, 133.35, 35.44).unwrap()
    }

    const TRIANGLE: [(f64, f64); 3] = [(133.33, 35.42), (133.34, 35.42), (133.34, 35.43)];

    #[test]
    fn test_every_node_referenced_once() {
        let buildings = vec![stored(1, &TRIANGLE), stored(2, &TRIANGLE)];
        let doc = OsmDocument::from_buildings(bounds(), &buildings, false);

        assert_eq!(doc.ways.len(), 2);
        assert_eq!(doc.nodes.len(), 6);

        let node_ids: HashSet<i64> = doc.nodes.iter().map(|n| n.id).collect();
        let refs: Vec<i64> = doc.ways.iter().flat_map(|w| w.refs.clone()).collect();
        assert_eq!(refs.len(), 6);
        assert_eq!(refs.iter().copied().collect::<HashSet<_>>(), node_ids);

        let mut all_ids: Vec<i64> = node_ids.into_iter().collect();
        all_ids.extend(doc.ways.iter().map(|w| w.id));
        assert!(all_ids.iter().all(|id| *id < 0));
        let unique: HashSet<i64> = all_ids.iter().copied().collect();
        assert_eq!(unique.len(), all_ids.len());
    }

    #[test]
    fn test_allocation_order() {
        let doc = OsmDocument::from_buildings(bounds(), &[stored(1, &TRIANGLE)], false);
        assert_eq!(
            doc.nodes.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![-1, -2, -3]
        );
        assert_eq!(doc.ways[0].id, -4);
        assert_eq!(doc.ways[0].refs, vec![-1, -2, -3]);
        assert_eq!(doc.nodes[1].lon, 133.34);
    }

    #[test]
    fn test_close_ways_repeats_first_ref() {
        let doc = OsmDocument::from_buildings(bounds(), &[stored(1, &TRIANGLE)], true);
        assert_eq!(doc.ways[0].refs, vec![-1, -2, -3, -1]);
        assert_eq!(doc.nodes.len(), 3);
    }

    #[test]
    fn test_short_building_skipped() {
        let buildings = vec![
            stored(1, &TRIANGLE[..2]),
            stored(2, &TRIANGLE),
        ];
        let doc = OsmDocument::from_buildings(bounds(), &buildings, false);
        assert_eq!(doc.way_count(), 1);
        assert_eq!(doc.ways[0].id, -4);
    }
}
