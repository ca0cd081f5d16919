//! Planar geometry for building footprints
//!
//! Coordinates are WGS84 degrees. Footprints span a few metres, so centroid
//! and overlap tests treat lon/lat as a plane.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A WGS84 position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lon: f64,
    pub lat: f64,
}

impl Coord {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }

    fn bits(&self) -> (u64, u64) {
        (self.lon.to_bits(), self.lat.to_bits())
    }
}

/// Query rectangle in `min_lon,min_lat,max_lon,max_lat` order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    /// Build a validated query box
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
        let values = [min_lon, min_lat, max_lon, max_lat];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "bbox coordinates must be finite numbers".to_string(),
            ));
        }
        if !(-180.0..=180.0).contains(&min_lon) || !(-180.0..=180.0).contains(&max_lon) {
            return Err(Error::InvalidInput(
                "bbox longitude must be between -180 and 180".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(Error::InvalidInput(
                "bbox latitude must be between -90 and 90".to_string(),
            ));
        }
        if min_lon >= max_lon {
            return Err(Error::InvalidInput(format!(
                "bbox min_lon ({}) must be less than max_lon ({})",
                min_lon, max_lon
            )));
        }
        if min_lat >= max_lat {
            return Err(Error::InvalidInput(format!(
                "bbox min_lat ({}) must be less than max_lat ({})",
                min_lat, max_lat
            )));
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Inclusive point test
    pub fn contains(&self, c: Coord) -> bool {
        c.lon >= self.min_lon && c.lon <= self.max_lon && c.lat >= self.min_lat && c.lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Corners in counter-clockwise order starting at the south-west
    pub fn corners(&self) -> [Coord; 4] {
        [
            Coord::new(self.min_lon, self.min_lat),
            Coord::new(self.max_lon, self.min_lat),
            Coord::new(self.max_lon, self.max_lat),
            Coord::new(self.min_lon, self.max_lat),
        ]
    }
}

impl FromStr for BBox {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(Error::InvalidInput(
                "bbox must have 4 comma-separated values: min_lon,min_lat,max_lon,max_lat"
                    .to_string(),
            ));
        }
        let mut values = [0.0f64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse::<f64>()
                .map_err(|_| Error::InvalidInput(format!("bbox value '{}' is not a number", part)))?;
        }
        BBox::new(values[0], values[1], values[2], values[3])
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

/// Valid coordinate envelope for an ingestion run.
///
/// Written as `min_lat,max_lat,min_lon,max_lon` on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl CoordBounds {
    /// Mainland Japan plus the outlying islands
    pub fn japan() -> Self {
        Self {
            min_lat: 20.0,
            max_lat: 46.0,
            min_lon: 122.0,
            max_lon: 154.0,
        }
    }

    pub fn contains(&self, c: Coord) -> bool {
        c.lat >= self.min_lat && c.lat <= self.max_lat && c.lon >= self.min_lon && c.lon <= self.max_lon
    }

    pub fn validate(&self) -> Result<()> {
        let values = [self.min_lat, self.max_lat, self.min_lon, self.max_lon];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Config("bounds must be finite".to_string()));
        }
        if self.min_lat >= self.max_lat || self.min_lon >= self.max_lon {
            return Err(Error::Config(
                "bounds minimum must be less than maximum".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordBounds {
    fn default() -> Self {
        Self::japan()
    }
}

impl FromStr for CoordBounds {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidInput(format!("Invalid bounds: {}", s)))?;
        let [min_lat, max_lat, min_lon, max_lon] = values[..] else {
            return Err(Error::InvalidInput(
                "bounds must be min_lat,max_lat,min_lon,max_lon".to_string(),
            ));
        };
        let bounds = Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        };
        bounds
            .validate()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        Ok(bounds)
    }
}

/// A polygon boundary stored open: the closing vertex is implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    coords: Vec<Coord>,
}

impl Ring {
    /// Build a ring from a closed or open vertex list.
    ///
    /// Consecutive repeats and the duplicated closing vertex are dropped.
    /// Returns `None` when fewer than 3 distinct vertices remain.
    pub fn from_coords(coords: Vec<Coord>) -> Option<Self> {
        let mut open: Vec<Coord> = Vec::with_capacity(coords.len());
        for c in coords {
            if open.last().map_or(true, |last| last.bits() != c.bits()) {
                open.push(c);
            }
        }
        while open.len() > 1 && open[0].bits() == open[open.len() - 1].bits() {
            open.pop();
        }

        let distinct: HashSet<(u64, u64)> = open.iter().map(Coord::bits).collect();
        if distinct.len() < 3 {
            return None;
        }
        Some(Self { coords: open })
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    /// Vertex count, at least 3
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    fn edges(&self) -> impl Iterator<Item = (Coord, Coord)> + '_ {
        let n = self.coords.len();
        (0..n).map(move |i| (self.coords[i], self.coords[(i + 1) % n]))
    }

    /// Axis-aligned bounding box (may be degenerate on one axis)
    pub fn envelope(&self) -> BBox {
        let mut env = BBox {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        };
        for c in &self.coords {
            env.min_lon = env.min_lon.min(c.lon);
            env.min_lat = env.min_lat.min(c.lat);
            env.max_lon = env.max_lon.max(c.lon);
            env.max_lat = env.max_lat.max(c.lat);
        }
        env
    }

    /// Area-weighted centroid, falling back to the vertex mean for
    /// zero-area rings
    pub fn centroid(&self) -> Coord {
        let origin = self.coords[0];
        let mut area2 = 0.0;
        let mut cx = 0.0;
        let mut cy = 0.0;
        for (a, b) in self.edges() {
            let (ax, ay) = (a.lon - origin.lon, a.lat - origin.lat);
            let (bx, by) = (b.lon - origin.lon, b.lat - origin.lat);
            let cross = ax * by - bx * ay;
            area2 += cross;
            cx += (ax + bx) * cross;
            cy += (ay + by) * cross;
        }

        if area2.abs() < 1e-18 {
            let n = self.coords.len() as f64;
            let lon = self.coords.iter().map(|c| c.lon).sum::<f64>() / n;
            let lat = self.coords.iter().map(|c| c.lat).sum::<f64>() / n;
            return Coord::new(lon, lat);
        }

        Coord::new(
            origin.lon + cx / (3.0 * area2),
            origin.lat + cy / (3.0 * area2),
        )
    }

    /// Even-odd point-in-polygon test
    pub fn contains_point(&self, p: Coord) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.lat > p.lat) != (b.lat > p.lat) {
                let x = a.lon + (p.lat - a.lat) * (b.lon - a.lon) / (b.lat - a.lat);
                if p.lon < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Exact polygon/rectangle overlap, boundaries included
    pub fn intersects_bbox(&self, bbox: &BBox) -> bool {
        if !self.envelope().intersects(bbox) {
            return false;
        }
        if self.coords.iter().any(|c| bbox.contains(*c)) {
            return true;
        }
        let corners = bbox.corners();
        if corners.iter().any(|c| self.contains_point(*c)) {
            return true;
        }
        let rect_edges = [
            (corners[0], corners[1]),
            (corners[1], corners[2]),
            (corners[2], corners[3]),
            (corners[3], corners[0]),
        ];
        self.edges().any(|(a, b)| {
            rect_edges
                .iter()
                .any(|(c, d)| segments_intersect(a, b, *c, *d))
        })
    }
}

fn orientation(a: Coord, b: Coord, c: Coord) -> f64 {
    (b.lon - a.lon) * (c.lat - a.lat) - (b.lat - a.lat) * (c.lon - a.lon)
}

fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    p.lon >= a.lon.min(b.lon)
        && p.lon <= a.lon.max(b.lon)
        && p.lat >= a.lat.min(b.lat)
        && p.lat <= a.lat.max(b.lat)
}

fn segments_intersect(p1: Coord, p2: Coord, q1: Coord, q2: Coord) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}
