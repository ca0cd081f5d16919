//! Source tag to building attribute mapping

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const HEIGHT_RANGE: std::ops::RangeInclusive<f64> = 0.5..=300.0;
const ELE_RANGE: std::ops::RangeInclusive<f64> = -100.0..=9000.0;
const LEVELS_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// Canonical building attributes. `None` means the tag is omitted on output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingAttributes {
    pub building: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ele: Option<f64>,
    #[serde(default, rename = "building:levels", skip_serializing_if = "Option::is_none")]
    pub levels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "addr:housenumber", skip_serializing_if = "Option::is_none")]
    pub housenumber: Option<String>,
    #[serde(default, rename = "addr:street", skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, rename = "building:material", skip_serializing_if = "Option::is_none")]
    pub building_material: Option<String>,
    #[serde(default, rename = "roof:material", skip_serializing_if = "Option::is_none")]
    pub roof_material: Option<String>,
    #[serde(default, rename = "roof:shape", skip_serializing_if = "Option::is_none")]
    pub roof_shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amenity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tourism: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leisure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landuse: Option<String>,
}

impl Default for BuildingAttributes {
    fn default() -> Self {
        Self {
            building: "yes".to_string(),
            height: None,
            ele: None,
            levels: None,
            name: None,
            housenumber: None,
            street: None,
            start_date: None,
            building_material: None,
            roof_material: None,
            roof_shape: None,
            amenity: None,
            shop: None,
            tourism: None,
            leisure: None,
            landuse: None,
        }
    }
}

fn text(tags: &BTreeMap<String, String>, key: &str, max_chars: usize) -> Option<String> {
    let value = tags.get(key)?.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.chars().take(max_chars).collect())
}

fn number(tags: &BTreeMap<String, String>, key: &str) -> Option<f64> {
    tags.get(key)?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

impl BuildingAttributes {
    /// Map raw source tags onto the canonical vocabulary.
    ///
    /// Out-of-range numbers and blank strings become absent.
    pub fn from_tags(tags: &BTreeMap<String, String>) -> Self {
        Self {
            building: text(tags, "building", 50).unwrap_or_else(|| "yes".to_string()),
            height: number(tags, "height").filter(|h| HEIGHT_RANGE.contains(h)),
            ele: number(tags, "ele").filter(|e| ELE_RANGE.contains(e)),
            levels: number(tags, "building:levels")
                .map(f64::trunc)
                .filter(|l| *l >= 0.0 && *l <= u32::MAX as f64)
                .map(|l| l as u32)
                .filter(|l| LEVELS_RANGE.contains(l)),
            name: text(tags, "name", 100).or_else(|| text(tags, "name:ja", 100)),
            housenumber: text(tags, "addr:housenumber", 20),
            street: text(tags, "addr:street", 100),
            start_date: text(tags, "start_date", 10),
            building_material: text(tags, "building:material", 50),
            roof_material: text(tags, "roof:material", 50),
            roof_shape: text(tags, "roof:shape", 50),
            amenity: text(tags, "amenity", 50),
            shop: text(tags, "shop", 50),
            tourism: text(tags, "tourism", 50),
            leisure: text(tags, "leisure", 50),
            landuse: text(tags, "landuse", 50),
        }
    }

    /// Wire tags in canonical order, absent attributes omitted
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![("building", self.building.clone())];
        let numeric = [("height", self.height), ("ele", self.ele)];
        for (key, value) in numeric {
            if let Some(v) = value {
                out.push((key, v.to_string()));
            }
        }
        if let Some(levels) = self.levels {
            out.push(("building:levels", levels.to_string()));
        }
        let textual = [
            ("name", &self.name),
            ("addr:housenumber", &self.housenumber),
            ("addr:street", &self.street),
            ("start_date", &self.start_date),
            ("building:material", &self.building_material),
            ("roof:material", &self.roof_material),
            ("roof:shape", &self.roof_shape),
            ("amenity", &self.amenity),
            ("shop", &self.shop),
            ("tourism", &self.tourism),
            ("leisure", &self.leisure),
            ("landuse", &self.landuse),
        ];
        for (key, value) in textual {
            if let Some(v) = value {
                out.push((key, v.clone()));
            }
        }
        out
    }
}
