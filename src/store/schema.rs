//! SQLite schema definition

/// SQL schema for the building database.
///
/// `building_envelopes` and `building_centroids` are R*Tree indexes keyed by
/// `buildings.id`. R*Tree stores 32-bit floats rounded outward, so queries
/// against them return a superset that callers refine exactly.
pub const SCHEMA_SQL: &str = r#"
-- Buildings: one row per footprint, keyed by the source building id
CREATE TABLE IF NOT EXISTS buildings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL UNIQUE,
    citycode TEXT NOT NULL,
    provenance TEXT NOT NULL,
    geom_hash TEXT NOT NULL,
    ring_hash TEXT NOT NULL,
    attributes_json TEXT NOT NULL,
    height REAL,
    node_count INTEGER NOT NULL,
    centroid_lon REAL NOT NULL,
    centroid_lat REAL NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Boundary nodes: open ring, seq is a contiguous 0-based run
CREATE TABLE IF NOT EXISTS building_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    building_id INTEGER NOT NULL REFERENCES buildings(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL CHECK (seq >= 0),
    lon REAL NOT NULL,
    lat REAL NOT NULL,
    UNIQUE(building_id, seq)
);

-- Spatial indexes
CREATE VIRTUAL TABLE IF NOT EXISTS building_envelopes USING rtree(
    id, min_lon, max_lon, min_lat, max_lat
);

CREATE VIRTUAL TABLE IF NOT EXISTS building_centroids USING rtree(
    id, min_lon, max_lon, min_lat, max_lat
);

-- Ingestion runs: tracking history
CREATE TABLE IF NOT EXISTS ingestion_runs (
    id TEXT PRIMARY KEY,
    citycode TEXT NOT NULL,
    source_dir TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    files_processed INTEGER DEFAULT 0,
    inserted INTEGER DEFAULT 0,
    updated INTEGER DEFAULT 0,
    unchanged INTEGER DEFAULT 0,
    duplicates INTEGER DEFAULT 0,
    rejected INTEGER DEFAULT 0,
    failed INTEGER DEFAULT 0,
    errors_json TEXT
);

-- Indexes for performance
CREATE INDEX IF NOT EXISTS idx_buildings_geom_hash ON buildings(geom_hash);
CREATE INDEX IF NOT EXISTS idx_buildings_citycode ON buildings(citycode);
CREATE INDEX IF NOT EXISTS idx_runs_citycode ON ingestion_runs(citycode);
"#;
