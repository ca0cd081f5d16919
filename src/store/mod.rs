//! Building storage using SQLite
//!
//! This module owns all persisted state:
//! - Buildings (attributes, centroid, hashes) keyed by source id
//! - Boundary nodes (one row per ring vertex, ordered by `seq`)
//! - R*Tree indexes over building envelopes and centroids
//! - Ingestion runs (history and stats)
//!
//! Every building write happens in its own transaction so readers see
//! either the old or the new node set, never a mix.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::geom::{BBox, Coord, Ring};
use crate::normalize::{BuildingAttributes, NormalizedBuilding};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Buildings fetched per candidate page and node lookup
const PAGE_SIZE: usize = 500;

/// Spatial test used to match buildings against a query box
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    /// Footprint polygon overlaps the box
    #[default]
    Intersects,
    /// Footprint centroid lies inside the box
    ContainsCentroid,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Intersects => write!(f, "intersects"),
            Predicate::ContainsCentroid => write!(f, "contains-centroid"),
        }
    }
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "intersects" => Ok(Predicate::Intersects),
            "contains-centroid" | "contains_centroid" => Ok(Predicate::ContainsCentroid),
            _ => Err(Error::InvalidInput(format!(
                "Unknown predicate '{}': expected intersects or contains-centroid",
                s
            ))),
        }
    }
}

/// Ingestion run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of writing one normalized building
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Updated { id: i64, geometry_replaced: bool },
    Unchanged { id: i64 },
    /// Same footprint already stored under another source id
    Duplicate { existing_source_id: String },
}

/// One boundary node row
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: i64,
    pub building_id: i64,
    pub seq: i64,
    pub lon: f64,
    pub lat: f64,
}

/// A building with its ordered boundary nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBuilding {
    pub id: i64,
    pub source_id: String,
    pub citycode: String,
    pub provenance: String,
    pub attributes: BuildingAttributes,
    pub centroid: Coord,
    pub nodes: Vec<StoredNode>,
}

impl StoredBuilding {
    /// Ring rebuilt from the stored nodes
    pub fn ring(&self) -> Option<Ring> {
        Ring::from_coords(
            self.nodes
                .iter()
                .map(|n| Coord::new(n.lon, n.lat))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, FromRow)]
struct BuildingRow {
    id: i64,
    source_id: String,
    citycode: String,
    provenance: String,
    attributes_json: String,
    centroid_lon: f64,
    centroid_lat: f64,
}

#[derive(Debug, Clone, FromRow)]
struct CurrentState {
    id: i64,
    citycode: String,
    provenance: String,
    ring_hash: String,
    attributes_json: String,
}

/// An ingestion run record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: String,
    pub citycode: String,
    pub source_dir: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub files_processed: i64,
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub duplicates: i64,
    pub rejected: i64,
    pub failed: i64,
    pub errors_json: Option<String>,
}

impl IngestionRun {
    pub fn new(citycode: String, source_dir: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            citycode,
            source_dir,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
            status: RunStatus::Running.to_string(),
            files_processed: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            duplicates: 0,
            rejected: 0,
            failed: 0,
            errors_json: None,
        }
    }
}

/// Final counts recorded on an ingestion run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub files_processed: i64,
    pub inserted: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub duplicates: i64,
    pub rejected: i64,
    pub failed: i64,
}

/// Buildings per municipality
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CitycodeCount {
    pub citycode: String,
    pub buildings: i64,
}

/// Global statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub building_count: i64,
    pub buildings_with_height: i64,
    pub avg_height: Option<f64>,
    pub max_height: Option<f64>,
    pub node_count: i64,
    pub citycodes: Vec<CitycodeCount>,
}

/// A building that violates the node invariants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub building_id: i64,
    pub source_id: String,
    pub problem: String,
}

#[derive(Debug, FromRow)]
struct NodeSummary {
    id: i64,
    source_id: String,
    node_count: i64,
    nodes: i64,
    min_seq: Option<i64>,
    max_seq: Option<i64>,
    has_envelope: i64,
    has_centroid: i64,
}

/// Building database handle
#[derive(Clone)]
pub struct BuildingDb {
    pool: SqlitePool,
}

impl BuildingDb {
    /// Connect to the building database
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.paths.db_file, config.database.max_connections).await
    }

    /// Create database with path directly (without full config)
    pub async fn new(db_path: &Path) -> Result<Self> {
        let db = Self::open(db_path, crate::config::default_max_connections()).await?;

        // Auto-initialize schema if needed
        if !db.is_initialized().await? {
            db.init_schema().await?;
        }

        Ok(db)
    }

    async fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='buildings'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    /// Trivial round-trip used by health checks
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ===== Building Writes =====

    /// Insert or update one building and its nodes in a single transaction.
    ///
    /// The insert runs first so the transaction holds the write lock before
    /// anything is read.
    pub async fn upsert_building(
        &self,
        building: &NormalizedBuilding,
        dedupe_geometry: bool,
    ) -> Result<UpsertOutcome> {
        let attributes_json = serde_json::to_string(&building.attributes)?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO buildings (
                source_id, citycode, provenance, geom_hash, ring_hash, attributes_json,
                height, node_count, centroid_lon, centroid_lat, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&building.source_id)
        .bind(&building.citycode)
        .bind(&building.provenance)
        .bind(&building.geom_hash)
        .bind(&building.ring_hash)
        .bind(&attributes_json)
        .bind(building.attributes.height)
        .bind(building.ring.len() as i64)
        .bind(building.centroid.lon)
        .bind(building.centroid.lat)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(id) = inserted {
            if dedupe_geometry {
                let existing: Option<String> = sqlx::query_scalar(
                    "SELECT source_id FROM buildings WHERE geom_hash = ? AND id <> ? ORDER BY id LIMIT 1",
                )
                .bind(&building.geom_hash)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(existing_source_id) = existing {
                    tx.rollback().await?;
                    return Ok(UpsertOutcome::Duplicate { existing_source_id });
                }
            }

            write_geometry(&mut *tx, id, building, false).await?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted { id });
        }

        let current = sqlx::query_as::<_, CurrentState>(
            "SELECT id, citycode, provenance, ring_hash, attributes_json FROM buildings WHERE source_id = ?",
        )
        .bind(&building.source_id)
        .fetch_one(&mut *tx)
        .await?;

        let geometry_changed = current.ring_hash != building.ring_hash;
        let attributes_changed = current.attributes_json != attributes_json
            || current.provenance != building.provenance
            || current.citycode != building.citycode;

        if !geometry_changed && !attributes_changed {
            tx.commit().await?;
            return Ok(UpsertOutcome::Unchanged { id: current.id });
        }

        sqlx::query(
            r#"
            UPDATE buildings SET
                citycode = ?,
                provenance = ?,
                geom_hash = ?,
                ring_hash = ?,
                attributes_json = ?,
                height = ?,
                node_count = ?,
                centroid_lon = ?,
                centroid_lat = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&building.citycode)
        .bind(&building.provenance)
        .bind(&building.geom_hash)
        .bind(&building.ring_hash)
        .bind(&attributes_json)
        .bind(building.attributes.height)
        .bind(building.ring.len() as i64)
        .bind(building.centroid.lon)
        .bind(building.centroid.lat)
        .bind(&now)
        .bind(current.id)
        .execute(&mut *tx)
        .await?;

        if geometry_changed {
            write_geometry(&mut *tx, current.id, building, true).await?;
        }

        tx.commit().await?;
        Ok(UpsertOutcome::Updated {
            id: current.id,
            geometry_replaced: geometry_changed,
        })
    }

    // ===== Building Reads =====

    /// Select at most `limit` buildings matching `predicate`, ordered by id.
    ///
    /// Buildings and nodes are read inside one transaction so a concurrent
    /// ingestion commit cannot split a node set.
    pub async fn select_buildings(
        &self,
        bbox: &BBox,
        predicate: Predicate,
        limit: usize,
    ) -> Result<Vec<StoredBuilding>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let buildings = match predicate {
            Predicate::Intersects => select_intersecting(&mut *tx, bbox, limit).await?,
            Predicate::ContainsCentroid => select_by_centroid(&mut *tx, bbox, limit).await?,
        };
        tx.commit().await?;

        debug!(
            predicate = %predicate,
            bbox = %bbox,
            count = buildings.len(),
            "Selected buildings"
        );
        Ok(buildings)
    }

    /// Get a building by its source id
    pub async fn get_building_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<StoredBuilding>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, BuildingRow>(
            r#"
            SELECT id, source_id, citycode, provenance, attributes_json, centroid_lon, centroid_lat
            FROM buildings WHERE source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(hydrate(&mut *conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Boundary nodes of one building in ring order
    pub async fn nodes_for_building(&self, building_id: i64) -> Result<Vec<StoredNode>> {
        let nodes = sqlx::query_as::<_, StoredNode>(
            "SELECT id, building_id, seq, lon, lat FROM building_nodes WHERE building_id = ? ORDER BY seq",
        )
        .bind(building_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    // ===== Ingestion Run Operations =====

    /// Start a new ingestion run
    pub async fn start_ingestion_run(
        &self,
        citycode: &str,
        source_dir: &str,
    ) -> Result<IngestionRun> {
        let run = IngestionRun::new(citycode.to_string(), source_dir.to_string());
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (id, citycode, source_dir, started_at, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.citycode)
        .bind(&run.source_dir)
        .bind(&run.started_at)
        .bind(&run.status)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Complete an ingestion run
    pub async fn complete_ingestion_run(
        &self,
        id: &str,
        status: RunStatus,
        counts: RunCounts,
        errors: Option<Vec<String>>,
    ) -> Result<()> {
        let errors_json = errors.map(|e| serde_json::to_string(&e)).transpose()?;
        sqlx::query(
            r#"
            UPDATE ingestion_runs SET
                completed_at = ?,
                status = ?,
                files_processed = ?,
                inserted = ?,
                updated = ?,
                unchanged = ?,
                duplicates = ?,
                rejected = ?,
                failed = ?,
                errors_json = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.to_string())
        .bind(counts.files_processed)
        .bind(counts.inserted)
        .bind(counts.updated)
        .bind(counts.unchanged)
        .bind(counts.duplicates)
        .bind(counts.rejected)
        .bind(counts.failed)
        .bind(errors_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent ingestion runs, newest first
    pub async fn latest_runs(&self, limit: i64) -> Result<Vec<IngestionRun>> {
        let runs = sqlx::query_as::<_, IngestionRun>(
            "SELECT * FROM ingestion_runs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    // ===== Statistics =====

    /// Get global statistics
    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let (building_count, buildings_with_height, avg_height, max_height): (
            i64,
            i64,
            Option<f64>,
            Option<f64>,
        ) = sqlx::query_as("SELECT COUNT(*), COUNT(height), AVG(height), MAX(height) FROM buildings")
            .fetch_one(&self.pool)
            .await?;

        let node_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM building_nodes")
            .fetch_one(&self.pool)
            .await?;

        let citycodes = sqlx::query_as::<_, CitycodeCount>(
            "SELECT citycode, COUNT(*) AS buildings FROM buildings GROUP BY citycode ORDER BY citycode",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(GlobalStats {
            building_count,
            buildings_with_height,
            avg_height,
            max_height,
            node_count,
            citycodes,
        })
    }

    /// Check every building for a contiguous node run matching its ring
    /// length, plus its two spatial index rows
    pub async fn verify_integrity(&self) -> Result<Vec<IntegrityIssue>> {
        let rows = sqlx::query_as::<_, NodeSummary>(
            r#"
            SELECT
                b.id,
                b.source_id,
                b.node_count,
                COUNT(n.id) AS nodes,
                MIN(n.seq) AS min_seq,
                MAX(n.seq) AS max_seq,
                EXISTS(SELECT 1 FROM building_envelopes e WHERE e.id = b.id) AS has_envelope,
                EXISTS(SELECT 1 FROM building_centroids c WHERE c.id = b.id) AS has_centroid
            FROM buildings b
            LEFT JOIN building_nodes n ON n.building_id = b.id
            GROUP BY b.id
            ORDER BY b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut issues = Vec::new();
        for row in rows {
            let mut problems = Vec::new();
            if row.nodes != row.node_count {
                problems.push(format!(
                    "{} nodes stored, ring has {}",
                    row.nodes, row.node_count
                ));
            }
            if row.nodes < 3 {
                problems.push("fewer than 3 nodes".to_string());
            }
            if row.nodes > 0 && (row.min_seq != Some(0) || row.max_seq != Some(row.nodes - 1)) {
                problems.push("node sequence is not a contiguous 0-based run".to_string());
            }
            if row.has_envelope == 0 {
                problems.push("missing envelope index row".to_string());
            }
            if row.has_centroid == 0 {
                problems.push("missing centroid index row".to_string());
            }
            if !problems.is_empty() {
                issues.push(IntegrityIssue {
                    building_id: row.id,
                    source_id: row.source_id,
                    problem: problems.join("; "),
                });
            }
        }
        Ok(issues)
    }
}

/// Replace the node set and index rows of one building
async fn write_geometry(
    conn: &mut SqliteConnection,
    id: i64,
    building: &NormalizedBuilding,
    replace: bool,
) -> Result<()> {
    if replace {
        sqlx::query("DELETE FROM building_nodes WHERE building_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM building_envelopes WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM building_centroids WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    for (seq, coord) in building.ring.coords().iter().enumerate() {
        sqlx::query("INSERT INTO building_nodes (building_id, seq, lon, lat) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(seq as i64)
            .bind(coord.lon)
            .bind(coord.lat)
            .execute(&mut *conn)
            .await?;
    }

    let env = building.ring.envelope();
    sqlx::query(
        "INSERT INTO building_envelopes (id, min_lon, max_lon, min_lat, max_lat) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(env.min_lon)
    .bind(env.max_lon)
    .bind(env.min_lat)
    .bind(env.max_lat)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO building_centroids (id, min_lon, max_lon, min_lat, max_lat) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(building.centroid.lon)
    .bind(building.centroid.lon)
    .bind(building.centroid.lat)
    .bind(building.centroid.lat)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Envelope candidates are paged in id order and refined with the exact
/// polygon test until `limit` matches are found.
async fn select_intersecting(
    conn: &mut SqliteConnection,
    bbox: &BBox,
    limit: usize,
) -> Result<Vec<StoredBuilding>> {
    let page_size = limit.min(PAGE_SIZE);
    let mut selected = Vec::new();
    let mut after_id = 0i64;

    loop {
        let rows = sqlx::query_as::<_, BuildingRow>(
            r#"
            SELECT b.id, b.source_id, b.citycode, b.provenance, b.attributes_json,
                   b.centroid_lon, b.centroid_lat
            FROM building_envelopes e
            JOIN buildings b ON b.id = e.id
            WHERE e.min_lon <= ? AND e.max_lon >= ?
              AND e.min_lat <= ? AND e.max_lat >= ?
              AND e.id > ?
            ORDER BY b.id
            LIMIT ?
            "#,
        )
        .bind(bbox.max_lon)
        .bind(bbox.min_lon)
        .bind(bbox.max_lat)
        .bind(bbox.min_lat)
        .bind(after_id)
        .bind(page_size as i64)
        .fetch_all(&mut *conn)
        .await?;

        let page_len = rows.len();
        let Some(last) = rows.last() else {
            break;
        };
        after_id = last.id;

        for building in hydrate(conn, rows).await? {
            let hit = building
                .ring()
                .map_or(false, |ring| ring.intersects_bbox(bbox));
            if hit {
                selected.push(building);
                if selected.len() == limit {
                    return Ok(selected);
                }
            }
        }

        if page_len < page_size {
            break;
        }
    }

    Ok(selected)
}

/// Centroid candidates come from the R*Tree; the exact centroid check and
/// the cap run in SQL.
async fn select_by_centroid(
    conn: &mut SqliteConnection,
    bbox: &BBox,
    limit: usize,
) -> Result<Vec<StoredBuilding>> {
    let rows = sqlx::query_as::<_, BuildingRow>(
        r#"
        SELECT b.id, b.source_id, b.citycode, b.provenance, b.attributes_json,
               b.centroid_lon, b.centroid_lat
        FROM building_centroids c
        JOIN buildings b ON b.id = c.id
        WHERE c.min_lon <= ? AND c.max_lon >= ?
          AND c.min_lat <= ? AND c.max_lat >= ?
          AND b.centroid_lon BETWEEN ? AND ?
          AND b.centroid_lat BETWEEN ? AND ?
        ORDER BY b.id
        LIMIT ?
        "#,
    )
    .bind(bbox.max_lon)
    .bind(bbox.min_lon)
    .bind(bbox.max_lat)
    .bind(bbox.min_lat)
    .bind(bbox.min_lon)
    .bind(bbox.max_lon)
    .bind(bbox.min_lat)
    .bind(bbox.max_lat)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    hydrate(conn, rows).await
}

/// Attach nodes to building rows, preserving row order
async fn hydrate(
    conn: &mut SqliteConnection,
    rows: Vec<BuildingRow>,
) -> Result<Vec<StoredBuilding>> {
    let mut nodes_by_building: HashMap<i64, Vec<StoredNode>> = HashMap::new();

    for chunk in rows.chunks(PAGE_SIZE) {
        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT id, building_id, seq, lon, lat FROM building_nodes WHERE building_id IN ({}) ORDER BY building_id, seq",
            placeholders
        );
        let mut query_builder = sqlx::query_as::<_, StoredNode>(&query);
        for row in chunk {
            query_builder = query_builder.bind(row.id);
        }
        for node in query_builder.fetch_all(&mut *conn).await? {
            nodes_by_building.entry(node.building_id).or_default().push(node);
        }
    }

    rows.into_iter()
        .map(|row| {
            let attributes: BuildingAttributes = serde_json::from_str(&row.attributes_json)?;
            Ok(StoredBuilding {
                nodes: nodes_by_building.remove(&row.id).unwrap_or_default(),
                id: row.id,
                source_id: row.source_id,
                citycode: row.citycode,
                provenance: row.provenance,
                attributes,
                centroid: Coord::new(row.centroid_lon, row.centroid_lat),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::CoordBounds;
    use crate::normalize::{normalize_record, NormalizeContext};
    use crate::source::SourceRecord;
    use tempfile::TempDir;

    async fn setup_test_db() -> (BuildingDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.db_file = tmp.path().join("test.db");

        let db = BuildingDb::connect(&config).await.unwrap();
        db.init_schema().await.unwrap();
        (db, tmp)
    }

    fn building(way_id: i64, coords: &[(f64, f64)], tags: &[(&str, &str)]) -> NormalizedBuilding {
        let record = SourceRecord {
            way_id: Some(way_id),
            file: "test.osm".to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            coords: coords.iter().map(|(lon, lat)| Coord::new(*lon, *lat)).collect(),
            unresolved_refs: 0,
        };
        let ctx = NormalizeContext {
            citycode: "31202".to_string(),
            bounds: CoordBounds::japan(),
            source_id_tag: "ref:MLIT_PLATEAU".to_string(),
        };
        normalize_record(&record, &ctx).unwrap()
    }

    fn square(way_id: i64, lon: f64, lat: f64, size: f64) -> NormalizedBuilding {
        building(
            way_id,
            &[
                (lon, lat),
                (lon + size, lat),
                (lon + size, lat + size),
                (lon, lat + size),
                (lon, lat),
            ],
            &[("building", "yes")],
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readers_never_see_partial_node_sets() {
        let (db, _tmp) = setup_test_db().await;
        let three_nodes = building(
            1,
            &[(133.33, 35.42), (133.331, 35.42), (133.331, 35.421), (133.33, 35.42)],
            &[("building", "yes")],
        );
        let four_nodes = square(1, 133.33, 35.42, 0.001);
        assert_eq!(three_nodes.source_id, four_nodes.source_id);
        db.upsert_building(&three_nodes, true).await.unwrap();

        let writer_db = db.clone();
        let writer = tokio::spawn(async move {
            for i in 0..60 {
                let next = if i % 2 == 0 { &four_nodes } else { &three_nodes };
                writer_db.upsert_building(next, true).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let bbox = BBox::new(133.32, 35.41, 133.34, 35.43).unwrap();
        let mut reads = 0;
        while !writer.is_finished() || reads == 0 {
            for predicate in [Predicate::Intersects, Predicate::ContainsCentroid] {
                let found = db.select_buildings(&bbox, predicate, 10).await.unwrap();
                assert_eq!(found.len(), 1);
                let nodes = &found[0].nodes;
                assert!(
                    nodes.len() == 3 || nodes.len() == 4,
                    "partial node set of {} nodes",
                    nodes.len()
                );
                for (i, node) in nodes.iter().enumerate() {
                    assert_eq!(node.seq, i as i64);
                }
                reads += 1;
            }
        }
        writer.await.unwrap();
        assert!(reads > 0);
        assert!(db.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_then_unchanged() {
        let (db, _tmp) = setup_test_db().await;
        let b = square(1, 133.33, 35.42, 0.001);

        let id = match db.upsert_building(&b, true).await.unwrap() {
            UpsertOutcome::Inserted { id } => id,
            other => panic!("expected insert, got {:?}", other),
        };

        let second = db.upsert_building(&b, true).await.unwrap();
        assert_eq!(second, UpsertOutcome::Unchanged { id });

        let stats = db.global_stats().await.unwrap();
        assert_eq!(stats.building_count, 1);
        assert_eq!(stats.node_count, 4);
    }

    #[tokio::test]
    async fn test_attribute_update_keeps_nodes() {
        let (db, _tmp) = setup_test_db().await;
        let b = square(1, 133.33, 35.42, 0.001);
        db.upsert_building(&b, true).await.unwrap();
        let before = db.get_building_by_source_id(&b.source_id).await.unwrap().unwrap();

        let mut changed = b.clone();
        changed.attributes.height = Some(12.0);
        let outcome = db.upsert_building(&changed, true).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                id: before.id,
                geometry_replaced: false
            }
        );

        let after = db.get_building_by_source_id(&b.source_id).await.unwrap().unwrap();
        assert_eq!(after.attributes.height, Some(12.0));
        assert_eq!(after.nodes, before.nodes);
    }

    #[tokio::test]
    async fn test_geometry_change_replaces_nodes() {
        let (db, _tmp) = setup_test_db().await;
        let b = square(1, 133.33, 35.42, 0.001);
        db.upsert_building(&b, true).await.unwrap();
        let before = db.get_building_by_source_id(&b.source_id).await.unwrap().unwrap();

        let triangle = building(
            1,
            &[(133.33, 35.42), (133.34, 35.42), (133.34, 35.43)],
            &[("building", "yes")],
        );
        assert_eq!(triangle.source_id, b.source_id);
        let outcome = db.upsert_building(&triangle, true).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                id: before.id,
                geometry_replaced: true
            }
        );

        let after = db.nodes_for_building(before.id).await.unwrap();
        assert_eq!(after.len(), 3);
        assert_eq!(
            after.iter().map(|n| n.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let old_ids: Vec<i64> = before.nodes.iter().map(|n| n.id).collect();
        assert!(after.iter().all(|n| !old_ids.contains(&n.id)));

        let stats = db.global_stats().await.unwrap();
        assert_eq!(stats.node_count, 3);
        assert!(db.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_geometry_suppressed() {
        let (db, _tmp) = setup_test_db().await;
        let a = square(1, 133.33, 35.42, 0.001);
        let b = square(2, 133.33, 35.42, 0.001);
        assert_ne!(a.source_id, b.source_id);

        db.upsert_building(&a, true).await.unwrap();
        let outcome = db.upsert_building(&b, true).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Duplicate {
                existing_source_id: a.source_id.clone()
            }
        );
        assert_eq!(db.global_stats().await.unwrap().building_count, 1);

        let outcome = db.upsert_building(&b, false).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Inserted { .. }));
    }

    #[tokio::test]
    async fn test_select_intersects_exact_and_ordered() {
        let (db, _tmp) = setup_test_db().await;
        // Triangle whose envelope reaches the query box but whose polygon does not
        let triangle = building(
            1,
            &[(133.30, 35.40), (133.31, 35.40), (133.30, 35.41)],
            &[("building", "yes")],
        );
        db.upsert_building(&triangle, true).await.unwrap();
        for i in 0..5 {
            let b = square(10 + i, 133.32 + i as f64 * 0.002, 35.42, 0.001);
            db.upsert_building(&b, true).await.unwrap();
        }

        let near_corner = BBox::new(133.308, 35.408, 133.309, 35.409).unwrap();
        let hits = db
            .select_buildings(&near_corner, Predicate::Intersects, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let wide = BBox::new(133.0, 35.0, 134.0, 36.0).unwrap();
        let hits = db.select_buildings(&wide, Predicate::Intersects, 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        let ids: Vec<i64> = hits.iter().map(|b| b.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(hits.iter().all(|b| b.nodes.len() >= 3));
    }

    #[tokio::test]
    async fn test_select_contains_centroid() {
        let (db, _tmp) = setup_test_db().await;
        let b = square(1, 133.330, 35.420, 0.002);
        db.upsert_building(&b, true).await.unwrap();

        // Box overlapping the footprint but not its centroid (133.331, 35.421)
        let edge = BBox::new(133.3295, 35.4195, 133.3305, 35.4205).unwrap();
        let by_polygon = db.select_buildings(&edge, Predicate::Intersects, 10).await.unwrap();
        let by_centroid = db
            .select_buildings(&edge, Predicate::ContainsCentroid, 10)
            .await
            .unwrap();
        assert_eq!(by_polygon.len(), 1);
        assert!(by_centroid.is_empty());

        let center = BBox::new(133.3309, 35.4209, 133.3311, 35.4211).unwrap();
        let by_centroid = db
            .select_buildings(&center, Predicate::ContainsCentroid, 10)
            .await
            .unwrap();
        assert_eq!(by_centroid.len(), 1);
    }

    #[tokio::test]
    async fn test_ingestion_run_tracking() {
        let (db, _tmp) = setup_test_db().await;
        let run = db.start_ingestion_run("31202", "/data/31202_yonago").await.unwrap();

        let counts = RunCounts {
            files_processed: 2,
            inserted: 10,
            ..Default::default()
        };
        db.complete_ingestion_run(&run.id, RunStatus::Completed, counts, None)
            .await
            .unwrap();

        let runs = db.latest_runs(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].inserted, 10);
        assert!(runs[0].completed_at.is_some());
    }

    #[test]
    fn test_predicate_parse() {
        assert_eq!("intersects".parse::<Predicate>().unwrap(), Predicate::Intersects);
        assert_eq!(
            "contains-centroid".parse::<Predicate>().unwrap(),
            Predicate::ContainsCentroid
        );
        assert!(matches!(
            "within".parse::<Predicate>(),
            Err(Error::InvalidInput(_))
        ));
    }
}
