//! Bounding-box queries
//!
//! Raw caller parameters are validated into a [`QueryRequest`] before the
//! store is touched. [`run_query`] then selects buildings and renders the
//! OSM XML document.

use crate::config::{Config, QueryConfig};
use crate::error::{Error, Result};
use crate::geom::BBox;
use crate::osm::OsmDocument;
use crate::store::{BuildingDb, Predicate};
use serde::Serialize;
use tracing::debug;

/// A validated bounding-box query
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueryRequest {
    pub bbox: BBox,
    /// Effective cap after clamping
    pub limit: usize,
    pub predicate: Predicate,
}

/// Query result with the rendered document
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub document: OsmDocument,
    pub xml: String,
    pub limit: usize,
    /// Buildings the store matched, including any left out of the
    /// document for having too few nodes
    pub selected: usize,
}

impl QueryResponse {
    /// Buildings written to the document
    pub fn count(&self) -> usize {
        self.document.way_count()
    }

    /// The store hit the cap, so more buildings may match the box
    pub fn is_truncated(&self) -> bool {
        self.selected >= self.limit
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{} must be true or false, got '{}'",
            name, value
        ))),
    }
}

impl QueryRequest {
    /// Build a request from typed values, applying the configured default
    /// and maximum limit
    pub fn new(
        bbox: BBox,
        limit: Option<usize>,
        predicate: Predicate,
        config: &QueryConfig,
    ) -> Result<Self> {
        let limit = match limit {
            Some(0) => {
                return Err(Error::InvalidInput(
                    "limit must be a positive integer".to_string(),
                ))
            }
            Some(n) => n.min(config.max_limit),
            None => config.default_limit,
        };

        Ok(Self {
            bbox,
            limit,
            predicate,
        })
    }

    /// Validate raw query-string parameters.
    ///
    /// `predicate` and the boolean `use_intersects` may both be given only
    /// when they agree.
    pub fn parse(
        bbox: Option<&str>,
        limit: Option<&str>,
        use_intersects: Option<&str>,
        predicate: Option<&str>,
        config: &QueryConfig,
    ) -> Result<Self> {
        let bbox: BBox = bbox
            .ok_or_else(|| Error::InvalidInput("bbox parameter is required".to_string()))?
            .parse()?;

        let limit = limit
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|_| {
                    Error::InvalidInput(format!("limit must be a positive integer, got '{}'", raw))
                })
            })
            .transpose()?;

        let from_flag = use_intersects
            .map(|raw| parse_bool("use_intersects", raw))
            .transpose()?
            .map(|intersects| {
                if intersects {
                    Predicate::Intersects
                } else {
                    Predicate::ContainsCentroid
                }
            });
        let from_name = predicate.map(str::parse::<Predicate>).transpose()?;

        let predicate = match (from_name, from_flag) {
            (Some(a), Some(b)) if a != b => {
                return Err(Error::InvalidInput(format!(
                    "predicate={} conflicts with use_intersects",
                    a
                )))
            }
            (Some(p), _) | (None, Some(p)) => p,
            (None, None) => Predicate::default(),
        };

        Self::new(bbox, limit, predicate, config)
    }
}

/// Select buildings for a validated request and render them
pub async fn run_query(
    db: &BuildingDb,
    request: &QueryRequest,
    config: &Config,
) -> Result<QueryResponse> {
    let buildings = db
        .select_buildings(&request.bbox, request.predicate, request.limit)
        .await?;

    let document = OsmDocument::from_buildings(request.bbox, &buildings, config.query.close_ways);
    let xml = document.to_xml(&config.output)?;

    debug!(
        bbox = %request.bbox,
        predicate = %request.predicate,
        count = document.way_count(),
        selected = buildings.len(),
        limit = request.limit,
        "Query complete"
    );

    Ok(QueryResponse {
        document,
        xml,
        limit: request.limit,
        selected: buildings.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{Coord, CoordBounds};
    use crate::normalize::{normalize_record, NormalizeContext};
    use crate::source::SourceRecord;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn qc() -> QueryConfig {
        QueryConfig::default()
    }

    #[test]
    fn test_parse_defaults() {
        let req = QueryRequest::parse(Some("133.32,35.41,133.35,35.44"), None, None, None, &qc())
            .unwrap();
        assert_eq!(req.limit, 1000);
        assert_eq!(req.predicate, Predicate::Intersects);
    }

    #[test]
    fn test_parse_limit_rules() {
        let bbox = Some("133.32,35.41,133.35,35.44");
        let req = QueryRequest::parse(bbox, Some("50000"), None, None, &qc()).unwrap();
        assert_eq!(req.limit, 10_000);

        for bad in ["0", "-5", "ten", "1.5"] {
            assert!(
                matches!(
                    QueryRequest::parse(bbox, Some(bad), None, None, &qc()),
                    Err(Error::InvalidInput(_))
                ),
                "limit {} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_predicate_sources() {
        let bbox = Some("133.32,35.41,133.35,35.44");
        let req = QueryRequest::parse(bbox, None, Some("false"), None, &qc()).unwrap();
        assert_eq!(req.predicate, Predicate::ContainsCentroid);

        let req =
            QueryRequest::parse(bbox, None, Some("true"), Some("intersects"), &qc()).unwrap();
        assert_eq!(req.predicate, Predicate::Intersects);

        assert!(QueryRequest::parse(bbox, None, Some("maybe"), None, &qc()).is_err());
        assert!(QueryRequest::parse(bbox, None, None, Some("within"), &qc()).is_err());
        assert!(
            QueryRequest::parse(bbox, None, Some("true"), Some("contains-centroid"), &qc())
                .is_err()
        );
    }

    #[test]
    fn test_parse_rejects_bad_bbox() {
        for bad in [
            None,
            Some("133.35,35.41,133.32,35.44"),
            Some("133.32,35.41,133.35"),
            Some("133.32,95,133.35,96"),
            Some("a,b,c,d"),
        ] {
            assert!(matches!(
                QueryRequest::parse(bad, None, None, None, &qc()),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    async fn setup() -> (BuildingDb, Config, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let db = BuildingDb::new(&config.paths.db_file).await.unwrap();
        (db, config, tmp)
    }

    #[tokio::test]
    async fn test_invalid_bbox_fails_before_store() {
        let (db, config, _tmp) = setup().await;
        // A closed pool turns any store access into a Database error
        db.close().await;

        let err = QueryRequest::parse(
            Some("133.35,35.41,133.32,35.44"),
            None,
            None,
            None,
            &config.query,
        )
        .unwrap_err();
        assert!(err.is_client_error());

        let req = QueryRequest::parse(
            Some("133.32,35.41,133.35,35.44"),
            None,
            None,
            None,
            &config.query,
        )
        .unwrap();
        assert!(matches!(
            run_query(&db, &req, &config).await,
            Err(Error::Database(_))
        ));
    }

    async fn insert_triangle(db: &BuildingDb, config: &Config) {
        let record = SourceRecord {
            way_id: Some(1),
            file: "yonago.osm".to_string(),
            tags: [("building", "yes"), ("height", "10.5")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            coords: vec![
                Coord::new(133.33, 35.42),
                Coord::new(133.34, 35.42),
                Coord::new(133.34, 35.43),
                Coord::new(133.33, 35.42),
            ],
            unresolved_refs: 0,
        };
        let ctx = NormalizeContext {
            citycode: "31202".to_string(),
            bounds: CoordBounds::japan(),
            source_id_tag: config.ingest.source_id_tag.clone(),
        };
        let building = normalize_record(&record, &ctx).unwrap();
        db.upsert_building(&building, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_building_round_trip() {
        let (db, config, _tmp) = setup().await;
        insert_triangle(&db, &config).await;

        let req = QueryRequest::parse(
            Some("133.32,35.41,133.35,35.44"),
            None,
            Some("true"),
            None,
            &config.query,
        )
        .unwrap();
        let response = run_query(&db, &req, &config).await.unwrap();

        assert_eq!(response.count(), 1);
        assert!(!response.is_truncated());
        let doc = &response.document;
        assert_eq!(doc.nodes.len(), 3);
        let way = &doc.ways[0];
        assert!(way.tags.contains(&("height", "10.5".to_string())));
        let node_ids: HashSet<i64> = doc.nodes.iter().map(|n| n.id).collect();
        assert_eq!(node_ids.len(), 3);
        assert!(node_ids.iter().all(|id| *id < 0));
        assert_eq!(way.refs.len(), 3);
        assert_eq!(way.refs.iter().copied().collect::<HashSet<_>>(), node_ids);
        assert!(response.xml.contains("<tag k=\"height\" v=\"10.5\"/>"));

        let empty = QueryRequest::parse(
            Some("139.0,35.0,139.1,35.1"),
            None,
            None,
            None,
            &config.query,
        )
        .unwrap();
        let response = run_query(&db, &empty, &config).await.unwrap();
        assert_eq!(response.count(), 0);
        assert!(response.xml.contains("<osm version=\"0.6\""));
        assert!(response.xml.trim_end().ends_with("</osm>"));
    }

    #[tokio::test]
    async fn test_truncation_counts_skipped_buildings() {
        let (db, config, _tmp) = setup().await;
        insert_triangle(&db, &config).await;

        let options = SqliteConnectOptions::new().filename(&config.paths.db_file);
        let pool = sqlx::SqlitePool::connect_with(options).await.unwrap();
        sqlx::query("DELETE FROM building_nodes WHERE seq = 2")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let req = QueryRequest::new(
            BBox::new(133.32, 35.41, 133.35, 35.44).unwrap(),
            Some(1),
            Predicate::ContainsCentroid,
            &config.query,
        )
        .unwrap();
        let response = run_query(&db, &req, &config).await.unwrap();
        assert_eq!(response.count(), 0);
        assert_eq!(response.selected, 1);
        assert!(response.is_truncated());
    }
}
