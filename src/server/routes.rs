//! Route handlers

use super::AppState;
use crate::error::Error;
use crate::query::{run_query, QueryRequest};
use crate::store::CitycodeCount;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

/// Buildings the store matched; equal to the limit when the result was capped
const X_BUILDINGS_COUNT: HeaderName = HeaderName::from_static("x-buildings-count");
const X_BUILDINGS_LIMIT: HeaderName = HeaderName::from_static("x-buildings-limit");

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Crate error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.0.is_client_error() {
            debug!("Rejected request: {}", self.0);
        } else {
            error!("Request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Raw query string; validation happens in [`QueryRequest::parse`]
#[derive(Debug, Default, Deserialize)]
pub struct BuildingsParams {
    pub bbox: Option<String>,
    pub limit: Option<String>,
    pub use_intersects: Option<String>,
    pub predicate: Option<String>,
}

/// GET /
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "plateau-feed",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "PLATEAU building footprints as OSM XML for MapWithAI/RapiD",
        "endpoints": {
            "buildings": "/api/mapwithai/buildings?bbox=min_lon,min_lat,max_lon,max_lat",
            "statistics": "/api/stats",
            "health": "/health"
        }
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    match state.db.ping().await {
        Ok(()) => Json(json!({ "status": "healthy" })).into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BuildingTotals {
    pub total: i64,
    pub with_height: i64,
    pub avg_height: Option<f64>,
    pub max_height: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct NodeTotals {
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub buildings: BuildingTotals,
    pub nodes: NodeTotals,
    pub citycodes: Vec<CitycodeCount>,
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.db.global_stats().await?;
    Ok(Json(StatsResponse {
        buildings: BuildingTotals {
            total: stats.building_count,
            with_height: stats.buildings_with_height,
            avg_height: stats.avg_height,
            max_height: stats.max_height,
        },
        nodes: NodeTotals {
            total: stats.node_count,
        },
        citycodes: stats.citycodes,
    }))
}

/// OPTIONS /api/mapwithai/buildings
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

/// GET /api/mapwithai/buildings
pub async fn buildings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BuildingsParams>,
) -> Result<Response, ApiError> {
    let request = QueryRequest::parse(
        params.bbox.as_deref(),
        params.limit.as_deref(),
        params.use_intersects.as_deref(),
        params.predicate.as_deref(),
        &state.config.query,
    )?;

    let response = run_query(&state.db, &request, &state.config).await?;

    // Element timestamps change every second, so the tag covers content only
    let etag = format!(
        "\"{}\"",
        blake3::hash(&serde_json::to_vec(&response.document).map_err(Error::from)?).to_hex()
    );
    let cache_control = format!("public, max-age={}", state.config.server.cache_max_age_secs);

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.split(',').any(|tag| tag.trim() == etag));

    let response_headers = [
        (header::ETAG, etag),
        (header::CACHE_CONTROL, cache_control),
        (X_BUILDINGS_COUNT, response.selected.to_string()),
        (X_BUILDINGS_LIMIT, response.limit.to_string()),
    ];

    if not_modified {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    Ok((
        StatusCode::OK,
        response_headers,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        response.xml,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use crate::server::{router, AppState};
    use crate::config::Config;
    use crate::geom::{Coord, CoordBounds};
    use crate::normalize::{normalize_record, NormalizeContext};
    use crate::source::{parse_osm, SourceRecord};
    use crate::store::BuildingDb;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BUILDINGS_URI: &str =
        "/api/mapwithai/buildings?bbox=133.32,35.41,133.35,35.44&use_intersects=true";

    async fn build_test_app() -> (Router, BuildingDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let db = BuildingDb::new(&config.paths.db_file).await.unwrap();

        let record = SourceRecord {
            way_id: Some(7),
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
        db.upsert_building(&normalize_record(&record, &ctx).unwrap(), true)
            .await
            .unwrap();

        let app = router(AppState::new(db.clone(), config));
        (app, db, tmp)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_buildings_endpoint() {
        let (app, _db, _tmp) = build_test_app().await;
        let resp = app.oneshot(get(BUILDINGS_URI)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/xml; charset=utf-8"
        );
        assert_eq!(headers["x-buildings-count"], "1");
        assert_eq!(headers["x-buildings-limit"], "1000");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=300");
        assert!(headers.contains_key(header::ETAG));

        let body = body_string(resp).await;
        let records = parse_osm(body.as_bytes(), "response.osm").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].coords.len(), 3);
        assert_eq!(
            records[0].tags.get("height").map(String::as_str),
            Some("10.5")
        );
    }

    #[tokio::test]
    async fn test_etag_revalidation() {
        let (app, _db, _tmp) = build_test_app().await;
        let resp = app.clone().oneshot(get(BUILDINGS_URI)).await.unwrap();
        let etag = resp.headers()[header::ETAG].clone();

        let req = Request::builder()
            .uri(BUILDINGS_URI)
            .header(header::IF_NONE_MATCH, etag)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_invalid_bbox_is_bad_request() {
        let (app, _db, _tmp) = build_test_app().await;
        let resp = app
            .oneshot(get("/api/mapwithai/buildings?bbox=133.35,35.41,133.32,35.44"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("Invalid input"));
    }

    #[tokio::test]
    async fn test_empty_area_returns_empty_document() {
        let (app, _db, _tmp) = build_test_app().await;
        let resp = app
            .oneshot(get("/api/mapwithai/buildings?bbox=139.0,35.0,139.1,35.1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-buildings-count"], "0");
        let body = body_string(resp).await;
        assert!(body.contains("<osm version=\"0.6\""));
        assert!(!body.contains("<way"));
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let (app, db, _tmp) = build_test_app().await;
        db.close().await;

        let resp = app.clone().oneshot(get(BUILDINGS_URI)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_stats_and_root() {
        let (app, _db, _tmp) = build_test_app().await;

        let resp = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["status"], "healthy");

        let resp = app.clone().oneshot(get("/api/stats")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["buildings"]["total"], 1);
        assert_eq!(body["buildings"]["with_height"], 1);
        assert_eq!(body["nodes"]["total"], 3);
        assert_eq!(body["citycodes"][0]["citycode"], "31202");

        let resp = app.oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["name"], "plateau-feed");
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let (app, _db, _tmp) = build_test_app().await;
        let req = Request::builder()
            .uri(BUILDINGS_URI)
            .header(header::ORIGIN, "https://rapideditor.org")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
