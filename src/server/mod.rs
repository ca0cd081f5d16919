//! HTTP API for editors
//!
//! Serves the building feed consumed by RapiD's MapWithAI layer, plus
//! health and statistics endpoints.

mod routes;

pub use routes::ApiError;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::BuildingDb;
use axum::http::Method;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub db: BuildingDb,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: BuildingDb, config: Config) -> Self {
        Self {
            db,
            config: Arc::new(config),
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers(Any)
        .max_age(Duration::from_secs(86_400));

    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/api/stats", get(routes::stats))
        .route(
            "/api/mapwithai/buildings",
            get(routes::buildings).options(routes::preflight),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: Config, db: BuildingDb, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| Error::Config(format!("Invalid bind address: {}", bind)))?;

    let app = router(AppState::new(db, config));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the process is killed
        std::future::pending::<()>().await;
    }
}
