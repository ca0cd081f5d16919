//! Serve command implementation

use crate::config::Config;
use crate::error::Result;
use crate::server;
use crate::store::BuildingDb;
use tracing::info;

/// Run the HTTP API until interrupted
pub async fn cmd_serve(config: Config, db: BuildingDb, bind: Option<String>) -> Result<()> {
    info!(
        "Serving buildings from {} (default limit {}, max {})",
        config.paths.db_file.display(),
        config.query.default_limit,
        config.query.max_limit
    );
    server::serve(config, db, bind).await
}
