//! Query command implementation

use crate::config::Config;
use crate::error::Result;
use crate::geom::BBox;
use crate::query::{run_query, QueryRequest};
use crate::store::{BuildingDb, Predicate};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Query options
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub bbox: BBox,
    pub limit: Option<usize>,
    pub predicate: Predicate,
    /// Write the document here instead of stdout
    pub output: Option<PathBuf>,
}

/// What a query produced
#[derive(Debug, Clone, Serialize)]
pub struct QuerySummary {
    pub bbox: String,
    pub predicate: Predicate,
    pub count: usize,
    pub limit: usize,
    pub truncated: bool,
    pub output: Option<String>,
}

/// Run a bounding-box query and emit the OSM XML document.
///
/// Without an output file the document goes to stdout.
pub async fn cmd_query(
    config: &Config,
    db: &BuildingDb,
    options: QueryOptions,
) -> Result<QuerySummary> {
    let request = QueryRequest::new(options.bbox, options.limit, options.predicate, &config.query)?;
    let response = run_query(db, &request, config).await?;

    match &options.output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &response.xml)?;
            info!("Wrote {} buildings to {}", response.count(), path.display());
        }
        None => print!("{}", response.xml),
    }

    Ok(QuerySummary {
        bbox: request.bbox.to_string(),
        predicate: request.predicate,
        count: response.count(),
        limit: response.limit,
        truncated: response.is_truncated(),
        output: options.output.map(|p| p.display().to_string()),
    })
}

/// Print query summary to console (stderr keeps stdout clean for XML)
pub fn print_query_summary(summary: &QuerySummary) {
    eprintln!(
        "\n🔍 {} buildings ({}) in {}",
        summary.count, summary.predicate, summary.bbox
    );
    if summary.truncated {
        eprintln!(
            "  ⚠ Result reached the limit of {}; narrow the box or raise --limit",
            summary.limit
        );
    }
    if let Some(output) = &summary.output {
        eprintln!("  Written to {}", output);
    }
}
