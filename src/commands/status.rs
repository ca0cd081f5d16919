//! Stats command implementation

use crate::config::Config;
use crate::error::Result;
use crate::store::{BuildingDb, GlobalStats, IngestionRun};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Recent ingestion runs shown by `stats`
const RECENT_RUNS: i64 = 5;

/// Status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub db_stats: GlobalStats,
    pub recent_runs: Vec<IngestionRun>,
}

/// Aggregate counts and recent ingestion history
pub async fn cmd_stats(config: &Config, db: &BuildingDb) -> Result<StatusInfo> {
    info!("Getting stats");

    let db_stats = db.global_stats().await?;
    let recent_runs = db.latest_runs(RECENT_RUNS).await?;

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        db_stats,
        recent_runs,
    })
}

/// Print status to console
pub fn print_stats(status: &StatusInfo) {
    println!("\n📊 plateau-feed Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Database: {}", status.db_path);

    let stats = &status.db_stats;
    println!("\nBuildings: {}", stats.building_count);
    println!("  With height: {}", stats.buildings_with_height);
    if let Some(avg) = stats.avg_height {
        println!("  Average height: {:.1} m", avg);
    }
    if let Some(max) = stats.max_height {
        println!("  Max height: {:.1} m", max);
    }
    println!("Nodes: {}", stats.node_count);

    if !stats.citycodes.is_empty() {
        println!("\nMunicipalities:");
        for city in &stats.citycodes {
            println!("  {}: {}", city.citycode, city.buildings);
        }
    }

    if status.recent_runs.is_empty() {
        println!("\nNo ingestion runs yet. Use 'plateau-feed ingest <dir>' to import data.");
        return;
    }

    println!("\nRecent ingestion runs:");
    for run in &status.recent_runs {
        println!(
            "• {} [{}] {}",
            run.citycode, run.status, run.started_at
        );
        println!("  Source: {}", run.source_dir);
        println!(
            "  Files: {}, inserted: {}, updated: {}, unchanged: {}, duplicates: {}, rejected: {}, failed: {}",
            run.files_processed,
            run.inserted,
            run.updated,
            run.unchanged,
            run.duplicates,
            run.rejected,
            run.failed
        );
    }
}
