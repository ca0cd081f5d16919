//! Ingest command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::geom::CoordBounds;
use crate::normalize::{normalize_record, NormalizeContext};
use crate::progress::{advance_progress, finish_progress, start_progress_bar};
use crate::source::{file_label, read_records, SourceFormat};
use crate::store::{BuildingDb, RunCounts, RunStatus, UpsertOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Error messages kept in the summary; later ones are only logged
const MAX_REPORTED_ERRORS: usize = 100;

/// Per-run overrides of the `[ingest]` config section
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Municipality code; inferred from the directory name when absent
    pub citycode: Option<String>,
    pub bounds: Option<CoordBounds>,
    pub dedupe_geometry: Option<bool>,
}

/// Statistics from an ingestion run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub citycode: String,
    pub files_processed: usize,
    pub files_failed: usize,
    pub records_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub geometry_replaced: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub rejected_by_reason: BTreeMap<String, usize>,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl IngestStats {
    fn record_error(&mut self, message: String) {
        warn!("{}", message);
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(message);
        }
    }

    fn run_counts(&self) -> RunCounts {
        RunCounts {
            files_processed: self.files_processed as i64,
            inserted: self.inserted as i64,
            updated: self.updated as i64,
            unchanged: self.unchanged as i64,
            duplicates: self.duplicates as i64,
            rejected: self.rejected as i64,
            failed: self.failed as i64,
        }
    }
}

/// Municipality code from a directory name: its leading five digits
/// (`31202_yonago` gives `31202`), else the whole name.
pub fn infer_citycode(dir: &Path) -> Option<String> {
    let segment = dir.file_name()?.to_str()?.trim();
    if segment.is_empty() {
        return None;
    }

    let code_re = Regex::new(r"^(\d{5})").ok()?;
    match code_re.captures(segment).and_then(|c| c.get(1)) {
        Some(code) => Some(code.as_str().to_string()),
        None => {
            warn!(
                "Directory name '{}' has no 5-digit municipality code, using it as is",
                segment
            );
            Some(segment.to_string())
        }
    }
}

/// Every `.osm` and `.zip` file under `dir`, sorted by path
pub fn discover_source_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| Error::InvalidPath(e.to_string()))?;
        if entry.file_type().is_file() && SourceFormat::from_path(entry.path()).is_some() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Ingest one municipality directory.
///
/// Rejected records and unreadable files are counted and skipped. Storage
/// failures are counted too, but the batch aborts once
/// `ingest.max_consecutive_store_errors` records in a row have failed.
pub async fn cmd_ingest_dir(
    config: &Config,
    db: &BuildingDb,
    dir: &Path,
    options: IngestOptions,
) -> Result<IngestStats> {
    let canonical_dir = dir
        .canonicalize()
        .map_err(|e| Error::InvalidPath(format!("{}: {}", dir.display(), e)))?;
    if !canonical_dir.is_dir() {
        return Err(Error::InvalidPath(format!(
            "{} is not a directory",
            canonical_dir.display()
        )));
    }

    let citycode = match options.citycode {
        Some(code) if !code.trim().is_empty() => code.trim().to_string(),
        Some(_) => {
            return Err(Error::InvalidInput(
                "municipality code cannot be empty".to_string(),
            ))
        }
        None => infer_citycode(&canonical_dir).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Cannot infer municipality code from {}; pass --citycode",
                canonical_dir.display()
            ))
        })?,
    };

    let bounds = options.bounds.unwrap_or(config.ingest.bounds);
    bounds.validate()?;
    let dedupe_geometry = options
        .dedupe_geometry
        .unwrap_or(config.ingest.dedupe_geometry);

    let ctx = NormalizeContext {
        citycode: citycode.clone(),
        bounds,
        source_id_tag: config.ingest.source_id_tag.clone(),
    };

    info!(citycode = %citycode, "Ingesting directory: {}", canonical_dir.display());

    let files = discover_source_files(&canonical_dir)?;
    info!("Found {} source files", files.len());

    let run = db
        .start_ingestion_run(&citycode, &canonical_dir.display().to_string())
        .await?;

    let mut stats = IngestStats {
        citycode: citycode.clone(),
        ..Default::default()
    };
    let mut consecutive_failures = 0usize;
    let max_failures = config.ingest.max_consecutive_store_errors;
    let file_progress = start_progress_bar(files.len(), "Processing files");

    for file_path in &files {
        let label = file_label(file_path, &canonical_dir);
        let records = match read_records(file_path, &label) {
            Ok(records) => records,
            Err(e) => {
                stats.files_failed += 1;
                stats.record_error(format!("{}: {}", label, e));
                advance_progress(&file_progress);
                continue;
            }
        };

        debug!(
            file = %label,
            count = records.len(),
            "Read building records"
        );
        stats.files_processed += 1;

        for record in &records {
            stats.records_seen += 1;

            let building = match normalize_record(record, &ctx) {
                Ok(building) => building,
                Err(rejection) => {
                    debug!(file = %record.file, "Rejected record: {}", rejection);
                    stats.rejected += 1;
                    *stats
                        .rejected_by_reason
                        .entry(rejection.reason.to_string())
                        .or_default() += 1;
                    continue;
                }
            };

            match db.upsert_building(&building, dedupe_geometry).await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    match outcome {
                        UpsertOutcome::Inserted { .. } => stats.inserted += 1,
                        UpsertOutcome::Updated {
                            geometry_replaced, ..
                        } => {
                            stats.updated += 1;
                            if geometry_replaced {
                                stats.geometry_replaced += 1;
                            }
                        }
                        UpsertOutcome::Unchanged { .. } => stats.unchanged += 1,
                        UpsertOutcome::Duplicate { existing_source_id } => {
                            debug!(
                                source_id = %building.source_id,
                                "Same footprint already stored as {}",
                                existing_source_id
                            );
                            stats.duplicates += 1;
                        }
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    consecutive_failures += 1;
                    stats.record_error(format!("{}: {}", building.source_id, e));

                    if consecutive_failures >= max_failures {
                        finish_progress(file_progress, "Aborted");
                        let message = format!(
                            "{} consecutive storage failures, last: {}",
                            consecutive_failures, e
                        );
                        // Best effort: the store is likely unreachable
                        if let Err(e) = db
                            .complete_ingestion_run(
                                &run.id,
                                RunStatus::Failed,
                                stats.run_counts(),
                                Some(stats.errors.clone()),
                            )
                            .await
                        {
                            warn!("Could not record failed ingestion run: {}", e);
                        }
                        return Err(Error::Aborted(message));
                    }
                }
            }
        }

        advance_progress(&file_progress);
    }

    finish_progress(file_progress, "Files processed");

    let errors = if stats.errors.is_empty() {
        None
    } else {
        Some(stats.errors.clone())
    };

    db.complete_ingestion_run(
        &run.id,
        if stats.errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        },
        stats.run_counts(),
        errors,
    )
    .await?;

    info!(
        citycode = %citycode,
        "Ingestion complete: {} inserted, {} updated, {} unchanged, {} duplicates, {} rejected, {} failed",
        stats.inserted,
        stats.updated,
        stats.unchanged,
        stats.duplicates,
        stats.rejected,
        stats.failed
    );

    Ok(stats)
}

/// Print ingestion summary to console
pub fn print_ingest_stats(stats: &IngestStats) {
    println!("\n✓ Ingestion complete for {}", stats.citycode);
    println!(
        "  Files processed: {} ({} failed)",
        stats.files_processed, stats.files_failed
    );
    println!("  Records seen: {}", stats.records_seen);
    println!("  Inserted: {}", stats.inserted);
    println!(
        "  Updated: {} ({} with new geometry)",
        stats.updated, stats.geometry_replaced
    );
    println!("  Unchanged: {}", stats.unchanged);
    println!("  Duplicates skipped: {}", stats.duplicates);
    println!("  Rejected: {}", stats.rejected);
    for (reason, count) in &stats.rejected_by_reason {
        println!("    {}: {}", reason, count);
    }
    println!("  Storage failures: {}", stats.failed);

    if !stats.errors.is_empty() {
        println!("\nErrors:");
        for error in &stats.errors {
            println!("  • {}", error);
        }
    }
}
