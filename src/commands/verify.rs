//! Verify command implementation

use crate::error::Result;
use crate::store::{BuildingDb, IntegrityIssue};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub buildings_checked: i64,
    pub issues: Vec<IntegrityIssue>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check node runs and spatial index rows of every building
pub async fn cmd_verify(db: &BuildingDb) -> Result<VerifyReport> {
    info!("Verifying store integrity");

    let buildings_checked = db.global_stats().await?.building_count;
    let issues = db.verify_integrity().await?;

    Ok(VerifyReport {
        buildings_checked,
        issues,
    })
}

pub fn print_verify_report(report: &VerifyReport) {
    println!("\n🔎 Integrity check\n");
    println!("Buildings checked: {}", report.buildings_checked);

    if report.is_ok() {
        println!("✓ No problems found");
        return;
    }

    println!("✗ {} problem(s):", report.issues.len());
    for issue in &report.issues {
        println!(
            "  • #{} {}: {}",
            issue.building_id, issue.source_id, issue.problem
        );
    }
}
