use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::{RebuildOutcome, RunSummary};

pub const REPORT_FILE: &str = "load_summary.json";

/// Writes `<reports>/<run_id>/load_summary.json` and returns its path.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join(REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One-line operator summary.
pub fn summary_line(summary: &RunSummary) -> String {
    let mut line = format!(
        "load complete: run_id={} batches={} committed={} skipped={} failed={}",
        summary.run_id,
        summary.batches.len(),
        summary.committed(),
        summary.skipped(),
        summary.failed()
    );
    if let Some(reason) = &summary.invalid_date {
        line.push_str(&format!(" raw_load=skipped ({reason})"));
    }
    match &summary.rebuild {
        Some(RebuildOutcome::Completed(counts)) => line.push_str(&format!(
            " rebuild=ok owner_rows={} land_type_rows={}",
            counts.owner_summary_rows, counts.land_type_summary_rows
        )),
        Some(RebuildOutcome::Failed { .. }) => line.push_str(" rebuild=failed"),
        None => {}
    }
    if let Some(path) = &summary.report_path {
        line.push_str(&format!(" report={path}"));
    }
    line
}
