//! Run result file written by `run --output`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::aggregate::RunSummary;
use crate::core::risk::RiskMode;
use crate::core::types::TaskResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RiskMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeout: usize,
    pub skipped: usize,
    /// Fraction of tasks that completed, in `[0, 1]`.
    pub success_rate: f64,
    pub summary: RunSummary,
    pub results: Vec<TaskResult>,
}

impl RunReport {
    pub fn new(
        run_id: &str,
        mode: RiskMode,
        started_at: DateTime<Utc>,
        summary: RunSummary,
        results: Vec<TaskResult>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            mode,
            started_at,
            finished_at: Utc::now(),
            total_tasks: summary.counts.total,
            successful: summary.counts.succeeded,
            failed: summary.counts.failed,
            timeout: summary.counts.timed_out,
            skipped: summary.counts.skipped,
            success_rate: summary.success_rate,
            summary,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.successful == self.total_tasks
    }
}

/// Atomically write the report (temp file + rename).
pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(report).context("serialize run report")?;
    buf.push('\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    Ok(())
}
