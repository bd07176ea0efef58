//! Run artifacts under the state directory.
//!
//! - `audit/<run_id>.jsonl`: one line per task state transition, append-only.
//! - `runs/<run_id>/<task_id>/attempt-<n>.log`: backend output per attempt.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::hash::sha256_hex;
use crate::core::types::TaskStatus;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub audit_path: PathBuf,
}

impl RunPaths {
    pub fn new(state_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: state_dir.join("runs").join(run_id),
            audit_path: state_dir.join("audit").join(format!("{run_id}.jsonl")),
        }
    }

    /// Log file for one attempt (1-based).
    pub fn attempt_log(&self, task_id: &str, attempt: u32) -> PathBuf {
        self.run_dir
            .join(sanitize_component(task_id))
            .join(format!("attempt-{attempt}.log"))
    }
}

/// Map a task id to a single, distinct path component.
///
/// Ids made only of safe characters are kept as-is. Anything else is rewritten
/// and suffixed with a hash of the raw id, so `a/b` and `a_b` never collide and
/// `..` cannot climb out of the run directory.
fn sanitize_component(raw: &str) -> String {
    let safe = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.');
    if !raw.is_empty() && !raw.starts_with('.') && raw.chars().all(safe) {
        return raw.to_string();
    }
    let cleaned: String = raw
        .chars()
        .enumerate()
        .map(|(idx, ch)| if safe(ch) && !(idx == 0 && ch == '.') { ch } else { '_' })
        .collect();
    format!("{cleaned}-{}", &sha256_hex(raw.as_bytes())[..8])
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    /// `None` for the first record of a task.
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    pub reason: String,
}

/// Append-only JSON-lines audit log shared by all tasks of a run.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn record(
        &self,
        task_id: &str,
        from: Option<TaskStatus>,
        to: TaskStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            task_id: task_id.to_string(),
            from,
            to,
            reason: reason.into(),
        };
        let mut line = serde_json::to_string(&entry).context("serialize audit entry")?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("audit log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

pub fn read_audit_log(path: &Path) -> Result<Vec<AuditEntry>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}
