//! Interpreter environments created with `<interpreter> -m venv` and populated with pip.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::pool::environment::EnvironmentBackend;

pub const METADATA_FILE: &str = "env_metadata.json";

const PROVISION_OUTPUT_LIMIT: usize = 64 * 1024;

/// Contents of `env_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvMetadata {
    pub fingerprint: String,
    pub packages: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

pub fn write_metadata(env_path: &Path, metadata: &EnvMetadata) -> Result<()> {
    let path = env_path.join(METADATA_FILE);
    let mut buf = serde_json::to_string_pretty(metadata).context("serialize env metadata")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

/// Recursive size of a directory tree in bytes. Unreadable entries count as zero.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Provisions virtualenvs with the configured interpreter.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    interpreter: String,
    timeout: Duration,
}

impl VenvProvisioner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    fn run_step(&self, label: &str, cmd: Command) -> Result<()> {
        let output = run_command_with_timeout(cmd, None, self.timeout, PROVISION_OUTPUT_LIMIT)
            .with_context(|| format!("run {label}"))?;
        check_step(label, &output, self.timeout)
    }
}

fn check_step(label: &str, output: &CommandOutput, timeout: Duration) -> Result<()> {
    if output.timed_out {
        return Err(anyhow!("{label} timed out after {timeout:?}"));
    }
    if !output.status.success() {
        let detail = output.stderr_tail().unwrap_or_default();
        return Err(anyhow!(
            "{label} failed with status {:?}: {detail}",
            output.status.code()
        ));
    }
    Ok(())
}

impl EnvironmentBackend for VenvProvisioner {
    #[instrument(skip_all, fields(path = %path.display(), packages = packages.len()))]
    fn provision(&self, path: &Path, packages: &[String]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create environment dir {}", parent.display()))?;
        }

        info!(interpreter = %self.interpreter, "creating virtualenv");
        let mut venv = Command::new(&self.interpreter);
        venv.arg("-m").arg("venv").arg(path);
        self.run_step("venv", venv)?;

        if packages.is_empty() {
            return Ok(());
        }
        debug!(?packages, "installing packages");
        let mut pip = Command::new(path.join("bin").join("pip"));
        pip.args(["install", "--quiet", "--disable-pip-version-check"])
            .args(packages);
        self.run_step("pip install", pip)
    }

    fn destroy(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))
    }

    fn size_bytes(&self, path: &Path) -> u64 {
        dir_size(path)
    }
}
