//! Orchestrator configuration stored under `<repo>/.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Directory (relative to the repository root) holding orchestrator state.
pub const STATE_DIR_NAME: &str = ".orchestrator";

/// Orchestrator configuration (TOML).
///
/// Missing fields take the defaults below; a missing file is the same as an
/// empty one. Directory settings left unset are derived from the repository path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of pooled workspaces (and the default concurrency ceiling).
    pub pool_size: usize,
    /// Parent directory of pooled worktrees.
    pub worktree_dir: Option<PathBuf>,
    /// Parent directory of shared interpreter environments.
    pub environment_dir: Option<PathBuf>,
    /// Audit logs, run logs, and other orchestrator state.
    pub state_dir: Option<PathBuf>,

    pub allocation_wait_secs: u64,
    /// Idle workspaces older than this are replaced at the start of a batch.
    pub workspace_ttl_secs: u64,
    /// Concurrent worktree creations during pool warm-up.
    pub init_parallelism: usize,
    /// Files removed from a workspace when it is returned to the pool.
    pub task_artifacts: Vec<String>,

    pub max_environments: usize,
    pub environment_wait_secs: u64,
    pub provision_timeout_secs: u64,
    /// Interpreter used to create environments (`<interpreter> -m venv`).
    pub interpreter: String,

    /// Task timeout when the task file does not give one (before the mode multiplier).
    pub default_timeout_secs: u64,
    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,
    /// Extra time allowed past a task timeout for the backend to be killed and reaped.
    pub kill_grace_ms: u64,
    /// Truncate captured backend stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Agent CLI invocation; the prompt is written to its stdin.
    pub command: Vec<String>,
    /// Flag that precedes a comma-separated tool list when a task sets `allowed_tools`.
    pub allowed_tools_flag: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "--print".to_string()],
            allowed_tools_flag: "--allowedTools".to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            worktree_dir: None,
            environment_dir: None,
            state_dir: None,
            allocation_wait_secs: 30,
            workspace_ttl_secs: 30 * 60,
            init_parallelism: 4,
            task_artifacts: vec![
                "task_envelope.json".to_string(),
                "task_result.json".to_string(),
            ],
            max_environments: 10,
            environment_wait_secs: 60,
            provision_timeout_secs: 10 * 60,
            interpreter: "python3".to_string(),
            default_timeout_secs: 300,
            backoff_base_secs: 1.0,
            backoff_cap_secs: 60.0,
            kill_grace_ms: 500,
            output_limit_bytes: 100_000,
            backend: BackendConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be > 0"));
        }
        if self.init_parallelism == 0 {
            return Err(anyhow!("init_parallelism must be > 0"));
        }
        if self.max_environments == 0 {
            return Err(anyhow!("max_environments must be > 0"));
        }
        for (name, value) in [
            ("allocation_wait_secs", self.allocation_wait_secs),
            ("workspace_ttl_secs", self.workspace_ttl_secs),
            ("environment_wait_secs", self.environment_wait_secs),
            ("provision_timeout_secs", self.provision_timeout_secs),
            ("default_timeout_secs", self.default_timeout_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if !(self.backoff_base_secs > 0.0) {
            return Err(anyhow!("backoff_base_secs must be > 0"));
        }
        if !(self.backoff_cap_secs >= self.backoff_base_secs) {
            return Err(anyhow!("backoff_cap_secs must be >= backoff_base_secs"));
        }
        if self.interpreter.trim().is_empty() {
            return Err(anyhow!("interpreter must be non-empty"));
        }
        if self.backend.command.is_empty() || self.backend.command[0].trim().is_empty() {
            return Err(anyhow!("backend.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn worktree_dir(&self, repo: &Path) -> PathBuf {
        self.worktree_dir
            .clone()
            .unwrap_or_else(|| sibling_dir(repo, "worktrees"))
    }

    pub fn environment_dir(&self, repo: &Path) -> PathBuf {
        self.environment_dir
            .clone()
            .unwrap_or_else(|| sibling_dir(repo, "orchestrator-envs"))
    }

    pub fn state_dir(&self, repo: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| repo.join(STATE_DIR_NAME))
    }

    pub fn allocation_wait(&self) -> Duration {
        Duration::from_secs(self.allocation_wait_secs)
    }

    pub fn workspace_ttl(&self) -> Duration {
        Duration::from_secs(self.workspace_ttl_secs)
    }

    pub fn environment_wait(&self) -> Duration {
        Duration::from_secs(self.environment_wait_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// `<repo-parent>/<group>/<repo-name>`, falling back to `<repo>/.orchestrator/<group>`
/// for a repository at the filesystem root.
fn sibling_dir(repo: &Path, group: &str) -> PathBuf {
    match (repo.parent(), repo.file_name()) {
        (Some(parent), Some(name)) => parent.join(group).join(name),
        _ => repo.join(STATE_DIR_NAME).join(group),
    }
}

/// Default config location for a repository.
pub fn default_config_path(repo: &Path) -> PathBuf {
    repo.join(STATE_DIR_NAME).join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
