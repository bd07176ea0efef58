//! CLI command implementations: `run`, `list`, `cleanup`, `init`, `assess`.
//!
//! These wire configuration, the git worktree backend, the venv provisioner, and
//! the agent CLI runner into the pools and the scheduler. Printing lives in
//! `main`; everything here returns data.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::core::aggregate::aggregate;
use crate::core::risk::{RiskMode, assess, should_auto_approve};
use crate::core::types::{TaskEnvelope, TaskResult};
use crate::io::audit_log::{AuditLog, RunPaths};
use crate::io::config::{OrchestratorConfig, default_config_path, load_config};
use crate::io::report::{RunReport, write_report};
use crate::io::task_file::{load_envelopes, read_task_file, write_sample_task_file};
use crate::io::task_runner::{AgentCliRunner, TaskRunner};
use crate::io::venv::VenvProvisioner;
use crate::io::worktrees::{GitWorktrees, PooledWorktree, generate_short_id, generate_timestamp};
use crate::pool::environment::{EnvironmentPool, EnvironmentPoolSettings};
use crate::pool::workspace::{CleanupReport, WorkspacePool, WorkspacePoolSettings};
use crate::scheduler::{Approver, Scheduler, SchedulerSettings};

/// Repository, config, and directory overrides shared by every command.
#[derive(Debug, Clone, Default)]
pub struct RepoOptions {
    pub repo: PathBuf,
    pub config: Option<PathBuf>,
    pub worktree_dir: Option<PathBuf>,
}

impl RepoOptions {
    /// Canonical repository path and the effective config (file + CLI overrides).
    pub fn resolve(&self) -> Result<(PathBuf, OrchestratorConfig)> {
        let repo = fs::canonicalize(&self.repo)
            .with_context(|| format!("resolve repository {}", self.repo.display()))?;
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| default_config_path(&repo));
        let mut config = load_config(&config_path)?;
        if let Some(dir) = &self.worktree_dir {
            config.worktree_dir = Some(dir.clone());
        }
        Ok((repo, config))
    }

    fn open_worktrees(&self) -> Result<(PathBuf, OrchestratorConfig, GitWorktrees)> {
        let (repo, config) = self.resolve()?;
        let worktrees = GitWorktrees::open(
            &repo,
            config.worktree_dir(&repo),
            config.task_artifacts.clone(),
        )?;
        Ok((repo, config, worktrees))
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub repo: RepoOptions,
    pub tasks: PathBuf,
    pub mode: RiskMode,
    pub max_concurrent: Option<usize>,
    pub output: Option<PathBuf>,
    /// Run tasks one at a time in file order, honoring `depends_on`.
    pub workflow: bool,
    pub keep_workspaces: bool,
    pub interactive: bool,
}

/// Prompts on the terminal for tasks the risk gate will not auto-approve.
#[derive(Debug, Default)]
pub struct StdinApprover {
    prompt: Mutex<()>,
}

impl Approver for StdinApprover {
    fn confirm(&self, envelope: &TaskEnvelope, risk: f64, mode: RiskMode) -> bool {
        let _turn = self.prompt.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "task {} needs confirmation (risk {risk:.2}, {mode} mode)\n  {}\nproceed? [y/N] ",
            envelope.task_id, envelope.description
        );
        let _ = stderr.flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

pub fn new_run_id() -> String {
    format!("run-{}-{}", generate_timestamp(), generate_short_id())
}

/// Execute a task file end to end and return the run report.
pub async fn run(options: &RunOptions) -> Result<RunReport> {
    let (repo, config, worktrees) = options.repo.open_worktrees()?;
    let envelopes = load_envelopes(&options.tasks, options.mode, &config)?;
    let started_at = Utc::now();
    let run_id = new_run_id();
    info!(run_id = %run_id, tasks = envelopes.len(), mode = %options.mode, "starting run");

    let sweeper = worktrees.clone();
    let swept = tokio::task::spawn_blocking(move || sweeper.sweep())
        .await
        .context("leftover sweep panicked")??;
    if swept.removed > 0 {
        info!(removed = swept.removed, "removed leftover workspaces");
    }

    let workspaces = Arc::new(WorkspacePool::new(
        worktrees,
        WorkspacePoolSettings {
            capacity: config.pool_size,
            allocation_wait: config.allocation_wait(),
            ttl: config.workspace_ttl(),
            init_parallelism: config.init_parallelism,
        },
    ));
    workspaces
        .initialize(config.pool_size.min(envelopes.len()))
        .await;

    let environments = Arc::new(EnvironmentPool::new(
        VenvProvisioner::new(config.interpreter.clone(), config.provision_timeout()),
        EnvironmentPoolSettings {
            root: config.environment_dir(&repo),
            max_environments: config.max_environments,
            wait: config.environment_wait(),
        },
    ));

    let run_paths = RunPaths::new(&config.state_dir(&repo), &run_id);
    let audit = Arc::new(AuditLog::open(&run_paths.audit_path)?);
    let runner: Arc<dyn TaskRunner> = Arc::new(AgentCliRunner::new(config.backend.clone()));
    let mut scheduler = Scheduler::new(
        Arc::clone(&workspaces),
        Some(Arc::clone(&environments)),
        runner,
        audit,
        SchedulerSettings {
            mode: options.mode,
            run_paths,
            kill_grace: config.kill_grace(),
            output_limit_bytes: config.output_limit_bytes,
        },
    );
    if options.interactive {
        scheduler = scheduler.with_approver(Arc::new(StdinApprover::default()));
    }

    let executed = if options.workflow {
        scheduler.execute_workflow(envelopes).await
    } else {
        scheduler
            .execute_batch(envelopes, options.max_concurrent)
            .await
    };

    if options.keep_workspaces {
        info!("keeping workspaces");
    } else {
        let removed = workspaces.cleanup().await;
        let envs = environments.cleanup().await;
        if removed.failed + envs.failed > 0 {
            warn!(
                workspaces = removed.failed,
                environments = envs.failed,
                "some resources could not be removed"
            );
        }
    }

    let results = executed?;
    let summary = aggregate(&results)?;
    let report = RunReport::new(&run_id, options.mode, started_at, summary, results);
    if let Some(path) = &options.output {
        write_report(path, &report)?;
        info!(path = %path.display(), "wrote run report");
    }
    Ok(report)
}

/// Pooled worktrees currently registered with the repository.
pub fn list(options: &RepoOptions) -> Result<Vec<PooledWorktree>> {
    let (_, _, worktrees) = options.open_worktrees()?;
    worktrees.pooled()
}

/// Destroy every pooled worktree and its branch.
pub fn cleanup(options: &RepoOptions) -> Result<CleanupReport> {
    let (_, _, worktrees) = options.open_worktrees()?;
    worktrees.sweep()
}

pub fn init(output: &Path) -> Result<()> {
    write_sample_task_file(output)
}

/// Per-task outcome of the risk gate, without executing anything.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRow {
    pub name: String,
    pub score: f64,
    pub destructive: bool,
    pub production: bool,
    pub auto_approved: bool,
}

pub fn assess_tasks(tasks: &Path, mode: RiskMode) -> Result<Vec<AssessmentRow>> {
    let file = read_task_file(tasks)?;
    Ok(file
        .tasks
        .iter()
        .map(|task| {
            let intent = task.intent();
            let assessment = assess(intent);
            AssessmentRow {
                name: task.name.clone(),
                score: assessment.map_or(1.0, |a| a.score),
                destructive: assessment.is_some_and(|a| a.destructive),
                production: assessment.is_some_and(|a| a.production),
                auto_approved: should_auto_approve(mode, intent),
            }
        })
        .collect())
}

/// One line per task, e.g. `ok    feature-api  completed  (12.3s)`.
pub fn format_result_line(result: &TaskResult) -> String {
    let mark = if result.is_success() { "ok" } else { "FAIL" };
    let mut line = format!(
        "{mark:<5} {}  {}  ({:.1}s",
        result.task_id, result.status, result.execution_time_seconds
    );
    if result.provenance.retry_count > 0 {
        line.push_str(&format!(", {} retries", result.provenance.retry_count));
    }
    line.push(')');
    if let Some(message) = &result.error_message {
        line.push_str(&format!(": {message}"));
    }
    line
}

pub fn format_totals(report: &RunReport) -> String {
    format!(
        "{}/{} tasks completed ({} failed, {} timed out, {} skipped)",
        report.successful, report.total_tasks, report.failed, report.timeout, report.skipped
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ErrorKind, Priority, ProvenanceInfo, TaskStatus};
    use crate::test_support::envelope;

    #[test]
    fn assess_reports_scores_and_decisions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"tasks": [
                {"name": "docs", "description": "write documentation"},
                {"name": "wipe", "description": "delete all production records"}
            ]}"#,
        )
        .expect("write");

        let rows = assess_tasks(&path, RiskMode::Aggressive).expect("assess");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].score, 0.0);
        assert!(rows[0].auto_approved);
        assert!(rows[1].destructive && rows[1].production);
        assert!(!rows[1].auto_approved);
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        init(&path).expect("first");
        assert!(init(&path).is_err());
        assert_eq!(read_task_file(&path).expect("read").tasks.len(), 3);
    }

    #[test]
    fn result_line_includes_error_and_retries() {
        let result_with = |status, message: Option<&str>, retries| {
            let env = envelope("task-a", Priority::Medium);
            let now = Utc::now();
            TaskResult {
                task_id: env.task_id,
                agent_name: env.agent_name,
                agent_type: env.agent_type,
                status,
                outputs: Default::default(),
                error_kind: message.map(|_| ErrorKind::ExecutionFailure),
                error_message: message.map(str::to_string),
                execution_time_seconds: 1.0,
                provenance: ProvenanceInfo {
                    input_hash: String::new(),
                    output_hash: None,
                    started_at: now,
                    ended_at: now,
                    workspace_id: None,
                    branch_name: None,
                    environment_id: None,
                    retry_count: retries,
                },
            }
        };

        let ok = format_result_line(&result_with(TaskStatus::Completed, None, 0));
        assert_eq!(ok, "ok    task-a  completed  (1.0s)");
        let failed = format_result_line(&result_with(TaskStatus::Failed, Some("boom"), 2));
        assert_eq!(failed, "FAIL  task-a  failed  (1.0s, 2 retries): boom");
    }

    #[test]
    fn run_ids_are_unique() {
        let a = new_run_id();
        assert!(a.starts_with("run-"));
        assert_ne!(a, new_run_id());
    }
}
