//! Task scheduling: risk gate, resource allocation, retries, and timeouts.
//!
//! Each envelope moves through `Pending -> InProgress (-> Retrying -> InProgress)*`
//! to exactly one terminal status. Every transition is appended to the run's
//! audit log. Failures never propagate out of [`Scheduler::execute_one`]; they
//! are recorded on the returned [`TaskResult`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::backoff_delay;
use crate::core::hash::content_hash;
use crate::core::risk::{RiskMode, assess_risk, should_auto_approve};
use crate::core::types::{ErrorKind, ProvenanceInfo, TaskEnvelope, TaskResult, TaskStatus};
use crate::error::OrchestratorError;
use crate::io::audit_log::{AuditLog, RunPaths};
use crate::io::task_runner::{CancelFlag, EnvironmentContext, TaskOutputs, TaskRequest, TaskRunner};
use crate::pool::environment::{EnvironmentBackend, EnvironmentPool};
use crate::pool::workspace::{WorkspaceBackend, WorkspacePool};

/// Human confirmation channel for tasks the risk gate does not auto-approve.
///
/// Called from a blocking thread; implementations may prompt interactively.
pub trait Approver: Send + Sync {
    fn confirm(&self, envelope: &TaskEnvelope, risk: f64, mode: RiskMode) -> bool;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode: RiskMode,
    pub run_paths: RunPaths,
    /// Extra time given to a timed-out backend before the attempt is abandoned.
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

pub struct Scheduler<W: WorkspaceBackend, E: EnvironmentBackend> {
    workspaces: Arc<WorkspacePool<W>>,
    environments: Option<Arc<EnvironmentPool<E>>>,
    runner: Arc<dyn TaskRunner>,
    approver: Option<Arc<dyn Approver>>,
    audit: Arc<AuditLog>,
    settings: Arc<SchedulerSettings>,
}

impl<W: WorkspaceBackend, E: EnvironmentBackend> Clone for Scheduler<W, E> {
    fn clone(&self) -> Self {
        Self {
            workspaces: Arc::clone(&self.workspaces),
            environments: self.environments.clone(),
            runner: Arc::clone(&self.runner),
            approver: self.approver.clone(),
            audit: Arc::clone(&self.audit),
            settings: Arc::clone(&self.settings),
        }
    }
}

/// Releases a task's resources if the task future is dropped before it could.
struct ReleaseGuard<W: WorkspaceBackend, E: EnvironmentBackend> {
    armed: Option<(Arc<WorkspacePool<W>>, Option<Arc<EnvironmentPool<E>>>, String)>,
}

impl<W: WorkspaceBackend, E: EnvironmentBackend> ReleaseGuard<W, E> {
    async fn release(mut self) {
        if let Some((workspaces, environments, task_id)) = self.armed.take() {
            if let Some(environments) = environments {
                environments.release(&task_id);
            }
            workspaces.release(&task_id).await;
        }
    }
}

impl<W: WorkspaceBackend, E: EnvironmentBackend> Drop for ReleaseGuard<W, E> {
    fn drop(&mut self) {
        let Some((workspaces, environments, task_id)) = self.armed.take() else {
            return;
        };
        if let Some(environments) = environments {
            environments.release(&task_id);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { workspaces.release(&task_id).await });
            }
            Err(_) => warn!(task_id = %task_id, "workspace leaked: no runtime to release it"),
        }
    }
}

/// Where a task got to, used to fill in provenance.
#[derive(Debug, Default)]
struct Placement {
    workspace_id: Option<String>,
    branch_name: Option<String>,
    environment_id: Option<String>,
}

struct Outcome {
    status: TaskStatus,
    outputs: TaskOutputs,
    error: Option<OrchestratorError>,
    attempts: u32,
}

impl Outcome {
    fn failed(error: OrchestratorError, attempts: u32) -> Self {
        let status = if matches!(error, OrchestratorError::ExecutionTimeout(_)) {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        };
        Self {
            status,
            outputs: TaskOutputs::new(),
            error: Some(error),
            attempts,
        }
    }
}

impl<W: WorkspaceBackend, E: EnvironmentBackend> Scheduler<W, E> {
    pub fn new(
        workspaces: Arc<WorkspacePool<W>>,
        environments: Option<Arc<EnvironmentPool<E>>>,
        runner: Arc<dyn TaskRunner>,
        audit: Arc<AuditLog>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            workspaces,
            environments,
            runner,
            approver: None,
            audit,
            settings: Arc::new(settings),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Concurrency used when a batch does not specify one:
    /// pool capacity, the mode's parallelism limit, and available cores, whichever is lowest.
    pub fn default_concurrency(&self) -> usize {
        let cores = std::thread::available_parallelism().map_or(1, usize::from);
        self.workspaces
            .capacity()
            .min(self.settings.mode.policy().max_parallel)
            .min(cores)
            .max(1)
    }

    fn audit(&self, task_id: &str, from: Option<TaskStatus>, to: TaskStatus, reason: &str) {
        if let Err(err) = self.audit.record(task_id, from, to, reason) {
            warn!(task_id, err = %format!("{err:#}"), "failed to append audit entry");
        }
    }

    /// Run one envelope to a terminal result.
    #[instrument(skip_all, fields(task_id = %envelope.task_id))]
    pub async fn execute_one(&self, envelope: TaskEnvelope) -> TaskResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let envelope = Arc::new(envelope);
        let task_id = envelope.task_id.clone();
        self.audit(&task_id, None, TaskStatus::Pending, "submitted");

        let mut placement = Placement::default();
        let outcome = match self.admit(&envelope).await {
            Err(err) => Outcome::failed(err, 0),
            Ok(()) => self.run_with_resources(&envelope, &mut placement).await,
        };

        let from = if outcome.attempts == 0 {
            TaskStatus::Pending
        } else {
            TaskStatus::InProgress
        };
        let reason = outcome
            .error
            .as_ref()
            .map_or_else(|| "completed".to_string(), ToString::to_string);
        self.audit(&task_id, Some(from), outcome.status, &reason);

        let result = self.finish(&envelope, outcome, placement, started_at, clock);
        info!(
            status = %result.status,
            retries = result.provenance.retry_count,
            elapsed = result.execution_time_seconds,
            "task finished"
        );
        result
    }

    /// Validate the envelope and apply the risk gate.
    async fn admit(&self, envelope: &TaskEnvelope) -> Result<(), OrchestratorError> {
        envelope.validate()?;

        let mode = match envelope.constraints.risk_mode {
            Some(requested) => self.settings.mode.stricter(requested),
            None => self.settings.mode,
        };
        let forced_manual = envelope.constraints.auto_approve == Some(false);
        if !forced_manual && should_auto_approve(mode, &envelope.description) {
            return Ok(());
        }

        let risk = assess_risk(&envelope.description);
        if let Some(approver) = &self.approver {
            let approver = Arc::clone(approver);
            let pending = envelope.clone();
            let confirmed =
                tokio::task::spawn_blocking(move || approver.confirm(&pending, risk, mode))
                    .await
                    .unwrap_or(false);
            if confirmed {
                info!(risk, mode = %mode, "task confirmed manually");
                return Ok(());
            }
        }
        warn!(risk, mode = %mode, "task requires manual confirmation");
        Err(OrchestratorError::RiskRejected { risk, mode })
    }

    async fn run_with_resources(
        &self,
        envelope: &Arc<TaskEnvelope>,
        placement: &mut Placement,
    ) -> Outcome {
        let task_id = envelope.task_id.as_str();
        let workspace = match self.workspaces.allocate(task_id).await {
            Ok(handle) => handle,
            Err(err) => return Outcome::failed(err, 0),
        };
        placement.workspace_id = Some(workspace.id.clone());
        placement.branch_name = Some(workspace.branch_name.clone());
        let guard = ReleaseGuard {
            armed: Some((
                Arc::clone(&self.workspaces),
                self.environments.clone(),
                task_id.to_string(),
            )),
        };

        let outcome = match self.prepare(envelope, &workspace.path).await {
            Ok(environment) => {
                placement.environment_id = environment.as_ref().map(|env| env.id.clone());
                self.audit(
                    task_id,
                    Some(TaskStatus::Pending),
                    TaskStatus::InProgress,
                    &format!("attempt 1 in {}", workspace.id),
                );
                self.attempt_loop(envelope, &workspace.path, environment).await
            }
            Err(err) => Outcome::failed(err, 0),
        };

        guard.release().await;
        outcome
    }

    /// Move to the task's base branch and attach an environment.
    async fn prepare(
        &self,
        envelope: &TaskEnvelope,
        workdir: &std::path::Path,
    ) -> Result<Option<EnvironmentContext>, OrchestratorError> {
        let task_id = envelope.task_id.as_str();
        if let Some(branch) = envelope.base_branch() {
            self.workspaces.refresh(task_id, Some(branch)).await?;
        }

        if envelope.dependencies.is_empty() {
            return Ok(None);
        }
        let Some(environments) = &self.environments else {
            warn!("task declares dependencies but no environment pool is configured");
            return Ok(None);
        };
        let tags = vec![envelope.agent_type.as_str().to_string()];
        match environments
            .allocate(task_id, &envelope.dependencies, &tags)
            .await
        {
            Ok(handle) => Ok(Some(EnvironmentContext {
                id: handle.id,
                path: handle.env_path,
            })),
            Err(OrchestratorError::ProvisioningFailure(reason)) => {
                warn!(reason = %reason, "shared environment unavailable, provisioning a private one");
                let path = environments
                    .provision_private(workdir, &envelope.dependencies)
                    .await?;
                Ok(Some(EnvironmentContext {
                    id: format!("private:{task_id}"),
                    path,
                }))
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt_loop(
        &self,
        envelope: &Arc<TaskEnvelope>,
        workdir: &std::path::Path,
        environment: Option<EnvironmentContext>,
    ) -> Outcome {
        let task_id = envelope.task_id.as_str();
        let policy = &envelope.retry_policy;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = self
                .run_attempt(envelope, attempt, workdir.to_path_buf(), environment.clone())
                .await;
            let err = match result {
                Ok(outputs) => {
                    let missing: Vec<&str> = envelope
                        .expected_outputs
                        .iter()
                        .filter(|key| !outputs.contains_key(key.as_str()))
                        .map(String::as_str)
                        .collect();
                    if !missing.is_empty() {
                        warn!(missing = ?missing, "task completed without some expected outputs");
                    }
                    return Outcome {
                        status: TaskStatus::Completed,
                        outputs,
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            let retryable = match err {
                OrchestratorError::ExecutionTimeout(_) => policy.retry_on_timeout,
                _ => true,
            };
            let retries_used = attempt - 1;
            if !retryable || retries_used >= policy.max_retries {
                return Outcome::failed(err, attempt);
            }

            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            let delay = backoff_delay(policy, retries_used, jitter);
            warn!(attempt, delay = ?delay, err = %err, "attempt failed, retrying");
            self.audit(
                task_id,
                Some(TaskStatus::InProgress),
                TaskStatus::Retrying,
                &err.to_string(),
            );
            tokio::time::sleep(delay).await;

            self.audit(
                task_id,
                Some(TaskStatus::Retrying),
                TaskStatus::InProgress,
                &format!("attempt {}", attempt + 1),
            );
            if let Err(reset) = self.workspaces.refresh(task_id, envelope.base_branch()).await {
                return Outcome::failed(reset, attempt);
            }
        }
    }

    /// One bounded attempt. The backend enforces the timeout itself; the outer
    /// bound only catches backends that ignore it.
    async fn run_attempt(
        &self,
        envelope: &Arc<TaskEnvelope>,
        attempt: u32,
        workdir: PathBuf,
        environment: Option<EnvironmentContext>,
    ) -> Result<TaskOutputs, OrchestratorError> {
        let timeout = envelope.timeout();
        let cancel = CancelFlag::default();
        let request = TaskRequest {
            envelope: Arc::clone(envelope),
            attempt,
            workdir,
            environment,
            timeout,
            output_limit_bytes: envelope
                .constraints
                .limits
                .output_limit_bytes
                .unwrap_or(self.settings.output_limit_bytes),
            log_path: self
                .settings
                .run_paths
                .attempt_log(&envelope.task_id, attempt),
            cancel: cancel.clone(),
        };
        debug!(attempt, timeout = ?timeout, "starting attempt");

        let runner = Arc::clone(&self.runner);
        let handle = tokio::task::spawn_blocking(move || runner.run(&request));
        match tokio::time::timeout(timeout + self.settings.kill_grace, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(OrchestratorError::ExecutionFailure(format!(
                "task runner panicked: {join}"
            ))),
            Err(_) => {
                cancel.cancel();
                Err(OrchestratorError::ExecutionTimeout(timeout))
            }
        }
    }

    fn finish(
        &self,
        envelope: &TaskEnvelope,
        outcome: Outcome,
        placement: Placement,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> TaskResult {
        let input_hash = content_hash(envelope).unwrap_or_else(|err| {
            warn!(err = %err, "failed to hash envelope");
            String::new()
        });
        let output_hash = if outcome.status == TaskStatus::Completed {
            content_hash(&outcome.outputs).ok()
        } else {
            None
        };
        TaskResult {
            task_id: envelope.task_id.clone(),
            agent_name: envelope.agent_name.clone(),
            agent_type: envelope.agent_type,
            status: outcome.status,
            outputs: outcome.outputs,
            error_kind: outcome.error.as_ref().map(OrchestratorError::kind),
            error_message: outcome.error.as_ref().map(ToString::to_string),
            execution_time_seconds: clock.elapsed().as_secs_f64(),
            provenance: ProvenanceInfo {
                input_hash,
                output_hash,
                started_at,
                ended_at: Utc::now(),
                workspace_id: placement.workspace_id,
                branch_name: placement.branch_name,
                environment_id: placement.environment_id,
                retry_count: outcome.attempts.saturating_sub(1),
            },
        }
    }

    fn panicked(&self, envelope: &TaskEnvelope, reason: &str) -> TaskResult {
        warn!(task_id = %envelope.task_id, reason, "task panicked");
        let failure = OrchestratorError::ExecutionFailure(format!("task panicked: {reason}"));
        self.audit(&envelope.task_id, None, TaskStatus::Failed, &failure.to_string());
        let now = Utc::now();
        self.finish(
            envelope,
            Outcome::failed(failure, 0),
            Placement::default(),
            now,
            Instant::now(),
        )
    }

    /// Result for a task whose prerequisites did not complete.
    fn skipped(&self, envelope: &TaskEnvelope, unmet: &[&str]) -> TaskResult {
        let now = Utc::now();
        let message = format!("unmet dependency: {}", unmet.join(", "));
        self.audit(&envelope.task_id, None, TaskStatus::Pending, "submitted");
        self.audit(
            &envelope.task_id,
            Some(TaskStatus::Pending),
            TaskStatus::Skipped,
            &message,
        );
        TaskResult {
            task_id: envelope.task_id.clone(),
            agent_name: envelope.agent_name.clone(),
            agent_type: envelope.agent_type,
            status: TaskStatus::Skipped,
            outputs: TaskOutputs::new(),
            error_kind: Some(ErrorKind::UnmetDependency),
            error_message: Some(message),
            execution_time_seconds: 0.0,
            provenance: ProvenanceInfo {
                input_hash: content_hash(envelope).unwrap_or_default(),
                output_hash: None,
                started_at: now,
                ended_at: now,
                workspace_id: None,
                branch_name: None,
                environment_id: None,
                retry_count: 0,
            },
        }
    }

    /// Run envelopes concurrently, starting higher priorities first.
    ///
    /// At most `max_concurrent` tasks (default [`Self::default_concurrency`]) hold a
    /// slot at once. Results come back in submission order, one per envelope.
    #[instrument(skip_all, fields(tasks = envelopes.len()))]
    pub async fn execute_batch(
        &self,
        envelopes: Vec<TaskEnvelope>,
        max_concurrent: Option<usize>,
    ) -> Result<Vec<TaskResult>, OrchestratorError> {
        ensure_unique_ids(&envelopes)?;
        let evicted = self.workspaces.evict_stale().await;
        if evicted > 0 {
            debug!(evicted, "evicted stale workspaces before batch");
        }

        let limit = max_concurrent.unwrap_or_else(|| self.default_concurrency()).max(1);
        info!(limit, mode = %self.settings.mode, "starting batch");
        let slots = Arc::new(Semaphore::new(limit));

        let mut ordered: Vec<(usize, TaskEnvelope)> = envelopes.into_iter().enumerate().collect();
        ordered.sort_by_key(|(_, envelope)| envelope.priority);

        let mut set = JoinSet::new();
        for (index, envelope) in ordered {
            // Acquire before spawning so tasks start strictly in priority order.
            let permit = Arc::clone(&slots).acquire_owned().await.ok();
            let this = self.clone();
            set.spawn(async move {
                let _permit = permit;
                let pending = envelope.clone();
                let inner = this.clone();
                match tokio::spawn(async move { inner.execute_one(envelope).await }).await {
                    Ok(result) => (index, result),
                    Err(err) => (index, this.panicked(&pending, &err.to_string())),
                }
            });
        }

        let mut results: Vec<(usize, TaskResult)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(err) => warn!(err = %err, "batch worker failed"),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// Run envelopes one at a time in the given order.
    ///
    /// A task runs only if each of its prerequisites already completed;
    /// otherwise it is skipped. Failures do not stop later tasks.
    #[instrument(skip_all, fields(tasks = envelopes.len()))]
    pub async fn execute_workflow(
        &self,
        envelopes: Vec<TaskEnvelope>,
    ) -> Result<Vec<TaskResult>, OrchestratorError> {
        ensure_unique_ids(&envelopes)?;
        self.workspaces.evict_stale().await;

        let mut completed: HashSet<String> = HashSet::new();
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let unmet: Vec<&str> = envelope
                .prerequisites
                .iter()
                .filter(|id| !completed.contains(id.as_str()))
                .map(String::as_str)
                .collect();
            let result = if unmet.is_empty() {
                self.execute_one(envelope).await
            } else {
                info!(task_id = %envelope.task_id, unmet = ?unmet, "skipping task");
                self.skipped(&envelope, &unmet)
            };
            if result.is_success() {
                completed.insert(result.task_id.clone());
            }
            results.push(result);
        }
        Ok(results)
    }
}

fn ensure_unique_ids(envelopes: &[TaskEnvelope]) -> Result<(), OrchestratorError> {
    let mut seen = HashSet::new();
    for envelope in envelopes {
        if !seen.insert(envelope.task_id.as_str()) {
            return Err(OrchestratorError::InvalidEnvelope(format!(
                "duplicate task_id {}",
                envelope.task_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Priority;
    use crate::io::audit_log::read_audit_log;
    use crate::pool::environment::EnvironmentPoolSettings;
    use crate::pool::workspace::WorkspacePoolSettings;
    use crate::test_support::{FakeEnvironments, FakeWorkspaces, ScriptedRunner, Step, envelope};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        runner: Arc<ScriptedRunner>,
        workspaces: Arc<WorkspacePool<FakeWorkspaces>>,
        environments: Arc<EnvironmentPool<FakeEnvironments>>,
        scheduler: Scheduler<FakeWorkspaces, FakeEnvironments>,
        audit_path: PathBuf,
    }

    fn harness(mode: RiskMode, capacity: usize) -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(ScriptedRunner::new());
        let workspaces = Arc::new(WorkspacePool::new(
            FakeWorkspaces::default(),
            WorkspacePoolSettings {
                capacity,
                allocation_wait: Duration::from_secs(5),
                ttl: Duration::from_secs(600),
                init_parallelism: 2,
            },
        ));
        let environments = Arc::new(EnvironmentPool::new(
            FakeEnvironments::default(),
            EnvironmentPoolSettings {
                root: temp.path().join("envs"),
                max_environments: 4,
                wait: Duration::from_secs(1),
            },
        ));
        let run_paths = RunPaths::new(temp.path(), "run-test");
        let audit = Arc::new(AuditLog::open(&run_paths.audit_path).expect("audit"));
        let scheduler = Scheduler::new(
            Arc::clone(&workspaces),
            Some(Arc::clone(&environments)),
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
            audit,
            SchedulerSettings {
                mode,
                run_paths: run_paths.clone(),
                kill_grace: Duration::from_millis(100),
                output_limit_bytes: 10_000,
            },
        );
        Harness {
            audit_path: run_paths.audit_path,
            _temp: temp,
            runner,
            workspaces,
            environments,
            scheduler,
        }
    }

    struct AlwaysYes;

    impl Approver for AlwaysYes {
        fn confirm(&self, _: &TaskEnvelope, _: f64, _: RiskMode) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn successful_task_records_provenance() {
        let h = harness(RiskMode::Autonomous, 2);
        h.runner.script("a", vec![Step::ok_with("summary", json!("done"))]);
        let mut env = envelope("a", Priority::Medium);
        env.expected_outputs = vec!["summary".into()];

        let result = h.scheduler.execute_one(env.clone()).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.outputs["summary"], json!("done"));
        assert_eq!(result.provenance.input_hash, content_hash(&env).expect("hash"));
        assert!(result.provenance.output_hash.is_some());
        assert!(result.provenance.workspace_id.is_some());
        assert_eq!(result.provenance.retry_count, 0);
        assert_eq!(h.workspaces.status().in_use, 0);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let h = harness(RiskMode::Autonomous, 1);
        h.runner.script(
            "flaky",
            vec![Step::Fail("boom".into()), Step::Fail("boom".into()), Step::ok()],
        );
        let mut env = envelope("flaky", Priority::Medium);
        env.retry_policy.max_retries = 3;

        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.provenance.retry_count, 2);
        assert_eq!(h.runner.attempts("flaky"), 3);
        // Two resets between attempts, one on release.
        assert_eq!(h.workspaces.backend().reset_count(), 3);

        let statuses: Vec<TaskStatus> = read_audit_log(&h.audit_path)
            .expect("audit")
            .into_iter()
            .map(|entry| entry.to)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Pending,
                TaskStatus::InProgress,
                TaskStatus::Retrying,
                TaskStatus::InProgress,
                TaskStatus::Retrying,
                TaskStatus::InProgress,
                TaskStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_last_error() {
        let h = harness(RiskMode::Autonomous, 1);
        h.runner.always("doomed", Step::Fail("still broken".into()));
        let mut env = envelope("doomed", Priority::Medium);
        env.retry_policy.max_retries = 2;

        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::ExecutionFailure));
        assert!(result.error_message.expect("message").contains("still broken"));
        assert_eq!(result.provenance.retry_count, 2);
        assert!(result.provenance.output_hash.is_none());
    }

    #[tokio::test]
    async fn timeout_is_terminal_by_default() {
        let h = harness(RiskMode::Autonomous, 1);
        h.runner.always("slow", Step::Hang);
        let mut env = envelope("slow", Priority::Medium);
        env.timeout_seconds = 1;
        env.retry_policy.max_retries = 2;

        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Timeout);
        assert_eq!(result.error_kind, Some(ErrorKind::ExecutionTimeout));
        assert_eq!(h.runner.attempts("slow"), 1);
        assert_eq!(h.workspaces.status().in_use, 0);
    }

    #[tokio::test]
    async fn conservative_mode_rejects_without_running() {
        let h = harness(RiskMode::Conservative, 1);
        let env = TaskEnvelope {
            timeout_seconds: 5,
            ..TaskEnvelope::new("wipe", "delete the production database")
        };

        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::RiskRejected));
        assert!(
            result
                .error_message
                .expect("message")
                .contains("manual confirmation required")
        );
        assert_eq!(h.runner.attempts("wipe"), 0);
        assert!(result.provenance.workspace_id.is_none());
    }

    #[tokio::test]
    async fn approver_can_confirm_risky_task() {
        let h = harness(RiskMode::Conservative, 1);
        let scheduler = h.scheduler.clone().with_approver(Arc::new(AlwaysYes));
        let env = TaskEnvelope {
            timeout_seconds: 5,
            ..TaskEnvelope::new("wipe", "delete the production database")
        };
        let result = scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn envelope_cannot_loosen_the_gate() {
        let h = harness(RiskMode::Conservative, 1);
        let mut env = TaskEnvelope::new("wipe", "delete the production database");
        env.constraints.risk_mode = Some(RiskMode::Autonomous);
        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.error_kind, Some(ErrorKind::RiskRejected));

        let h = harness(RiskMode::Autonomous, 1);
        let mut env = envelope("docs", Priority::Medium);
        env.constraints.auto_approve = Some(false);
        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.error_kind, Some(ErrorKind::RiskRejected));
    }

    #[tokio::test]
    async fn invalid_envelope_fails_fast() {
        let h = harness(RiskMode::Autonomous, 1);
        let mut env = envelope("bad", Priority::Medium);
        env.timeout_seconds = 0;
        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidEnvelope));
    }

    #[tokio::test]
    async fn shared_environment_is_reused_across_tasks() {
        let h = harness(RiskMode::Autonomous, 2);
        let mut a = envelope("a", Priority::Medium);
        a.dependencies = vec!["requests".into(), "pytest".into()];
        let mut b = envelope("b", Priority::Medium);
        b.dependencies = vec!["pytest".into(), "requests".into()];

        let results = h
            .scheduler
            .execute_batch(vec![a, b], Some(2))
            .await
            .expect("batch");
        assert!(results.iter().all(TaskResult::is_success));
        assert_eq!(
            results[0].provenance.environment_id,
            results[1].provenance.environment_id
        );
        assert_eq!(h.environments.backend().provision_count(), 1);
        assert_eq!(h.environments.status().active, 0);
    }

    #[tokio::test]
    async fn provisioning_failure_falls_back_to_private_environment() {
        let h = harness(RiskMode::Autonomous, 1);
        h.environments.backend().fail_provisions(1);
        let mut env = envelope("a", Priority::Medium);
        env.dependencies = vec!["numpy".into()];

        let result = h.scheduler.execute_one(env).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.provenance.environment_id.as_deref(), Some("private:a"));
    }

    #[tokio::test]
    async fn batch_rejects_duplicate_ids() {
        let h = harness(RiskMode::Autonomous, 1);
        let err = h
            .scheduler
            .execute_batch(
                vec![envelope("a", Priority::High), envelope("a", Priority::Low)],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidEnvelope(_)));
    }

    #[tokio::test]
    async fn panicking_runner_yields_failed_result() {
        let h = harness(RiskMode::Autonomous, 1);
        h.runner.script("boom", vec![Step::Panic]);
        let results = h
            .scheduler
            .execute_batch(vec![envelope("boom", Priority::Medium)], Some(1))
            .await
            .expect("batch");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].error_kind, Some(ErrorKind::ExecutionFailure));
        assert_eq!(h.workspaces.status().in_use, 0);
    }
}
