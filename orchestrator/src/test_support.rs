//! Test-only fakes and fixtures: scripted task runner, in-memory pool
//! backends, throwaway git repositories, and envelope builders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::types::{Priority, TaskEnvelope};
use crate::error::OrchestratorError;
use crate::io::task_runner::{TaskOutputs, TaskRequest, TaskRunner};
use crate::io::venv::dir_size;
use crate::pool::environment::EnvironmentBackend;
use crate::pool::workspace::{CreatedWorkspace, WorkspaceBackend};

/// Envelope with a short timeout and fast backoff, suitable for scheduler tests.
pub fn envelope(task_id: &str, priority: Priority) -> TaskEnvelope {
    let mut env = TaskEnvelope::new(task_id, format!("write docs for {task_id}"));
    env.priority = priority;
    env.timeout_seconds = 5;
    env.retry_policy.max_retries = 0;
    env.retry_policy.backoff_base_secs = 0.01;
    env.retry_policy.backoff_cap_secs = 0.02;
    env
}

/// Create a git repository with one commit on `main`.
pub fn init_git_repo(path: &Path) -> PathBuf {
    fs::create_dir_all(path).expect("create repo dir");
    let git = |args: &[&str]| {
        let out = Command::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    };
    git(&["init", "-q"]);
    git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&["config", "user.name", "Orchestrator Test"]);
    git(&["config", "user.email", "orchestrator-test@local.invalid"]);
    git(&["config", "commit.gpgsign", "false"]);
    fs::write(path.join("README.md"), "# fixture\n").expect("write readme");
    git(&["add", "."]);
    git(&["commit", "-q", "-m", "initial"]);
    path.to_path_buf()
}

/// What a scripted attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(TaskOutputs),
    Fail(String),
    /// Block until the scheduler cancels the attempt.
    Hang,
    Panic,
}

impl Step {
    pub fn ok() -> Self {
        Step::Succeed(TaskOutputs::new())
    }

    pub fn ok_with(key: &str, value: Value) -> Self {
        let mut outputs = TaskOutputs::new();
        outputs.insert(key.to_string(), value);
        Step::Succeed(outputs)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerCall {
    pub task_id: String,
    pub attempt: u32,
    pub workdir: PathBuf,
    pub environment_id: Option<String>,
}

/// Task runner that follows per-task scripts. Unscripted attempts succeed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    repeat: Mutex<HashMap<String, Step>>,
    calls: Mutex<Vec<RunnerCall>>,
    busy: Mutex<HashSet<PathBuf>>,
    overlap: Mutex<bool>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt sleeps this long before acting.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Queue steps for successive attempts of `task_id`.
    pub fn script(&self, task_id: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(task_id.to_string(), steps.into());
    }

    /// Run `step` on every attempt of `task_id`.
    pub fn always(&self, task_id: &str, step: Step) {
        self.repeat
            .lock()
            .expect("repeat lock")
            .insert(task_id.to_string(), step);
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn attempts(&self, task_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.task_id == task_id)
            .count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// True if two attempts ever ran in the same workspace at the same time.
    pub fn saw_shared_workspace(&self) -> bool {
        *self.overlap.lock().expect("overlap lock")
    }

    fn next_step(&self, task_id: &str) -> Step {
        if let Some(step) = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(task_id)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        self.repeat
            .lock()
            .expect("repeat lock")
            .get(task_id)
            .cloned()
            .unwrap_or_else(Step::ok)
    }
}

impl TaskRunner for ScriptedRunner {
    fn run(&self, request: &TaskRequest) -> Result<TaskOutputs, OrchestratorError> {
        let task_id = request.envelope.task_id.clone();
        self.calls.lock().expect("calls lock").push(RunnerCall {
            task_id: task_id.clone(),
            attempt: request.attempt,
            workdir: request.workdir.clone(),
            environment_id: request.environment.as_ref().map(|env| env.id.clone()),
        });
        if !self
            .busy
            .lock()
            .expect("busy lock")
            .insert(request.workdir.clone())
        {
            *self.overlap.lock().expect("overlap lock") = true;
        }
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        std::thread::sleep(self.delay);
        let step = self.next_step(&task_id);
        let result = match step {
            Step::Succeed(outputs) => Ok(outputs),
            Step::Fail(message) => Err(OrchestratorError::ExecutionFailure(message)),
            Step::Hang => {
                let give_up = Instant::now() + Duration::from_secs(30);
                while !request.cancel.is_cancelled() && Instant::now() < give_up {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(OrchestratorError::ExecutionTimeout(request.timeout))
            }
            Step::Panic => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.busy.lock().expect("busy lock").remove(&request.workdir);
                panic!("scripted panic for {task_id}");
            }
        };

        self.busy.lock().expect("busy lock").remove(&request.workdir);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Workspace backend backed by plain directories in a temp dir.
#[derive(Debug)]
pub struct FakeWorkspaces {
    root: Arc<TempDir>,
    creates: AtomicUsize,
    resets: AtomicUsize,
    fail_creates: AtomicUsize,
    fail_resets: AtomicUsize,
}

impl Default for FakeWorkspaces {
    fn default() -> Self {
        Self {
            root: Arc::new(tempfile::tempdir().expect("tempdir")),
            creates: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            fail_creates: AtomicUsize::new(0),
            fail_resets: AtomicUsize::new(0),
        }
    }
}

impl FakeWorkspaces {
    /// Fail the next `n` creations.
    pub fn fail_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` resets.
    pub fn fail_resets(&self, n: usize) {
        self.fail_resets.store(n, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl WorkspaceBackend for FakeWorkspaces {
    fn create(&self, slot: usize) -> Result<CreatedWorkspace> {
        if take_failure(&self.fail_creates) {
            return Err(anyhow!("scripted create failure for slot {slot}"));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("ws-{slot:02}");
        let path = self.root.path().join(&id);
        fs::create_dir_all(&path)?;
        Ok(CreatedWorkspace {
            branch: format!("fake/{id}"),
            id,
            path,
        })
    }

    fn reset(&self, path: &Path, _target: Option<&str>) -> Result<()> {
        if take_failure(&self.fail_resets) {
            return Err(anyhow!("scripted reset failure for {}", path.display()));
        }
        self.resets.fetch_add(1, Ordering::SeqCst);
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn destroy(&self, path: &Path, _branch: &str) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

/// Environment backend that only creates directories.
#[derive(Debug, Default)]
pub struct FakeEnvironments {
    provisions: AtomicUsize,
    fail_provisions: AtomicUsize,
}

impl FakeEnvironments {
    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Fail the next `n` provisionings.
    pub fn fail_provisions(&self, n: usize) {
        self.fail_provisions.store(n, Ordering::SeqCst);
    }
}

impl EnvironmentBackend for FakeEnvironments {
    fn provision(&self, path: &Path, packages: &[String]) -> Result<()> {
        if take_failure(&self.fail_provisions) {
            return Err(anyhow!("scripted provisioning failure"));
        }
        self.provisions.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(path.join("bin"))?;
        fs::write(path.join("requirements.txt"), packages.join("\n"))?;
        Ok(())
    }

    fn destroy(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn size_bytes(&self, path: &Path) -> u64 {
        dir_size(path)
    }
}
