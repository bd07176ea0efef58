//! Task execution backends.
//!
//! The [`TaskRunner`] trait decouples the scheduler from the backend that
//! actually performs a task (currently an agent CLI). Tests use scripted runners
//! that return predetermined outcomes without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::TaskEnvelope;
use crate::error::OrchestratorError;
use crate::io::config::BackendConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Name of the envelope file written into the workspace before each attempt.
pub const ENVELOPE_FILE: &str = "task_envelope.json";

/// Set by the scheduler when an attempt overran its timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared environment exposed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentContext {
    pub id: String,
    pub path: PathBuf,
}

/// Parameters for one attempt.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub envelope: Arc<TaskEnvelope>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub workdir: PathBuf,
    pub environment: Option<EnvironmentContext>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub log_path: PathBuf,
    pub cancel: CancelFlag,
}

pub type TaskOutputs = BTreeMap<String, Value>;

/// Abstraction over task backends.
///
/// Implementations block; the scheduler calls them from a blocking thread.
/// Returns `ExecutionFailure` or `ExecutionTimeout` when the attempt did not succeed.
pub trait TaskRunner: Send + Sync {
    fn run(&self, request: &TaskRequest) -> Result<TaskOutputs, OrchestratorError>;
}

/// Runner that pipes the prompt into an agent CLI inside the workspace.
#[derive(Debug, Clone)]
pub struct AgentCliRunner {
    backend: BackendConfig,
}

impl AgentCliRunner {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }

    fn build_command(&self, request: &TaskRequest, envelope_path: &Path) -> Command {
        let (program, base_args) = match self.backend.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("claude", &[][..]),
        };
        let mut cmd = Command::new(program);
        cmd.args(base_args);

        let tools = allowed_tools(&request.envelope);
        if !tools.is_empty() {
            cmd.arg(&self.backend.allowed_tools_flag).arg(tools.join(","));
        }

        cmd.current_dir(&request.workdir)
            .env("ORCHESTRATOR_TASK_ID", &request.envelope.task_id)
            .env("ORCHESTRATOR_ENVELOPE", envelope_path);

        if let Some(env) = &request.environment {
            let bin = env.path.join("bin");
            let path = match std::env::var_os("PATH") {
                Some(existing) => {
                    let mut paths = vec![bin];
                    paths.extend(std::env::split_paths(&existing));
                    std::env::join_paths(paths).unwrap_or(existing)
                }
                None => bin.into_os_string(),
            };
            cmd.env("VIRTUAL_ENV", &env.path).env("PATH", path);
        }
        cmd
    }
}

impl TaskRunner for AgentCliRunner {
    #[instrument(skip_all, fields(task_id = %request.envelope.task_id, attempt = request.attempt))]
    fn run(&self, request: &TaskRequest) -> Result<TaskOutputs, OrchestratorError> {
        info!(workdir = %request.workdir.display(), "starting backend");

        let envelope_path = write_envelope(&request.workdir, &request.envelope)
            .map_err(|err| OrchestratorError::ExecutionFailure(format!("{err:#}")))?;
        let cmd = self.build_command(request, &envelope_path);

        let output = run_command_with_timeout(
            cmd,
            Some(request.envelope.prompt().as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .map_err(|err| OrchestratorError::ExecutionFailure(format!("{err:#}")))?;

        if let Err(err) = write_attempt_log(&request.log_path, &output, request.output_limit_bytes)
        {
            warn!(err = %format!("{err:#}"), "failed to write attempt log");
        }

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "backend timed out");
            return Err(OrchestratorError::ExecutionTimeout(request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "backend failed");
            let detail = output
                .stderr_tail()
                .map(|tail| format!(": {tail}"))
                .unwrap_or_default();
            return Err(OrchestratorError::ExecutionFailure(format!(
                "backend exited with status {:?}{detail}",
                output.status.code()
            )));
        }

        debug!("backend completed successfully");
        Ok(parse_outputs(&output.stdout_text()))
    }
}

fn allowed_tools(envelope: &TaskEnvelope) -> Vec<String> {
    envelope
        .inputs
        .get("allowed_tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Write the envelope into the workspace so the backend can read it.
pub fn write_envelope(workdir: &Path, envelope: &TaskEnvelope) -> Result<PathBuf> {
    let path = workdir.join(ENVELOPE_FILE);
    let mut buf = serde_json::to_string_pretty(envelope).context("serialize envelope")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// A JSON object on stdout becomes the outputs; anything else is kept as `stdout`.
pub fn parse_outputs(stdout: &str) -> TaskOutputs {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout.trim()) {
        return map.into_iter().collect();
    }
    let mut outputs = BTreeMap::new();
    outputs.insert("stdout".to_string(), Value::String(stdout.to_string()));
    outputs
}

pub fn write_attempt_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create attempt log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str(&format!("exit: {:?}\n", output.status.code()));
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    buf.push_str(&output.truncation_notice("backend"));
    if output.timed_out {
        buf.push_str("\n[backend timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write attempt log {}", path.display()));
    }

    fs::write(path, buf).with_context(|| format!("write attempt log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(workdir: &Path, envelope: TaskEnvelope) -> TaskRequest {
        TaskRequest {
            envelope: Arc::new(envelope),
            attempt: 1,
            workdir: workdir.to_path_buf(),
            environment: None,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            log_path: workdir.join("logs").join("attempt-1.log"),
            cancel: CancelFlag::default(),
        }
    }

    #[test]
    fn json_object_stdout_becomes_outputs() {
        let outputs = parse_outputs("{\"summary\": \"done\", \"files\": 2}\n");
        assert_eq!(outputs["summary"], json!("done"));
        assert_eq!(outputs["files"], json!(2));

        let outputs = parse_outputs("plain text");
        assert_eq!(outputs["stdout"], json!("plain text"));

        let outputs = parse_outputs("[1, 2]");
        assert_eq!(outputs["stdout"], json!("[1, 2]"));
    }

    #[test]
    fn allowed_tools_are_read_from_inputs() {
        let mut env = TaskEnvelope::new("t", "x");
        assert!(allowed_tools(&env).is_empty());
        env.inputs
            .insert("allowed_tools".to_string(), json!(["Read", "Edit"]));
        assert_eq!(allowed_tools(&env), vec!["Read", "Edit"]);
    }

    #[cfg(unix)]
    #[test]
    fn cli_runner_feeds_prompt_and_writes_envelope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = AgentCliRunner::new(BackendConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf '{\"prompt\":\"%s\",\"id\":\"%s\"}' \"$(cat)\" \"$ORCHESTRATOR_TASK_ID\"; test -f \"$ORCHESTRATOR_ENVELOPE\"".to_string(),
            ],
            allowed_tools_flag: "--allowedTools".to_string(),
        });
        let req = request(temp.path(), TaskEnvelope::new("t-1", "say hi"));

        let outputs = runner.run(&req).expect("run");
        assert_eq!(outputs["prompt"], json!("say hi"));
        assert_eq!(outputs["id"], json!("t-1"));
        assert!(temp.path().join(ENVELOPE_FILE).is_file());
        assert!(req.log_path.is_file());
    }

    #[cfg(unix)]
    #[test]
    fn cli_runner_maps_exit_and_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failing = AgentCliRunner::new(BackendConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo broken >&2; exit 2".to_string(),
            ],
            allowed_tools_flag: "--allowedTools".to_string(),
        });
        let req = request(temp.path(), TaskEnvelope::new("t-2", "x"));
        let err = failing.run(&req).unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionFailure(ref m) if m.contains("broken")));

        let hanging = AgentCliRunner::new(BackendConfig {
            command: vec!["sh".to_string(), "-c".to_string(), "exec sleep 5".to_string()],
            allowed_tools_flag: "--allowedTools".to_string(),
        });
        let mut req = request(temp.path(), TaskEnvelope::new("t-3", "x"));
        req.timeout = Duration::from_millis(200);
        let err = hanging.run(&req).unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionTimeout(_)));
    }

    #[cfg(unix)]
    #[test]
    fn cli_runner_reports_missing_program() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = AgentCliRunner::new(BackendConfig {
            command: vec!["definitely-not-a-real-backend-binary".to_string()],
            allowed_tools_flag: "--allowedTools".to_string(),
        });
        let err = runner
            .run(&request(temp.path(), TaskEnvelope::new("t-4", "x")))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ExecutionFailure(_)));
    }
}
