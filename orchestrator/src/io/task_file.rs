//! Task input file (`{"tasks": [...]}`) loading and sample generation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::core::risk::RiskMode;
use crate::core::types::{AgentType, Constraints, Priority, RetryPolicy, TaskEnvelope};
use crate::io::config::OrchestratorConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    pub tasks: Vec<TaskSpec>,
}

/// One entry of the task file, as written by humans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Interpreter packages; tasks that declare none run without a shared environment.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Names of tasks that must complete first (workflow runs only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expected_outputs: Vec<String>,
}

impl TaskSpec {
    /// Text used for risk assessment: the description, else the prompt.
    pub fn intent(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.prompt
        } else {
            &self.description
        }
    }

    /// Build an envelope, applying the mode's timeout multiplier and default retry limit.
    pub fn to_envelope(&self, mode: RiskMode, config: &OrchestratorConfig) -> TaskEnvelope {
        let policy = mode.policy();
        let base_timeout = self.timeout_seconds.unwrap_or(config.default_timeout_secs);
        let timeout_seconds = (base_timeout as f64 * policy.timeout_multiplier).ceil() as u64;

        let mut inputs = BTreeMap::new();
        let prompt = if self.prompt.trim().is_empty() {
            self.description.clone()
        } else {
            self.prompt.clone()
        };
        inputs.insert("prompt".to_string(), Value::String(prompt));
        if !self.allowed_tools.is_empty() {
            inputs.insert("allowed_tools".to_string(), json!(self.allowed_tools));
        }
        if let Some(branch) = &self.base_branch {
            inputs.insert("base_branch".to_string(), Value::String(branch.clone()));
        }

        TaskEnvelope {
            task_id: self.name.trim().to_string(),
            agent_name: self.name.trim().to_string(),
            agent_type: self.agent_type.unwrap_or_default(),
            description: self.intent().to_string(),
            inputs,
            expected_outputs: self.expected_outputs.clone(),
            constraints: Constraints::default(),
            timeout_seconds,
            retry_policy: RetryPolicy {
                max_retries: self.max_retries.unwrap_or(policy.retry_limit),
                backoff_base_secs: config.backoff_base_secs,
                backoff_cap_secs: config.backoff_cap_secs,
                retry_on_timeout: false,
            },
            priority: self.priority.unwrap_or_default(),
            dependencies: self.dependencies.clone(),
            prerequisites: self
                .depends_on
                .iter()
                .map(|dep| dep.trim().to_string())
                .collect(),
        }
    }
}

pub fn read_task_file(path: &Path) -> Result<TaskFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: TaskFile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_task_file(&file).with_context(|| format!("invalid task file {}", path.display()))?;
    debug!(tasks = file.tasks.len(), "loaded task file");
    Ok(file)
}

/// Load a task file and convert every entry to an envelope.
pub fn load_envelopes(
    path: &Path,
    mode: RiskMode,
    config: &OrchestratorConfig,
) -> Result<Vec<TaskEnvelope>> {
    let file = read_task_file(path)?;
    Ok(file
        .tasks
        .iter()
        .map(|task| task.to_envelope(mode, config))
        .collect())
}

fn validate_task_file(file: &TaskFile) -> Result<()> {
    let mut names = HashSet::new();
    for (idx, task) in file.tasks.iter().enumerate() {
        let name = task.name.trim();
        if name.is_empty() {
            return Err(anyhow!("tasks[{idx}]: name must be non-empty"));
        }
        if !names.insert(name) {
            return Err(anyhow!("tasks[{idx}]: duplicate task name {name:?}"));
        }
        if task.intent().trim().is_empty() {
            return Err(anyhow!("task {name:?}: description or prompt is required"));
        }
        if task.timeout_seconds == Some(0) {
            return Err(anyhow!("task {name:?}: timeout_seconds must be > 0"));
        }
    }
    for task in &file.tasks {
        for dep in &task.depends_on {
            if !names.contains(dep.trim()) {
                return Err(anyhow!(
                    "task {:?}: depends_on references unknown task {dep:?}",
                    task.name
                ));
            }
        }
    }
    Ok(())
}

pub fn sample_task_file() -> TaskFile {
    let tools: Vec<String> = ["Read", "Write", "Edit", "Bash"]
        .iter()
        .map(|tool| tool.to_string())
        .collect();
    let task = |name: &str, description: &str, prompt: &str| TaskSpec {
        name: name.to_string(),
        description: description.to_string(),
        prompt: prompt.to_string(),
        allowed_tools: tools.clone(),
        base_branch: Some("main".to_string()),
        ..TaskSpec::default()
    };

    let mut tests = task(
        "tests",
        "Write tests",
        "Write comprehensive unit tests with 80% coverage",
    );
    tests.agent_type = Some(AgentType::Tester);
    tests.priority = Some(Priority::Low);
    tests.depends_on = vec!["feature-auth".to_string(), "feature-api".to_string()];

    let mut auth = task(
        "feature-auth",
        "Implement authentication",
        "Implement a user authentication system with JWT tokens",
    );
    auth.agent_type = Some(AgentType::CodeGenerator);
    auth.priority = Some(Priority::High);

    let mut api = task(
        "feature-api",
        "Create REST API",
        "Create REST API endpoints for user management",
    );
    api.agent_type = Some(AgentType::CodeGenerator);

    TaskFile {
        tasks: vec![auth, api, tests],
    }
}

/// Write the sample task file, refusing to overwrite an existing file.
pub fn write_sample_task_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow!("{} already exists", path.display()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf =
        serde_json::to_string_pretty(&sample_task_file()).context("serialize sample tasks")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("tasks.json");
        fs::write(&path, body).expect("write");
        path
    }

    #[test]
    fn sample_file_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        write_sample_task_file(&path).expect("write");
        let envs = load_envelopes(&path, RiskMode::Standard, &OrchestratorConfig::default())
            .expect("load");
        assert_eq!(envs.len(), 3);
        assert_eq!(envs[0].task_id, "feature-auth");
        assert_eq!(envs[0].base_branch(), Some("main"));
        assert_eq!(envs[2].prerequisites, vec!["feature-auth", "feature-api"]);
        assert!(write_sample_task_file(&path).is_err());
    }

    #[test]
    fn mode_scales_timeout_and_sets_retry_limit() {
        let spec = TaskSpec {
            name: "a".to_string(),
            prompt: "do a thing".to_string(),
            timeout_seconds: Some(100),
            ..TaskSpec::default()
        };
        let cfg = OrchestratorConfig::default();

        let env = spec.to_envelope(RiskMode::Aggressive, &cfg);
        assert_eq!(env.timeout_seconds, 150);
        assert_eq!(env.retry_policy.max_retries, 1);
        assert_eq!(env.description, "do a thing");
        assert_eq!(env.prompt(), "do a thing");

        let env = spec.to_envelope(RiskMode::Conservative, &cfg);
        assert_eq!(env.timeout_seconds, 100);
        assert_eq!(env.retry_policy.max_retries, 3);
    }

    #[test]
    fn explicit_retry_limit_wins() {
        let spec = TaskSpec {
            name: "a".to_string(),
            description: "x".to_string(),
            max_retries: Some(0),
            ..TaskSpec::default()
        };
        let env = spec.to_envelope(RiskMode::Conservative, &OrchestratorConfig::default());
        assert_eq!(env.retry_policy.max_retries, 0);
        assert_eq!(env.timeout_seconds, 300);
    }

    #[test]
    fn rejects_duplicate_names_and_unknown_dependencies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"tasks":[{"name":"a","prompt":"x"},{"name":"a","prompt":"y"}]}"#,
        );
        let err = read_task_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate task name"));

        let path = write(
            temp.path(),
            r#"{"tasks":[{"name":"a","prompt":"x","depends_on":["ghost"]}]}"#,
        );
        let err = read_task_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown task"));
    }

    #[test]
    fn prerequisites_match_trimmed_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(
            temp.path(),
            r#"{"tasks":[{"name":"a","prompt":"x"},{"name":"b","prompt":"y","depends_on":[" a "]}]}"#,
        );
        let envs =
            load_envelopes(&path, RiskMode::Standard, &OrchestratorConfig::default()).expect("load");
        assert_eq!(envs[1].prerequisites, vec![envs[0].task_id.clone()]);
    }

    #[test]
    fn rejects_tasks_without_intent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write(temp.path(), r#"{"tasks":[{"name":"a"}]}"#);
        assert!(read_task_file(&path).is_err());
    }
}
