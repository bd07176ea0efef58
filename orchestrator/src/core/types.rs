//! Task envelope, result, and provenance types.
//!
//! These are the stable contracts between the scheduler, the pools, and the
//! aggregator. They carry no behavior beyond validation and small accessors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::risk::RiskMode;
use crate::error::OrchestratorError;

/// Logical role of the worker requested by an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    CodeGenerator,
    CodeReviewer,
    Tester,
    Documenter,
    Debugger,
    Refactorer,
    #[default]
    Custom,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeGenerator => "code_generator",
            Self::CodeReviewer => "code_reviewer",
            Self::Tester => "tester",
            Self::Documenter => "documenter",
            Self::Debugger => "debugger",
            Self::Refactorer => "refactorer",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start priority within a batch. Ordering follows declaration: `High < Medium < Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// Per-task retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,
    /// Timeouts are terminal unless this is set.
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 1.0,
            backoff_cap_secs: 60.0,
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(self.backoff_base_secs > 0.0) {
            return Err(OrchestratorError::InvalidEnvelope(
                "retry_policy.backoff_base_secs must be > 0".to_string(),
            ));
        }
        if !(self.backoff_cap_secs >= self.backoff_base_secs) {
            return Err(OrchestratorError::InvalidEnvelope(
                "retry_policy.backoff_cap_secs must be >= backoff_base_secs".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Bytes of backend stdout/stderr kept per attempt.
    pub output_limit_bytes: Option<usize>,
}

/// Caller-supplied execution constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Requested risk mode. The scheduler uses the stricter of this and its own mode.
    pub risk_mode: Option<RiskMode>,
    /// `Some(false)` forces manual confirmation; it can never loosen the gate.
    pub auto_approve: Option<bool>,
    pub limits: ResourceLimits,
}

/// The unit of work submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub agent_type: AgentType,
    /// Human-readable intent; the only input to risk assessment.
    pub description: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub constraints: Constraints,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub priority: Priority,
    /// Interpreter packages this task needs in a shared environment.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Task ids that must be `Completed` before this task runs in a workflow.
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl TaskEnvelope {
    /// Envelope with default settings; `agent_name` mirrors `task_id`.
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            agent_name: task_id.clone(),
            task_id,
            agent_type: AgentType::default(),
            description: description.into(),
            inputs: BTreeMap::new(),
            expected_outputs: Vec::new(),
            constraints: Constraints::default(),
            timeout_seconds: 300,
            retry_policy: RetryPolicy::default(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            prerequisites: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Prompt fed to the backend: `inputs.prompt` when present, else the description.
    pub fn prompt(&self) -> &str {
        self.inputs
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or(&self.description)
    }

    /// Optional ref the workspace should be reset to before the first attempt.
    pub fn base_branch(&self) -> Option<&str> {
        self.inputs
            .get("base_branch")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.task_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidEnvelope(
                "task_id must be non-empty".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(OrchestratorError::InvalidEnvelope(format!(
                "task {}: timeout_seconds must be > 0",
                self.task_id
            )));
        }
        self.retry_policy.validate()
    }
}

/// Per-task state machine. `Retrying` loops back to `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Timeout,
    /// Not executed because a declared prerequisite did not complete.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped: unmet dependency",
        };
        f.write_str(label)
    }
}

/// Stable classification of why a task did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AllocationTimeout,
    ProvisioningFailure,
    RiskRejected,
    ExecutionFailure,
    ExecutionTimeout,
    AggregationError,
    InvalidEnvelope,
    UnmetDependency,
}

/// Audit metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceInfo {
    /// SHA-256 of the canonical JSON of the envelope.
    pub input_hash: String,
    /// SHA-256 of the canonical JSON of the outputs (absent when nothing ran to completion).
    pub output_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub workspace_id: Option<String>,
    pub branch_name: Option<String>,
    pub environment_id: Option<String>,
    /// Retries actually consumed (attempts - 1).
    pub retry_count: u32,
}

/// Terminal outcome of one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_name: String,
    pub agent_type: AgentType,
    pub status: TaskStatus,
    pub outputs: BTreeMap<String, Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub execution_time_seconds: f64,
    pub provenance: ProvenanceInfo,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
