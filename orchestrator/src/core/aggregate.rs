//! Reduction of task results into a run summary.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{AgentType, ErrorKind, TaskResult, TaskStatus};
use crate::error::OrchestratorError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
}

impl StatusCounts {
    fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Completed => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Timeout => self.timed_out += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Retrying => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub task_id: String,
    pub status: TaskStatus,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub total_execution_time_seconds: f64,
    /// Mean over tasks that actually ran (skipped tasks excluded).
    pub average_execution_time_seconds: f64,
    pub success_rate: f64,
    pub by_agent_type: BTreeMap<AgentType, StatusCounts>,
    pub errors: Vec<ErrorDescriptor>,
}

/// Summarize `results`.
///
/// Inputs are only read, so the same slice always yields the same summary.
/// Non-terminal statuses and duplicated task ids are rejected.
pub fn aggregate(results: &[TaskResult]) -> Result<RunSummary, OrchestratorError> {
    let mut seen = HashSet::new();
    let mut summary = RunSummary::default();
    let mut ran = 0usize;

    for result in results {
        if !result.status.is_terminal() {
            return Err(OrchestratorError::AggregationError(format!(
                "task {} has non-terminal status {}",
                result.task_id, result.status
            )));
        }
        if !seen.insert(result.task_id.as_str()) {
            return Err(OrchestratorError::AggregationError(format!(
                "task {} reported more than once",
                result.task_id
            )));
        }

        summary.counts.record(result.status);
        summary
            .by_agent_type
            .entry(result.agent_type)
            .or_default()
            .record(result.status);

        if result.status != TaskStatus::Skipped {
            ran += 1;
            summary.total_execution_time_seconds += result.execution_time_seconds;
        }

        if !result.is_success() {
            summary.errors.push(ErrorDescriptor {
                task_id: result.task_id.clone(),
                status: result.status,
                kind: result.error_kind,
                message: result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| result.status.to_string()),
            });
        }
    }

    if ran > 0 {
        summary.average_execution_time_seconds = summary.total_execution_time_seconds / ran as f64;
    }
    if summary.counts.total > 0 {
        summary.success_rate = summary.counts.succeeded as f64 / summary.counts.total as f64;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProvenanceInfo;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn result(id: &str, agent_type: AgentType, status: TaskStatus, secs: f64) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: id.to_string(),
            agent_name: id.to_string(),
            agent_type,
            status,
            outputs: BTreeMap::new(),
            error_kind: (status == TaskStatus::Failed).then_some(ErrorKind::ExecutionFailure),
            error_message: (status == TaskStatus::Failed).then(|| "exit 1".to_string()),
            execution_time_seconds: secs,
            provenance: ProvenanceInfo {
                input_hash: String::new(),
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

    #[test]
    fn counts_and_groups_by_agent_type() {
        let results = vec![
            result("a", AgentType::Tester, TaskStatus::Completed, 2.0),
            result("b", AgentType::Tester, TaskStatus::Failed, 4.0),
            result("c", AgentType::Documenter, TaskStatus::Timeout, 6.0),
            result("d", AgentType::Documenter, TaskStatus::Skipped, 0.0),
        ];
        let summary = aggregate(&results).expect("aggregate");

        assert_eq!(summary.counts.total, 4);
        assert_eq!(summary.counts.succeeded, 1);
        assert_eq!(summary.counts.failed, 1);
        assert_eq!(summary.counts.timed_out, 1);
        assert_eq!(summary.counts.skipped, 1);
        assert_eq!(summary.total_execution_time_seconds, 12.0);
        assert_eq!(summary.average_execution_time_seconds, 4.0);
        assert_eq!(summary.success_rate, 0.25);
        assert_eq!(summary.by_agent_type[&AgentType::Tester].failed, 1);
        assert_eq!(summary.errors.len(), 3);
        assert_eq!(summary.errors[0].kind, Some(ErrorKind::ExecutionFailure));
        assert_eq!(summary.errors[1].message, "timeout");
    }

    #[test]
    fn aggregation_is_repeatable() {
        let results = vec![
            result("a", AgentType::Custom, TaskStatus::Completed, 1.0),
            result("b", AgentType::Custom, TaskStatus::Failed, 1.0),
        ];
        let before = results.clone();
        let first = aggregate(&results).expect("aggregate");
        let second = aggregate(&results).expect("aggregate");
        assert_eq!(first, second);
        assert_eq!(results, before);
    }

    #[test]
    fn rejects_non_terminal_and_duplicates() {
        let pending = vec![result("a", AgentType::Custom, TaskStatus::Retrying, 0.0)];
        assert!(matches!(
            aggregate(&pending),
            Err(OrchestratorError::AggregationError(_))
        ));

        let dup = vec![
            result("a", AgentType::Custom, TaskStatus::Completed, 0.0),
            result("a", AgentType::Custom, TaskStatus::Completed, 0.0),
        ];
        assert!(aggregate(&dup).is_err());
    }

    #[test]
    fn empty_input_yields_zeroes() {
        let summary = aggregate(&[]).expect("aggregate");
        assert_eq!(summary.counts.total, 0);
        assert_eq!(summary.success_rate, 0.0);
    }
}
