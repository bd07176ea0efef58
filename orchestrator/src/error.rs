//! Orchestration error taxonomy.
//!
//! Adapters in [`crate::io`] return `anyhow::Result`; the pools and the scheduler
//! convert those failures into an [`OrchestratorError`] so every per-task failure
//! can be recorded as a terminal [`crate::core::types::TaskResult`] with a stable
//! [`ErrorKind`].

use std::time::Duration;

use thiserror::Error;

use crate::core::risk::RiskMode;
use crate::core::types::ErrorKind;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No workspace or environment became free within the wait bound.
    #[error("timed out after {waited:?} waiting for a {resource}")]
    AllocationTimeout {
        resource: &'static str,
        waited: Duration,
    },

    /// A workspace or environment could not be created.
    #[error("provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("manual confirmation required (risk {risk:.2} in {mode} mode)")]
    RiskRejected { risk: f64, mode: RiskMode },

    /// The task body exited non-zero, could not be spawned, or panicked.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("malformed result: {0}")]
    AggregationError(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationTimeout { .. } => ErrorKind::AllocationTimeout,
            Self::ProvisioningFailure(_) => ErrorKind::ProvisioningFailure,
            Self::RiskRejected { .. } => ErrorKind::RiskRejected,
            Self::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            Self::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            Self::AggregationError(_) => ErrorKind::AggregationError,
            Self::InvalidEnvelope(_) => ErrorKind::InvalidEnvelope,
        }
    }

    /// Convert an adapter error into a provisioning failure, keeping the context chain.
    pub fn provisioning(err: &anyhow::Error) -> Self {
        Self::ProvisioningFailure(format!("{err:#}"))
    }
}
