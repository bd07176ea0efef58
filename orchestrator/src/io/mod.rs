//! Side-effecting adapters: git, subprocesses, files, and task backends.
//!
//! Adapters return `anyhow::Result` with context; the pools and the scheduler
//! translate failures into [`crate::error::OrchestratorError`].

pub mod audit_log;
pub mod config;
pub mod git;
pub mod process;
pub mod report;
pub mod task_file;
pub mod task_runner;
pub mod venv;
pub mod worktrees;
