//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; for `run`, every task completed.
pub const OK: i32 = 0;
/// At least one task did not complete, or the command failed (bad config, task file, repository).
pub const FAILED: i32 = 1;
/// `cleanup` removed some but not all pooled workspaces.
pub const PARTIAL: i32 = 2;
