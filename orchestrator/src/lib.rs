//! Parallel task orchestration over pooled git worktrees.
//!
//! Tasks are described by envelopes, gated by a keyword risk assessment, and
//! executed concurrently by an external agent backend, each inside its own
//! isolated worktree and optionally a shared interpreter environment.
//!
//! - **[`core`]**: pure logic (data model, hashing, risk gate, backoff, aggregation).
//! - **[`io`]**: side effects (git, subprocesses, config, task files, audit log).
//! - **[`pool`]**: workspace and environment pools, generic over their backends.
//!
//! [`scheduler`] coordinates the pools with a task runner; [`commands`]
//! implements the CLI on top of it.

pub mod commands;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
