//! Pool managers for workspaces and interpreter environments.
//!
//! Both pools are explicit objects built once by the entry point and shared
//! with the scheduler behind an `Arc`. They are generic over a backend trait so
//! tests can substitute in-memory fakes for git and the interpreter.

pub mod environment;
pub mod workspace;
