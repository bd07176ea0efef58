//! Deterministic, pure logic shared by the orchestrator.
//!
//! Nothing here touches the filesystem, spawns processes, or sleeps. Randomness
//! (backoff jitter) is passed in by callers.

pub mod aggregate;
pub mod backoff;
pub mod hash;
pub mod risk;
pub mod types;
