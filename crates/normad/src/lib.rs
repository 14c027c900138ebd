//! normad - PDCA orchestrator runtime.
//!
//! Library components for the `norma` binary: the run store, run lock,
//! git worktree service, task tracker, agent invoker, step executor,
//! iteration controller, run lifecycle, and prune subsystem.

pub mod controller;
pub mod executor;
pub mod git;
pub mod invoker;
pub mod lifecycle;
pub mod lock;
pub mod prune;
pub mod storage;
pub mod tracker;

pub use lifecycle::RunResult;
pub use lock::RunLock;
pub use storage::Storage;
pub use tracker::{FileTaskTracker, TaskTracker};

/// Top-level result type for `main.rs` and anything driving a full run,
/// matching the teacher's `AppResult` idiom.
pub type AppResult<T> = eyre::Result<T>;
