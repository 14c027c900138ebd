//! Run lifecycle: acquire the run lock, allocate a run, drive the
//! iteration controller to a terminal status (spec Sections 4.1, 4.8).

use std::path::Path;

use eyre::{Context as _, Result};
use norma_core::types::RunStatus;
use tracing::info;

use crate::controller::Controller;
use crate::lock::RunLock;
use crate::storage::Storage;
use crate::tracker::TaskTracker;

pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub verdict: Option<String>,
}

/// `norma run <task_id>`: acquire the exclusive run lock, allocate a run ID
/// and directory, reconcile stale runs, then drive the controller.
pub async fn run(
    repo_root: &Path,
    norma_dir: &Path,
    config: &norma_core::Config,
    storage: &Storage,
    tracker: &dyn TaskTracker,
    task_id: &str,
) -> Result<RunResult> {
    if !norma_core::is_valid_task_id(task_id) {
        eyre::bail!("invalid task id: {task_id}");
    }

    let _lock = RunLock::acquire_blocking(norma_dir).context("failed to acquire run lock")?;

    reconcile_stale_runs(storage).await;

    let run_id = norma_core::new_run_id();
    let runs_dir = norma_dir.join("runs");
    let run_dir = runs_dir.join(&run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

    let task = tracker
        .task(task_id)
        .with_context(|| format!("failed to read task {task_id}"))?;

    storage
        .create_run(&run_id, task_id, &task.goal, &run_dir.display().to_string())
        .await
        .context("failed to create run row")?;

    tracker
        .set_run(task_id, &run_id)
        .unwrap_or_else(|e| tracing::warn!(error = %e, "failed to record run on task"));

    info!(run_id = %run_id, task_id, "run started");

    let controller = Controller {
        storage,
        tracker,
        config,
        repo_root,
        runs_dir: &runs_dir,
        run_id: run_id.clone(),
        task_id: task_id.to_string(),
    };

    let outcome = controller.run().await.context("iteration controller failed")?;

    info!(run_id = %run_id, status = ?outcome.status, "run finished");

    Ok(RunResult {
        run_id,
        status: outcome.status,
        verdict: outcome.verdict,
    })
}

/// Stale runs (left `running` by a crashed prior process) are permitted to
/// remain partially committed; each step commit is atomic, so the journal
/// and events stay consistent without explicit repair here.
async fn reconcile_stale_runs(_storage: &Storage) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_task_id_before_acquiring_anything() {
        assert!(!norma_core::is_valid_task_id("Task-123"));
    }
}
