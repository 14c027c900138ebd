//! Prune subsystem: per-policy run retention and global reset (spec
//! Section 4.8).

use std::collections::HashSet;
use std::path::Path;

use chrono::{Duration, Utc};
use norma_core::types::RunStatus;
use thiserror::Error;
use tracing::{info, warn};

use crate::git::{self, GitError};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum PruneError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retention policy for `PruneRuns`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    pub keep_last: u32,
    pub keep_days: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneRunsResult {
    pub considered: u32,
    pub kept: u32,
    pub deleted: u32,
    pub skipped: u32,
}

/// `PruneRuns(policy, dry_run)`: scans runs newest-first and deletes every
/// run not covered by the retention policy.
pub async fn prune_runs(
    storage: &Storage,
    policy: RetentionPolicy,
    dry_run: bool,
) -> Result<PruneRunsResult, PruneError> {
    let runs = storage.list_runs().await?;
    let mut result = PruneRunsResult {
        considered: runs.len() as u32,
        ..Default::default()
    };

    if policy.keep_last == 0 && policy.keep_days == 0 {
        result.kept = result.considered;
        return Ok(result);
    }

    let cutoff = Utc::now() - Duration::days(i64::from(policy.keep_days));

    for (rank, run) in runs.iter().enumerate() {
        let keep = run.status == RunStatus::Running
            || (rank as u32) < policy.keep_last
            || run.created_at > cutoff;

        if keep {
            result.kept += 1;
            continue;
        }

        if dry_run {
            result.deleted += 1;
            continue;
        }

        if let Err(e) = std::fs::remove_dir_all(&run.run_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run_id = %run.run_id, error = %e, "failed to remove run directory");
                result.skipped += 1;
                continue;
            }
        }
        storage.delete_run(&run.run_id).await?;
        result.deleted += 1;
    }

    info!(
        considered = result.considered,
        kept = result.kept,
        deleted = result.deleted,
        skipped = result.skipped,
        dry_run,
        "prune-runs finished"
    );
    Ok(result)
}

/// `Prune(repoRoot)`: global reset. Removes every worktree and branch
/// rooted under `.norma/runs/`, wipes the runs tree, and truncates the
/// store, while preserving worktrees/branches that live elsewhere.
pub async fn prune_all(repo_root: &Path, norma_dir: &Path, storage: &Storage) -> Result<(), PruneError> {
    git::prune_worktrees(repo_root)?;

    let runs_root = norma_dir.join("runs");
    let worktrees = git::list_worktrees(repo_root)?;

    let mut removed_branches = Vec::new();
    let mut surviving_branches = HashSet::new();
    for worktree in &worktrees {
        if worktree.path.starts_with(&runs_root) {
            git::remove_worktree(repo_root, &worktree.path)?;
            if let Some(branch) = &worktree.branch {
                removed_branches.push(branch.clone());
            }
        } else if let Some(branch) = &worktree.branch {
            surviving_branches.insert(branch.clone());
        }
    }

    if runs_root.exists() {
        std::fs::remove_dir_all(&runs_root)?;
    }

    storage.truncate_all().await?;

    for branch in removed_branches {
        if surviving_branches.contains(&branch) {
            continue;
        }
        if let Err(e) = git::delete_branch(repo_root, &branch) {
            warn!(branch, error = %e, "failed to delete orphaned task branch");
        }
    }

    info!(repo_root = %repo_root.display(), "prune reset finished");
    Ok(())
}
