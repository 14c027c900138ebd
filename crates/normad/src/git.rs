//! Git worktree service: mount/remove per-step worktrees, commit workspace
//! changes, and perform the final squash merge-back (spec Section 4.3).

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use norma_core::branch::{merge_commit_message, task_branch_name};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {args}: {source}")]
    Spawn { args: String, source: std::io::Error },
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
}

fn run(repo_root: &Path, args: &[&str]) -> Result<Output, GitError> {
    Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .output()
        .map_err(|e| GitError::Spawn {
            args: args.join(" "),
            source: e,
        })
}

fn run_ok(repo_root: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = run(repo_root, args)?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool, GitError> {
    let output = run(
        repo_root,
        &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )?;
    Ok(output.status.success())
}

fn worktree_registered(repo_root: &Path, path: &Path) -> Result<bool, GitError> {
    let list = run_ok(repo_root, &["worktree", "list", "--porcelain"])?;
    let target = path.display().to_string();
    Ok(list.lines().any(|line| line == format!("worktree {target}")))
}

/// `MountWorktree(path, branch, base)` (spec Section 4.3).
pub fn mount_worktree(
    repo_root: &Path,
    path: &Path,
    branch: &str,
    base: Option<&str>,
) -> Result<PathBuf, GitError> {
    if worktree_registered(repo_root, path)? {
        return Ok(path.to_path_buf());
    }

    if !branch_exists(repo_root, branch)? {
        let base_ref = base.map(str::to_string).unwrap_or_else(|| "HEAD".to_string());
        run_ok(repo_root, &["branch", branch, &base_ref])?;
    }

    let path_str = path.display().to_string();
    run_ok(repo_root, &["worktree", "add", &path_str, branch])?;
    Ok(path.to_path_buf())
}

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Lists all worktrees registered against `repo_root`, in `git worktree
/// list`'s own order.
pub fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
    let output = run_ok(repo_root, &["worktree", "list", "--porcelain"])?;
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut branch: Option<String> = None;
    for line in output.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let Some(prev) = path.take() {
                entries.push(WorktreeEntry { path: prev, branch: branch.take() });
            }
            path = Some(PathBuf::from(p));
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(
                b.strip_prefix("refs/heads/")
                    .map(str::to_string)
                    .unwrap_or_else(|| b.to_string()),
            );
        } else if line.is_empty() {
            if let Some(prev) = path.take() {
                entries.push(WorktreeEntry { path: prev, branch: branch.take() });
            }
        }
    }
    if let Some(prev) = path.take() {
        entries.push(WorktreeEntry { path: prev, branch: branch.take() });
    }
    Ok(entries)
}

/// `git worktree prune`: drops administrative files for worktrees whose
/// directory is already gone.
pub fn prune_worktrees(repo_root: &Path) -> Result<(), GitError> {
    run_ok(repo_root, &["worktree", "prune"]).map(|_| ())
}

/// `git branch -D`. Idempotent in the sense that a missing branch is the
/// caller's problem, not retried here.
pub fn delete_branch(repo_root: &Path, branch: &str) -> Result<(), GitError> {
    run_ok(repo_root, &["branch", "-D", branch]).map(|_| ())
}

/// `RemoveWorktree(path)`: idempotent, absent paths are not errors.
pub fn remove_worktree(repo_root: &Path, path: &Path) -> Result<(), GitError> {
    if !path.exists() {
        return Ok(());
    }
    let path_str = path.display().to_string();
    let output = run(repo_root, &["worktree", "remove", "--force", &path_str])?;
    if !output.status.success() {
        let _ = std::fs::remove_dir_all(path);
        run(repo_root, &["worktree", "prune"])?;
    }
    Ok(())
}

/// `CommitWorkspace(path, message)`: no-op if the workspace is clean.
pub fn commit_workspace(path: &Path, message: &str) -> Result<(), GitError> {
    let status = run_ok(path, &["status", "--porcelain"])?;
    if status.is_empty() {
        return Ok(());
    }
    run_ok(path, &["add", "-A"])?;
    run_ok(path, &["commit", "-m", message])?;
    Ok(())
}

/// Outcome of `ApplyChanges`: whether a merge-back commit was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Committed,
    NothingToCommit,
}

/// `ApplyChanges(task_id, goal, run_id, step_index)`: the merge-back
/// protocol in spec Section 4.3, steps 1-7.
pub fn apply_changes(
    repo_root: &Path,
    task_id: &str,
    goal: &str,
    run_id: &str,
    step_index: u32,
) -> Result<MergeOutcome, GitError> {
    let branch = task_branch_name(task_id);

    let dirty = !run_ok(repo_root, &["status", "--porcelain"])?.is_empty();
    let mut stashed = false;
    if dirty {
        run_ok(
            repo_root,
            &["stash", "push", "-u", "-m", "norma-merge-back-stash"],
        )?;
        stashed = true;
    }

    let before_hash = run_ok(repo_root, &["rev-parse", "HEAD"])?;

    if let Err(e) = run_ok(repo_root, &["merge", "--squash", &branch]) {
        let _ = run(repo_root, &["reset", "--hard", &before_hash]);
        if stashed {
            let _ = run(repo_root, &["stash", "pop"]);
        }
        return Err(e);
    }

    run_ok(repo_root, &["add", "-A"])?;
    let status = run_ok(repo_root, &["status", "--porcelain"])?;
    let outcome = if status.is_empty() {
        MergeOutcome::NothingToCommit
    } else {
        let message = merge_commit_message(goal, run_id, step_index, task_id);
        run_ok(repo_root, &["commit", "-m", &message])?;
        MergeOutcome::Committed
    };

    if stashed {
        if let Err(e) = run_ok(repo_root, &["stash", "apply"]) {
            return Err(e);
        }
        run_ok(repo_root, &["stash", "drop"])?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run_ok(dir.path(), &["init", "-q"]).unwrap();
        run_ok(dir.path(), &["config", "user.email", "norma@example.com"]).unwrap();
        run_ok(dir.path(), &["config", "user.name", "Norma"]).unwrap();
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run_ok(dir.path(), &["add", "-A"]).unwrap();
        run_ok(dir.path(), &["commit", "-m", "initial"]).unwrap();
        dir
    }

    #[test]
    fn mount_worktree_creates_branch_and_checks_it_out() {
        let repo = init_repo();
        let worktree_path = repo.path().join("wt");
        let result = mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None)
            .unwrap();
        assert_eq!(result, worktree_path);
        assert!(branch_exists(repo.path(), "norma/task/norma-a3f2dd").unwrap());
        remove_worktree(repo.path(), &worktree_path).unwrap();
    }

    #[test]
    fn mount_worktree_is_idempotent_when_already_registered() {
        let repo = init_repo();
        let worktree_path = repo.path().join("wt");
        mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None).unwrap();
        let result = mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None)
            .unwrap();
        assert_eq!(result, worktree_path);
        remove_worktree(repo.path(), &worktree_path).unwrap();
    }

    #[test]
    fn remove_worktree_on_absent_path_is_not_an_error() {
        let repo = init_repo();
        remove_worktree(repo.path(), &repo.path().join("never-existed")).unwrap();
    }

    #[test]
    fn commit_workspace_is_noop_when_clean() {
        let repo = init_repo();
        commit_workspace(repo.path(), "nothing changed").unwrap();
        let log = run_ok(repo.path(), &["log", "--oneline"]).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn commit_workspace_commits_dirty_changes() {
        let repo = init_repo();
        std::fs::write(repo.path().join("new.txt"), "content\n").unwrap();
        commit_workspace(repo.path(), "add new.txt").unwrap();
        let log = run_ok(repo.path(), &["log", "--oneline"]).unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn apply_changes_squash_merges_task_branch() {
        let repo = init_repo();
        let worktree_path = repo.path().join("wt");
        mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None).unwrap();
        std::fs::write(worktree_path.join("feature.txt"), "feature\n").unwrap();
        commit_workspace(&worktree_path, "implement feature").unwrap();
        remove_worktree(repo.path(), &worktree_path).unwrap();

        let outcome =
            apply_changes(repo.path(), "norma-a3f2dd", "Implement feature", "r1", 3).unwrap();
        assert_eq!(outcome, MergeOutcome::Committed);

        let subject = run_ok(repo.path(), &["log", "-1", "--format=%s"]).unwrap();
        assert!(subject.starts_with("feat: Implement feature"));
        let body = run_ok(repo.path(), &["log", "-1", "--format=%b"]).unwrap();
        assert!(body.contains("task_id: norma-a3f2dd"));
        assert!(repo.path().join("feature.txt").exists());
    }

    #[test]
    fn apply_changes_preserves_dirty_working_tree() {
        let repo = init_repo();
        let worktree_path = repo.path().join("wt");
        mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None).unwrap();
        std::fs::write(worktree_path.join("feature.txt"), "feature\n").unwrap();
        commit_workspace(&worktree_path, "implement feature").unwrap();
        remove_worktree(repo.path(), &worktree_path).unwrap();

        std::fs::write(repo.path().join("README.md"), "locally edited\n").unwrap();

        apply_changes(repo.path(), "norma-a3f2dd", "Implement feature", "r1", 3).unwrap();

        let readme = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
        assert_eq!(readme, "locally edited\n");
        let status = run_ok(repo.path(), &["status", "--porcelain"]).unwrap();
        assert!(status.contains("README.md"));
    }

    #[test]
    fn apply_changes_returns_nothing_to_commit_when_branch_empty() {
        let repo = init_repo();
        let worktree_path = repo.path().join("wt");
        mount_worktree(repo.path(), &worktree_path, "norma/task/norma-a3f2dd", None).unwrap();
        remove_worktree(repo.path(), &worktree_path).unwrap();

        let outcome =
            apply_changes(repo.path(), "norma-a3f2dd", "Implement feature", "r1", 1).unwrap();
        assert_eq!(outcome, MergeOutcome::NothingToCommit);
    }
}
