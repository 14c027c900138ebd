//! Task-branch naming and merge commit message assembly (spec Section 6).

/// The long-lived branch a task's Do commits accumulate on.
pub fn task_branch_name(task_id: &str) -> String {
    format!("norma/task/{task_id}")
}

/// Build the squash-merge commit message (spec Section 6).
///
/// `fix:` is chosen when the goal text, trimmed and lowercased, starts with
/// `fix` or `bug`; otherwise `feat:`.
pub fn merge_commit_message(goal: &str, run_id: &str, step_index: u32, task_id: &str) -> String {
    let prefix = if is_fix_goal(goal) { "fix" } else { "feat" };
    format!("{prefix}: {goal}\n\nrun_id: {run_id}\nstep_index: {step_index}\ntask_id: {task_id}\n")
}

fn is_fix_goal(goal: &str) -> bool {
    let normalized = goal.trim().to_lowercase();
    normalized.starts_with("fix") || normalized.starts_with("bug")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_branch_name_is_namespaced() {
        assert_eq!(task_branch_name("norma-a3f2dd"), "norma/task/norma-a3f2dd");
    }

    #[test]
    fn commit_prefix_selection() {
        assert!(is_fix_goal("Fix panic on empty input"));
        assert!(is_fix_goal("  BUG: crash on startup"));
        assert!(!is_fix_goal("Implement dashboard widget"));
    }

    #[test]
    fn merge_commit_message_has_footers() {
        let msg = merge_commit_message("Fix panic…", "20260101-000000-abcdef", 3, "norma-a3f2dd");
        assert!(msg.starts_with("fix: Fix panic…"));
        assert!(msg.contains("run_id: 20260101-000000-abcdef\n"));
        assert!(msg.contains("step_index: 3\n"));
        assert!(msg.contains("task_id: norma-a3f2dd\n"));
    }

    #[test]
    fn merge_commit_message_uses_feat_for_features() {
        let msg = merge_commit_message("Implement dashboard…", "r", 1, "norma-a");
        assert!(msg.starts_with("feat: Implement dashboard…"));
    }
}
