//! `progress.md` reconstruction from a task's journal (spec Section 6).

use crate::types::{JournalEntry, TaskState};

/// Render every journal entry, in order, as the `progress.md` artifact
/// written before each step.
pub fn render_progress_md(task_id: &str, state: &TaskState) -> String {
    let mut out = String::new();
    for entry in &state.journal {
        out.push_str(&render_entry(task_id, entry));
    }
    out
}

fn render_entry(task_id: &str, entry: &JournalEntry) -> String {
    let stop_reason = entry.stop_reason.as_deref().unwrap_or("none");
    let mut section = format!(
        "## {ts} — {step} {role} — {status}/{stop_reason}\n\
         **Task:** {task_id}  \n\
         **Run:** {run_id} · **Iteration:** {iter}\n\n\
         **Title:** {title}\n\n\
         **Details:**\n",
        ts = entry.timestamp.to_rfc3339(),
        step = entry.step_index,
        role = entry.role.as_str().to_uppercase(),
        status = entry.status.as_str(),
        run_id = entry.run_id,
        iter = entry.iteration,
        title = entry.title,
    );

    if entry.details.is_empty() {
        section.push_str("- (none)\n");
    } else {
        for detail in &entry.details {
            section.push_str(&format!("- {detail}\n"));
        }
    }
    section.push('\n');
    section
}
