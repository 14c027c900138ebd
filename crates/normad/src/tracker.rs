//! Task-tracker contract and a filesystem-backed implementation (spec
//! Section 6: "Task-tracker contract").

use std::path::{Path, PathBuf};

use norma_core::types::Task;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The external task-tracker interface the orchestrator is written against
/// (spec Section 6). Errors from label/status mutations are logged and
/// ignored by callers — the journal remains the source of truth.
pub trait TaskTracker: Send + Sync {
    fn task(&self, id: &str) -> Result<Task, TrackerError>;
    fn mark_status(&self, id: &str, status: &str) -> Result<(), TrackerError>;
    fn set_notes(&self, id: &str, notes: &str) -> Result<(), TrackerError>;
    fn add_label(&self, id: &str, label: &str) -> Result<(), TrackerError>;
    fn remove_label(&self, id: &str, label: &str) -> Result<(), TrackerError>;
    fn list(&self, status: Option<&str>) -> Result<Vec<Task>, TrackerError>;
    fn set_run(&self, id: &str, run_id: &str) -> Result<(), TrackerError>;
}

/// One task per JSON file under `<repo>/.norma/tasks/<task_id>.json`. The
/// `notes` field round-trips `norma_core::types::TaskState`.
#[derive(Debug)]
pub struct FileTaskTracker {
    tasks_dir: PathBuf,
}

impl FileTaskTracker {
    pub fn new(tasks_dir: PathBuf) -> Self {
        Self { tasks_dir }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{id}.json"))
    }

    fn read(&self, id: &str) -> Result<Task, TrackerError> {
        let path = self.path_for(id);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrackerError::NotFound(id.to_string())
            } else {
                TrackerError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, task: &Task) -> Result<(), TrackerError> {
        std::fs::create_dir_all(&self.tasks_dir)?;
        let content = serde_json::to_string_pretty(task)?;
        std::fs::write(self.path_for(&task.id), content)?;
        Ok(())
    }
}

impl TaskTracker for FileTaskTracker {
    fn task(&self, id: &str) -> Result<Task, TrackerError> {
        self.read(id)
    }

    fn mark_status(&self, id: &str, status: &str) -> Result<(), TrackerError> {
        let mut task = self.read(id)?;
        task.status = status.to_string();
        self.write(&task)
    }

    fn set_notes(&self, id: &str, notes: &str) -> Result<(), TrackerError> {
        let mut task = self.read(id)?;
        task.notes = notes.to_string();
        self.write(&task)
    }

    fn add_label(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        let mut task = self.read(id)?;
        if !task.labels.iter().any(|l| l == label) {
            task.labels.push(label.to_string());
        }
        self.write(&task)
    }

    fn remove_label(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        let mut task = self.read(id)?;
        task.labels.retain(|l| l != label);
        self.write(&task)
    }

    fn list(&self, status: Option<&str>) -> Result<Vec<Task>, TrackerError> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.tasks_dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(entry.path())?;
            let task: Task = serde_json::from_str(&content)?;
            let matches = match status {
                Some(s) => task.status == s,
                None => true,
            };
            if matches {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn set_run(&self, id: &str, run_id: &str) -> Result<(), TrackerError> {
        let mut task = self.read(id)?;
        if !task.labels.iter().any(|l| l == &format!("run:{run_id}")) {
            task.labels.push(format!("run:{run_id}"));
        }
        self.write(&task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use norma_core::types::AcceptanceCriterion;
    use tempfile::TempDir;

    fn seeded(dir: &Path) -> FileTaskTracker {
        let tracker = FileTaskTracker::new(dir.to_path_buf());
        tracker
            .write(&Task {
                id: "norma-a3f2dd".to_string(),
                goal: "Fix panic on empty input".to_string(),
                acceptance_criteria: vec![AcceptanceCriterion {
                    id: "ac1".to_string(),
                    text: "no panic".to_string(),
                    verify_hints: None,
                }],
                status: "todo".to_string(),
                labels: vec![],
                notes: "{}".to_string(),
            })
            .unwrap();
        tracker
    }

    #[test]
    fn round_trips_task_through_json_file() {
        let dir = TempDir::new().unwrap();
        let tracker = seeded(dir.path());
        let task = tracker.task("norma-a3f2dd").unwrap();
        assert_eq!(task.goal, "Fix panic on empty input");
    }

    #[test]
    fn mark_status_persists() {
        let dir = TempDir::new().unwrap();
        let tracker = seeded(dir.path());
        tracker.mark_status("norma-a3f2dd", "planning").unwrap();
        assert_eq!(tracker.task("norma-a3f2dd").unwrap().status, "planning");
    }

    #[test]
    fn add_and_remove_label_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let tracker = seeded(dir.path());
        tracker.add_label("norma-a3f2dd", "norma-has-plan").unwrap();
        tracker.add_label("norma-a3f2dd", "norma-has-plan").unwrap();
        assert_eq!(tracker.task("norma-a3f2dd").unwrap().labels, vec!["norma-has-plan"]);

        tracker.remove_label("norma-a3f2dd", "norma-has-plan").unwrap();
        assert!(tracker.task("norma-a3f2dd").unwrap().labels.is_empty());
    }

    #[test]
    fn list_filters_by_status() {
        let dir = TempDir::new().unwrap();
        let tracker = seeded(dir.path());
        assert_eq!(tracker.list(Some("todo")).unwrap().len(), 1);
        assert_eq!(tracker.list(Some("done")).unwrap().len(), 0);
        assert_eq!(tracker.list(None).unwrap().len(), 1);
    }

    #[test]
    fn unknown_task_is_not_found() {
        let dir = TempDir::new().unwrap();
        let tracker = FileTaskTracker::new(dir.path().to_path_buf());
        let err = tracker.task("norma-missing").unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }
}
