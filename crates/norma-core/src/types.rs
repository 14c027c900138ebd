//! Core data types for the orchestrator.
//!
//! These mirror the data model in spec Section 3: `Task`/`TaskState` (owned
//! by the external task tracker but shaped here so the orchestrator can
//! reason about them), `Run`, `Step`, `Event`, and the PDCA role enum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Surrogate key for rows that need an identity distinct from the
/// spec-mandated `run_id`/`task_id`/`step_index` (namely `events.id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The four PDCA roles, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    Plan,
    Do,
    Check,
    Act,
}

impl StepRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Do => "do",
            Self::Check => "check",
            Self::Act => "act",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(Self::Plan),
            "do" => Some(Self::Do),
            "check" => Some(Self::Check),
            "act" => Some(Self::Act),
            _ => None,
        }
    }

    pub const ALL: [StepRole; 4] = [Self::Plan, Self::Do, Self::Check, Self::Act];
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run lifecycle status (spec Section 3: `Run.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// A run that has left `Running` has reached one of the four terminal
    /// states named in spec Section 8 (Invariants).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Step execution status (derived from `AgentResponse.status` plus the two
/// pre-response states a row passes through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    InProgress,
    Ok,
    Fail,
    Stop,
    Error,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Stop => "stop",
            Self::Error => "error",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "ok" => Some(Self::Ok),
            "fail" => Some(Self::Fail),
            "stop" => Some(Self::Stop),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A single run of the iteration controller against one task (spec Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// `YYYYMMDD-HHMMSS-<6 hex>`, see `crate::ids::new_run_id`.
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub task_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub current_step_index: u32,
    /// Check's last verdict, if any (`PASS`/`FAIL`).
    pub verdict: Option<String>,
    pub run_dir: String,
}

/// One step record: one invocation of one role within one iteration
/// (spec Section 3, primary key `(run_id, step_index)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub run_id: String,
    pub step_index: u32,
    pub role: StepRole,
    pub iteration: u32,
    pub status: StepStatus,
    pub step_dir: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
}

/// An append-only audit event (spec Section 3, primary key `(run_id, seq)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub message: String,
    pub data_json: Option<String>,
}

/// The per-task durable state round-tripped through the task tracker's
/// notes field (spec Section 3: `TaskState`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
    #[serde(rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act: Option<serde_json::Value>,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
}

impl TaskState {
    /// Enforce the invariant from spec Section 3: "if `plan` is nil then
    /// `do` must be ignored on resume". Callers that are deciding whether a
    /// prior `do` output is reusable should consult this instead of reading
    /// `do_` directly.
    pub fn resumable_do(&self) -> Option<&serde_json::Value> {
        if self.plan.is_none() {
            return None;
        }
        self.do_.as_ref()
    }

    /// Clear the plan when Act decides to replan (spec Section 3 invariant).
    pub fn clear_plan(&mut self) {
        self.plan = None;
    }
}

/// One entry in `TaskState.journal` (spec Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub iteration: u32,
    pub step_index: u32,
    pub role: StepRole,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub title: String,
    #[serde(default)]
    pub details: Vec<String>,
}

/// A task as surfaced by the external tracker (spec Section 3: `Task`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub status: String,
    pub labels: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_hints: Option<String>,
}

/// Task statuses the orchestrator assigns (spec Section 6).
pub mod task_status {
    pub const TODO: &str = "todo";
    pub const PLANNING: &str = "planning";
    pub const DOING: &str = "doing";
    pub const CHECKING: &str = "checking";
    pub const ACTING: &str = "acting";
    pub const DONE: &str = "done";
    pub const FAILED: &str = "failed";
    pub const STOPPED: &str = "stopped";
}

/// Labels recognized on the task (spec Section 4.7).
pub mod labels {
    pub const HAS_PLAN: &str = "norma-has-plan";
    pub const HAS_DO: &str = "norma-has-do";
    pub const HAS_CHECK: &str = "norma-has-check";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn step_role_round_trips_through_str() {
        for role in StepRole::ALL {
            assert_eq!(StepRole::from_str_opt(role.as_str()), Some(role));
        }
        assert_eq!(StepRole::from_str_opt("bogus"), None);
    }

    #[test]
    fn run_status_is_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Passed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Error.is_terminal());
    }

    #[test]
    fn task_state_resumable_do_requires_plan() {
        let mut state = TaskState {
            do_: Some(serde_json::json!({"summary": "did stuff"})),
            ..Default::default()
        };
        assert!(state.resumable_do().is_none());

        state.plan = Some(serde_json::json!({"work_plan": "..."}));
        assert!(state.resumable_do().is_some());
    }

    #[test]
    fn task_state_clear_plan() {
        let mut state = TaskState {
            plan: Some(serde_json::json!({"work_plan": "x"})),
            ..Default::default()
        };
        state.clear_plan();
        assert!(state.plan.is_none());
    }

    #[test]
    fn task_state_round_trips_through_json() {
        let mut state = TaskState::default();
        state.journal.push(JournalEntry {
            timestamp: Utc::now(),
            run_id: "20260101-000000-abcdef".to_string(),
            iteration: 1,
            step_index: 1,
            role: StepRole::Plan,
            status: StepStatus::Ok,
            stop_reason: None,
            title: "planned".to_string(),
            details: vec!["did a thing".to_string()],
        });

        let json = serde_json::to_string(&state).unwrap();
        let restored: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.journal.len(), 1);
        assert_eq!(restored.journal[0].role, StepRole::Plan);
    }
}
