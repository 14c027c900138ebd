//! Iteration controller: drives the Plan/Do/Check/Act cycle for one run
//! (spec Section 4.7).

use std::path::Path;
use std::time::Duration;

use norma_core::config::Config;
use norma_core::errors::{FatalError, StepError};
use norma_core::events::{
    EventPayload, MergeCommittedPayload, RunFailedPayload, RunPassedPayload, RunStoppedPayload,
};
use norma_core::types::{
    labels, task_status, JournalEntry, RunStatus, StepRole, StepStatus, Task, TaskState,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::executor::{execute_step, StepContext, StepExecution};
use crate::git::{self, MergeOutcome};
use crate::storage::{RunUpdate, Storage, StorageError};
use crate::tracker::TaskTracker;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Fatal(#[from] FatalError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("step failed after retries: {0}")]
    StepExhausted(StepError),
    #[error("git merge-back failed: {0}")]
    MergeBack(#[from] git::GitError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Final outcome of driving the controller loop to a terminal run status.
pub struct ControllerOutcome {
    pub status: RunStatus,
    pub verdict: Option<String>,
}

pub struct Controller<'a> {
    pub storage: &'a Storage,
    pub tracker: &'a dyn TaskTracker,
    pub config: &'a Config,
    pub repo_root: &'a Path,
    pub runs_dir: &'a Path,
    pub run_id: String,
    pub task_id: String,
}

impl<'a> Controller<'a> {
    /// Drive iterations 1..=`budgets.max_iterations` to a terminal status.
    pub async fn run(&self) -> Result<ControllerOutcome, ControllerError> {
        let task = self
            .tracker
            .task(&self.task_id)
            .map_err(|e| FatalError::TrackerRead(e.to_string()))?;
        let mut state = load_task_state(&task);
        let mut step_index: u32 = 0;

        for iteration in 1..=self.config.budgets.max_iterations {
            if let Some(outcome) = self
                .run_iteration(&task, &mut state, iteration, &mut step_index)
                .await?
            {
                return Ok(outcome);
            }
        }

        self.tracker
            .mark_status(&self.task_id, task_status::STOPPED)
            .unwrap_or_else(|e| warn!(error = %e, "failed to mirror stopped task status"));
        self.storage
            .update_run(
                &self.run_id,
                &RunUpdate {
                    status: Some(RunStatus::Stopped),
                    ..Default::default()
                },
                Some((
                    EventPayload::RunStopped(RunStoppedPayload {
                        stop_reason: Some("budget_exhausted".to_string()),
                    }),
                    "run stopped: iteration budget exhausted".to_string(),
                )),
            )
            .await?;

        Ok(ControllerOutcome {
            status: RunStatus::Stopped,
            verdict: None,
        })
    }

    /// Runs Plan, Do, Check, Act for one iteration. Returns `Some(outcome)`
    /// when the run has reached a terminal state, `None` to continue looping.
    async fn run_iteration(
        &self,
        task: &Task,
        state: &mut TaskState,
        iteration: u32,
        step_index: &mut u32,
    ) -> Result<Option<ControllerOutcome>, ControllerError> {
        let has_plan = task_has_label(task, labels::HAS_PLAN);
        let has_do = task_has_label(task, labels::HAS_DO);
        let has_check = task_has_label(task, labels::HAS_CHECK);
        let last_act_continue = state
            .act
            .as_ref()
            .and_then(|a| a.get("decision"))
            .and_then(Value::as_str)
            == Some("continue");

        let skip_plan = (iteration == 1 && has_plan && state.plan.is_some())
            || (iteration > 1 && last_act_continue && state.plan.is_some());

        if !skip_plan {
            self.clear_labels(&[labels::HAS_PLAN, labels::HAS_DO, labels::HAS_CHECK]);
            self.mirror_status(task_status::PLANNING);
            *step_index += 1;
            let payload = serde_json::json!({ "task_id": self.task_id });
            match self
                .run_role(task, state, StepRole::Plan, iteration, *step_index, Some(payload))
                .await?
            {
                RoleOutcome::Continue(response) => {
                    state.plan = response.plan_output.clone();
                    self.tracker
                        .add_label(&self.task_id, labels::HAS_PLAN)
                        .unwrap_or_else(|e| warn!(error = %e, "failed to add has-plan label"));
                }
                RoleOutcome::Terminal(outcome) => return Ok(Some(outcome)),
            }
        }

        let skip_do = iteration == 1 && has_do && state.resumable_do().is_some();
        if !skip_do {
            self.clear_labels(&[labels::HAS_DO, labels::HAS_CHECK]);
            self.mirror_status(task_status::DOING);
            *step_index += 1;
            let payload = state.plan.clone();
            match self
                .run_role(task, state, StepRole::Do, iteration, *step_index, payload)
                .await?
            {
                RoleOutcome::Continue(response) => {
                    state.do_ = response.do_output.clone();
                    self.tracker
                        .add_label(&self.task_id, labels::HAS_DO)
                        .unwrap_or_else(|e| warn!(error = %e, "failed to add has-do label"));
                }
                RoleOutcome::Terminal(outcome) => return Ok(Some(outcome)),
            }
        }

        let skip_check = iteration == 1 && has_check && state.check.is_some();
        if !skip_check {
            self.clear_labels(&[labels::HAS_CHECK]);
            self.mirror_status(task_status::CHECKING);
            *step_index += 1;
            let payload = serde_json::json!({
                "work_plan": state.plan.as_ref().and_then(|p| p.get("work_plan")).cloned(),
                "acceptance_criteria": state.plan.as_ref().and_then(|p| p.get("acceptance_criteria")).cloned(),
                "execution_summary": state.do_.as_ref().and_then(|d| d.get("summary")).cloned(),
            });
            match self
                .run_role(task, state, StepRole::Check, iteration, *step_index, Some(payload))
                .await?
            {
                RoleOutcome::Continue(response) => {
                    state.check = response.check_output.clone();
                    self.tracker
                        .add_label(&self.task_id, labels::HAS_CHECK)
                        .unwrap_or_else(|e| warn!(error = %e, "failed to add has-check label"));
                }
                RoleOutcome::Terminal(outcome) => return Ok(Some(outcome)),
            }
        }

        if state.check.is_none() {
            return self
                .fail_run("internal error: missing check verdict for act")
                .await
                .map(Some);
        }

        self.mirror_status(task_status::ACTING);
        *step_index += 1;
        let payload = serde_json::json!({
            "verdict": state.check.as_ref().and_then(|c| c.get("verdict")).cloned(),
            "acceptance_results": state.check.as_ref().and_then(|c| c.get("acceptance_results")).cloned(),
        });
        let act_response = match self
            .run_role(task, state, StepRole::Act, iteration, *step_index, Some(payload))
            .await?
        {
            RoleOutcome::Continue(response) => response,
            RoleOutcome::Terminal(outcome) => return Ok(Some(outcome)),
        };
        state.act = act_response.act_output.clone();
        if act_response.act_output.as_ref().and_then(|a| a.get("decision")).and_then(Value::as_str)
            == Some("replan")
        {
            state.clear_plan();
            self.clear_labels(&[labels::HAS_PLAN, labels::HAS_DO, labels::HAS_CHECK]);
        }

        // End-of-iteration decisions (spec Section 4.7).
        let check_status = state
            .check
            .as_ref()
            .and_then(|c| c.get("verdict"))
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str);

        if check_status == Some("PASS") {
            return self.pass_run(task, iteration, *step_index).await.map(Some);
        }

        let act_decision = state
            .act
            .as_ref()
            .and_then(|a| a.get("decision"))
            .and_then(Value::as_str);

        if act_response.status == "stop" || act_response.status == "error" || act_decision == Some("close")
        {
            let status = if act_response.status == "stop" {
                RunStatus::Stopped
            } else {
                RunStatus::Failed
            };
            return self
                .stop_run(status, act_response.stop_reason.clone())
                .await
                .map(Some);
        }

        Ok(None)
    }

    /// Runs one role to completion (including retries), persists the
    /// journal entry, and classifies the outcome per spec Section 7.
    async fn run_role(
        &self,
        task: &Task,
        state: &mut TaskState,
        role: StepRole,
        iteration: u32,
        step_index: u32,
        payload: Option<Value>,
    ) -> Result<RoleOutcome, ControllerError> {
        let progress_md = norma_core::render_progress_md(&self.task_id, state);
        let mut attempt: u32 = 1;
        let execution = loop {
            let ctx = StepContext {
                repo_root: self.repo_root,
                runs_dir: self.runs_dir,
                run_id: &self.run_id,
                task_id: &self.task_id,
                config: self.config,
                role,
                step_index,
                iteration,
                attempt,
            };
            match execute_step(&ctx, task, &progress_md, payload.clone()).await {
                Ok(execution) => break execution,
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(role = %role, attempt, error = %e, "step failed, retrying");
                    let backoff = Duration::from_secs(
                        u64::from(attempt + 1) * u64::from(self.config.retry_backoff_base_sec),
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.record_step_failure(state, role, iteration, step_index, &e)
                        .await?;
                    return Ok(RoleOutcome::Terminal(
                        self.fail_run(&format!("step exhausted retries: {e}")).await?,
                    ));
                }
            }
        };

        self.persist_step(state, &execution, iteration).await?;

        // Act's status/decision feed directly into the end-of-iteration
        // decision list (spec Section 4.7), which checks the Check verdict
        // first — so Act never short-circuits here, only Plan/Do/Check do.
        if role == StepRole::Act {
            return Ok(RoleOutcome::Continue(execution.response));
        }

        if execution.response.status == "stop" {
            return Ok(RoleOutcome::Terminal(
                self.stop_run(RunStatus::Stopped, execution.response.stop_reason.clone())
                    .await?,
            ));
        }
        if execution.response.status != "ok" {
            return Ok(RoleOutcome::Terminal(
                self.fail_run(&format!(
                    "{role} step returned status={}",
                    execution.response.status
                ))
                .await?,
            ));
        }

        Ok(RoleOutcome::Continue(execution.response))
    }

    async fn persist_step(
        &self,
        state: &mut TaskState,
        execution: &StepExecution,
        iteration: u32,
    ) -> Result<(), ControllerError> {
        self.storage
            .commit_step(
                &execution.step,
                &execution.events,
                &RunUpdate {
                    iteration: Some(iteration),
                    current_step_index: Some(execution.step.step_index),
                    ..Default::default()
                },
            )
            .await?;

        state.journal.push(JournalEntry {
            timestamp: chrono::Utc::now(),
            run_id: self.run_id.clone(),
            iteration,
            step_index: execution.step.step_index,
            role: execution.step.role,
            status: execution.step.status,
            stop_reason: execution.response.stop_reason.clone(),
            title: execution.response.progress.title.clone(),
            details: execution.response.progress.details.clone(),
        });
        self.persist_state(state);
        Ok(())
    }

    async fn record_step_failure(
        &self,
        state: &mut TaskState,
        role: StepRole,
        iteration: u32,
        step_index: u32,
        error: &StepError,
    ) -> Result<(), ControllerError> {
        state.journal.push(JournalEntry {
            timestamp: chrono::Utc::now(),
            run_id: self.run_id.clone(),
            iteration,
            step_index,
            role,
            status: StepStatus::Fail,
            stop_reason: None,
            title: format!("{role} exhausted retries"),
            details: vec![error.to_string()],
        });
        self.persist_state(state);
        Ok(())
    }

    fn persist_state(&self, state: &TaskState) {
        match serde_json::to_string(state) {
            Ok(notes) => {
                if let Err(e) = self.tracker.set_notes(&self.task_id, &notes) {
                    warn!(error = %e, "failed to persist task state notes");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize task state"),
        }
    }

    fn clear_labels(&self, labels: &[&str]) {
        for label in labels {
            self.tracker
                .remove_label(&self.task_id, label)
                .unwrap_or_else(|e| warn!(error = %e, label, "failed to remove label"));
        }
    }

    fn mirror_status(&self, status: &str) {
        self.tracker
            .mark_status(&self.task_id, status)
            .unwrap_or_else(|e| warn!(error = %e, status, "failed to mirror task status"));
    }

    async fn pass_run(
        &self,
        task: &Task,
        iteration: u32,
        step_index: u32,
    ) -> Result<ControllerOutcome, ControllerError> {
        let outcome = git::apply_changes(self.repo_root, &self.task_id, &task.goal, &self.run_id, step_index)?;
        if let MergeOutcome::Committed = outcome {
            self.storage
                .update_run(
                    &self.run_id,
                    &RunUpdate::default(),
                    Some((
                        EventPayload::MergeCommitted(MergeCommittedPayload {
                            commit_message_subject: format!("merge-back for {}", self.task_id),
                        }),
                        "merge-back committed".to_string(),
                    )),
                )
                .await?;
        }
        self.mirror_status(task_status::DONE);
        self.storage
            .update_run(
                &self.run_id,
                &RunUpdate {
                    status: Some(RunStatus::Passed),
                    verdict: Some(Some("PASS".to_string())),
                    ..Default::default()
                },
                Some((
                    EventPayload::RunPassed(RunPassedPayload { iteration }),
                    "run passed".to_string(),
                )),
            )
            .await?;
        info!(task_id = %self.task_id, run_id = %self.run_id, "run passed");
        Ok(ControllerOutcome {
            status: RunStatus::Passed,
            verdict: Some("PASS".to_string()),
        })
    }

    async fn stop_run(
        &self,
        status: RunStatus,
        stop_reason: Option<String>,
    ) -> Result<ControllerOutcome, ControllerError> {
        let task_status_value = if status == RunStatus::Stopped {
            task_status::STOPPED
        } else {
            task_status::FAILED
        };
        self.mirror_status(task_status_value);
        self.storage
            .update_run(
                &self.run_id,
                &RunUpdate {
                    status: Some(status),
                    ..Default::default()
                },
                Some((
                    EventPayload::RunStopped(RunStoppedPayload {
                        stop_reason: stop_reason.clone(),
                    }),
                    format!("run {}", status.as_str()),
                )),
            )
            .await?;
        Ok(ControllerOutcome {
            status,
            verdict: None,
        })
    }

    async fn fail_run(&self, reason: &str) -> Result<ControllerOutcome, ControllerError> {
        self.mirror_status(task_status::FAILED);
        self.storage
            .update_run(
                &self.run_id,
                &RunUpdate {
                    status: Some(RunStatus::Failed),
                    ..Default::default()
                },
                Some((
                    EventPayload::RunFailed(RunFailedPayload {
                        reason: reason.to_string(),
                    }),
                    reason.to_string(),
                )),
            )
            .await?;
        Ok(ControllerOutcome {
            status: RunStatus::Failed,
            verdict: None,
        })
    }
}

enum RoleOutcome {
    Continue(norma_core::AgentResponse),
    Terminal(ControllerOutcome),
}

fn load_task_state(task: &Task) -> TaskState {
    serde_json::from_str(&task.notes).unwrap_or_default()
}

fn task_has_label(task: &Task, label: &str) -> bool {
    task.labels.iter().any(|l| l == label)
}
