//! Step executor: one invocation of one role for one (iteration, attempt)
//! (spec Section 4.6).

use std::collections::HashMap;
use std::path::Path;

use norma_core::agent_io::{
    parse_agent_response, AgentRequest, AgentResponse, Context as RequestContext, Paths, RunRef,
    StepRef, TaskRef,
};
use norma_core::config::Config;
use norma_core::errors::{RetryableError, StepError};
use norma_core::events::{EventPayload, StepFinishedPayload, StepStartedPayload};
use norma_core::roles::{validate_ok_payload, RoleRegistry};
use norma_core::types::{Step, StepRole, StepStatus, Task};
use serde::Serialize;
use serde_json::Value;

use crate::git::{self, GitError};
use crate::invoker::{invoke_agent, InvokerError};

impl From<GitError> for StepError {
    fn from(e: GitError) -> Self {
        StepError::NonRetryable(e.to_string())
    }
}

impl From<InvokerError> for StepError {
    fn from(e: InvokerError) -> Self {
        match e {
            InvokerError::SpawnFailure(msg) => {
                StepError::Retryable(RetryableError::SpawnFailure(msg))
            }
            InvokerError::Cancelled => StepError::Cancelled,
            InvokerError::Io(err) => StepError::NonRetryable(err.to_string()),
        }
    }
}

/// Everything one step execution needs beyond role-specific input.
pub struct StepContext<'a> {
    pub repo_root: &'a Path,
    pub runs_dir: &'a Path,
    pub run_id: &'a str,
    pub task_id: &'a str,
    pub config: &'a Config,
    pub role: StepRole,
    pub step_index: u32,
    pub iteration: u32,
    pub attempt: u32,
}

pub struct StepExecution {
    pub step: Step,
    pub response: AgentResponse,
    pub events: Vec<(EventPayload, String)>,
}

#[derive(Serialize)]
struct ProtocolFailureOutput<'a> {
    status: &'a str,
    protocol: String,
}

fn step_dir_name(step_index: u32, role: StepRole, attempt: u32) -> String {
    if attempt > 1 {
        format!("{step_index:02}-{role}-retry-{attempt}")
    } else {
        format!("{step_index:02}-{role}")
    }
}

/// Execute one step. Steps 1-12 of spec Section 4.6, in order.
pub async fn execute_step(
    ctx: &StepContext<'_>,
    task: &Task,
    progress_md: &str,
    role_payload: Option<Value>,
) -> Result<StepExecution, StepError> {
    let registry = RoleRegistry;
    let role = registry.get(ctx.role);

    // Steps 1-2: step directory layout.
    let dir_name = step_dir_name(ctx.step_index, ctx.role, ctx.attempt);
    let step_dir = ctx.runs_dir.join(ctx.run_id).join("steps").join(&dir_name);
    let logs_dir = step_dir.join("logs");
    let artifacts_dir = step_dir.join("artifacts");
    let workspace_dir = step_dir.join("workspace");
    for dir in [&step_dir, &logs_dir, &artifacts_dir] {
        std::fs::create_dir_all(dir).map_err(|e| {
            StepError::NonRetryable(format!("failed to create {}: {e}", dir.display()))
        })?;
    }

    // Step 3: mount worktree.
    let branch = norma_core::branch::task_branch_name(ctx.task_id);
    git::mount_worktree(
        ctx.repo_root,
        &workspace_dir,
        &branch,
        ctx.config.base_branch.as_deref(),
    )?;

    let outcome = run_invocation(
        ctx,
        &role,
        task,
        progress_md,
        role_payload,
        &step_dir,
        &logs_dir,
        &artifacts_dir,
        &workspace_dir,
    )
    .await;

    // Step 11: remove the worktree on every exit path.
    git::remove_worktree(ctx.repo_root, &workspace_dir)?;

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_invocation(
    ctx: &StepContext<'_>,
    role: &norma_core::roles::Role,
    task: &Task,
    progress_md: &str,
    role_payload: Option<Value>,
    step_dir: &Path,
    logs_dir: &Path,
    artifacts_dir: &Path,
    workspace_dir: &Path,
) -> Result<StepExecution, StepError> {
    // Step 4: write progress.md.
    let progress_path = artifacts_dir.join("progress.md");
    std::fs::write(&progress_path, progress_md)
        .map_err(|e| StepError::NonRetryable(format!("failed to write progress.md: {e}")))?;

    let fields = build_prompt_fields(ctx.role, ctx.task_id, &task.goal, role_payload.as_ref());

    // Step 5: write input.json.
    let request = build_request(ctx, task, &progress_path, workspace_dir, step_dir, role_payload);
    let input_json = serde_json::to_vec_pretty(&request)
        .map_err(|e| StepError::NonRetryable(format!("failed to serialize input.json: {e}")))?;
    std::fs::write(step_dir.join("input.json"), &input_json)
        .map_err(|e| StepError::NonRetryable(format!("failed to write input.json: {e}")))?;

    let cmd = ctx.config.cmd_for(ctx.role);
    if cmd.is_empty() {
        return Err(StepError::NonRetryable(format!(
            "no agent command configured for role {}",
            ctx.role
        )));
    }

    let prompt = norma_core::roles::render_template(role.prompt_template, &fields);

    // Step 6: invoke the agent.
    let invocation = invoke_agent(cmd, workspace_dir, logs_dir, &prompt, ctx.config.debug).await?;

    // Step 8 (checked alongside step 7 below): non-zero exit is retryable
    // regardless of whether stdout happens to contain parseable JSON.
    if invocation.exit_code != 0 {
        write_protocol_failure(step_dir, "agent_failed")?;
        return Err(StepError::Retryable(RetryableError::AgentFailed(
            invocation.exit_code,
        )));
    }

    // Step 7: parse the response. Prefer a pre-existing `output.json` the
    // agent wrote itself; fall back to stdout when it's absent or invalid.
    let stdout = String::from_utf8_lossy(&invocation.stdout);
    let response = match read_preexisting_output(step_dir) {
        Some(response) => response,
        None => match parse_agent_response(&stdout) {
            Ok(response) => response,
            Err(e) => {
                write_protocol_failure(step_dir, &format!("protocol_error: {e}"))?;
                return Err(StepError::Retryable(RetryableError::Unparseable(e)));
            }
        },
    };

    // Step 9: role-specific payload presence when status=ok.
    if response.status == "ok" {
        let payload = role_output_payload(ctx.role, &response);
        if let Err(reason) = validate_ok_payload(ctx.role, payload) {
            write_protocol_failure(step_dir, &format!("protocol_error: {reason}"))?;
            return Err(StepError::Retryable(RetryableError::MissingPayload));
        }
    }

    // Step 10: commit Do-step changes on success.
    if ctx.role == StepRole::Do && response.status == "ok" {
        git::commit_workspace(workspace_dir, &format!("do: {}", task.goal))?;
    }

    // Step 12: write output.json (the parsed response re-serialized).
    let output_json = serde_json::to_vec_pretty(&response)
        .map_err(|e| StepError::NonRetryable(format!("failed to serialize output.json: {e}")))?;
    std::fs::write(step_dir.join("output.json"), &output_json)
        .map_err(|e| StepError::NonRetryable(format!("failed to write output.json: {e}")))?;

    let status = StepStatus::from_str_opt(&response.status)
        .expect("parse_agent_response already validated status ∈ {ok,stop,fail,error}");
    let now = chrono::Utc::now();
    let step = Step {
        run_id: ctx.run_id.to_string(),
        step_index: ctx.step_index,
        role: ctx.role,
        iteration: ctx.iteration,
        status,
        step_dir: step_dir.display().to_string(),
        started_at: now,
        ended_at: Some(now),
        summary: Some(response.summary.text.clone()),
    };

    let events = vec![
        (
            EventPayload::StepStarted(StepStartedPayload {
                step_index: ctx.step_index,
                role: ctx.role,
                iteration: ctx.iteration,
                attempt: ctx.attempt,
            }),
            format!("{} step started", ctx.role),
        ),
        (
            EventPayload::StepFinished(StepFinishedPayload {
                step_index: ctx.step_index,
                role: ctx.role,
                status: response.status.clone(),
                protocol: None,
            }),
            format!("{} step finished: {}", ctx.role, response.status),
        ),
    ];

    Ok(StepExecution {
        step,
        response,
        events,
    })
}

/// Prefer `output.json` when the agent wrote one itself and it parses as a
/// valid `AgentResponse`; otherwise the caller falls back to stdout (spec
/// Section 13, Open Question #2).
fn read_preexisting_output(step_dir: &Path) -> Option<AgentResponse> {
    let content = std::fs::read_to_string(step_dir.join("output.json")).ok()?;
    parse_agent_response(&content).ok()
}

fn role_output_payload<'a>(role: StepRole, response: &'a AgentResponse) -> Option<&'a Value> {
    match role {
        StepRole::Plan => response.plan_output.as_ref(),
        StepRole::Do => response.do_output.as_ref(),
        StepRole::Check => response.check_output.as_ref(),
        StepRole::Act => response.act_output.as_ref(),
    }
}

fn write_protocol_failure(step_dir: &Path, protocol: &str) -> Result<(), StepError> {
    let output = ProtocolFailureOutput {
        status: "fail",
        protocol: protocol.to_string(),
    };
    let json = serde_json::to_vec_pretty(&output)
        .map_err(|e| StepError::NonRetryable(format!("failed to serialize failure output: {e}")))?;
    std::fs::write(step_dir.join("output.json"), json)
        .map_err(|e| StepError::NonRetryable(format!("failed to write output.json: {e}")))?;
    Ok(())
}

/// `{{field}}` values for the role's prompt template, drawn from the
/// role-specific input payload the controller assembled from TaskState.
fn build_prompt_fields(
    role: StepRole,
    task_id: &str,
    goal: &str,
    payload: Option<&Value>,
) -> HashMap<&'static str, String> {
    let mut fields = HashMap::new();
    fields.insert("task_id", task_id.to_string());
    fields.insert("goal", goal.to_string());

    let Some(payload) = payload else {
        return fields;
    };

    match role {
        StepRole::Plan => {}
        StepRole::Do => {
            fields.insert("work_plan", value_as_text(payload.get("work_plan")));
            fields.insert(
                "effective_criteria",
                value_as_text(
                    payload
                        .get("acceptance_criteria")
                        .and_then(|v| v.get("effective")),
                ),
            );
        }
        StepRole::Check => {
            fields.insert("work_plan", value_as_text(payload.get("work_plan")));
            fields.insert(
                "effective_criteria",
                value_as_text(
                    payload
                        .get("acceptance_criteria")
                        .and_then(|v| v.get("effective")),
                ),
            );
            fields.insert(
                "execution_summary",
                value_as_text(payload.get("execution_summary")),
            );
        }
        StepRole::Act => {
            fields.insert("verdict", value_as_text(payload.get("verdict")));
            fields.insert(
                "acceptance_results",
                value_as_text(payload.get("acceptance_results")),
            );
        }
    }

    fields
}

fn value_as_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn build_request(
    ctx: &StepContext<'_>,
    task: &Task,
    progress_path: &Path,
    workspace_dir: &Path,
    step_dir: &Path,
    role_payload: Option<Value>,
) -> AgentRequest {
    let mut request = AgentRequest {
        run: RunRef {
            id: ctx.run_id.to_string(),
            iteration: ctx.iteration,
        },
        task: TaskRef {
            id: task.id.clone(),
            title: task.goal.clone(),
            description: task.goal.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
        },
        step: StepRef {
            index: ctx.step_index,
            name: ctx.role,
        },
        paths: Paths {
            workspace_dir: workspace_dir.display().to_string(),
            run_dir: step_dir.display().to_string(),
            progress: progress_path.display().to_string(),
        },
        budgets: ctx.config.budgets,
        context: RequestContext {
            attempt: ctx.attempt,
            links: None,
            facts: None,
        },
        stop_reasons_allowed: vec![
            "budget_exhausted".to_string(),
            "blocked".to_string(),
            "needs_human".to_string(),
        ],
        plan_input: None,
        do_input: None,
        check_input: None,
        act_input: None,
    };

    match ctx.role {
        StepRole::Plan => request.plan_input = role_payload,
        StepRole::Do => request.do_input = role_payload,
        StepRole::Check => request.check_input = role_payload,
        StepRole::Act => request.act_input = role_payload,
    }

    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_dir_name_zero_pads_and_suffixes_retries() {
        assert_eq!(step_dir_name(1, StepRole::Plan, 1), "01-plan");
        assert_eq!(step_dir_name(12, StepRole::Do, 1), "12-do");
        assert_eq!(step_dir_name(3, StepRole::Check, 2), "03-check-retry-2");
    }

    #[test]
    fn prompt_fields_extract_do_payload() {
        let payload = serde_json::json!({
            "work_plan": "do the thing",
            "acceptance_criteria": {"effective": ["ac1"]},
        });
        let fields = build_prompt_fields(StepRole::Do, "norma-a3f2dd", "Fix it", Some(&payload));
        assert_eq!(fields.get("work_plan").unwrap(), "do the thing");
        assert_eq!(fields.get("effective_criteria").unwrap(), "[\"ac1\"]");
    }

    #[test]
    fn prompt_fields_without_payload_still_has_task_and_goal() {
        let fields = build_prompt_fields(StepRole::Plan, "norma-a3f2dd", "Fix it", None);
        assert_eq!(fields.get("task_id").unwrap(), "norma-a3f2dd");
        assert_eq!(fields.get("goal").unwrap(), "Fix it");
    }
}
