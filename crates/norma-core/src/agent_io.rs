//! Agent request/response wire types and response parsing (spec Sections 4.6, 6).

use crate::types::StepRole;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRef {
    pub id: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<crate::types::AcceptanceCriterion>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepRef {
    pub index: u32,
    pub name: StepRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub workspace_dir: String,
    pub run_dir: String,
    pub progress: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<Value>,
}

/// Request body written to `input.json` (spec Section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run: RunRef,
    pub task: TaskRef,
    pub step: StepRef,
    pub paths: Paths,
    pub budgets: crate::config::Budgets,
    pub context: Context,
    pub stop_reasons_allowed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub title: String,
    #[serde(default)]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timing {
    pub wall_time_ms: u64,
}

/// Agent response, parsed from stdout and/or `output.json` (spec Section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub summary: Summary,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

const VALID_STATUSES: [&str; 4] = ["ok", "stop", "fail", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("stdout was not valid JSON and no `{{...}}` span could be extracted")]
    NoJsonFound,
    #[error("extracted span was not valid JSON: {0}")]
    Unparseable(serde_json::Error),
    #[error("failed to deserialize agent response: {0}")]
    Schema(serde_json::Error),
    #[error("status {0:?} is not one of ok|stop|fail|error")]
    InvalidStatus(String),
    #[error("do_output.files entry {0:?} is an absolute path or escapes the step directory")]
    UnsafeFilePath(String),
}

/// Strict JSON parse of `stdout`; on failure, extract the substring from the
/// first `{` to the last `}` and re-parse (spec Section 6: "Response parsing").
pub fn extract_json(stdout: &str) -> Result<Value, ParseError> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout) {
        return Ok(value);
    }
    let start = stdout.find('{');
    let end = stdout.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start <= end => {
            serde_json::from_str(&stdout[start..=end]).map_err(ParseError::Unparseable)
        }
        _ => Err(ParseError::NoJsonFound),
    }
}

/// Parse and validate an agent response from raw stdout (spec Section 6).
pub fn parse_agent_response(stdout: &str) -> Result<AgentResponse, ParseError> {
    let value = extract_json(stdout)?;
    let response: AgentResponse =
        serde_json::from_value(value).map_err(ParseError::Schema)?;

    if !VALID_STATUSES.contains(&response.status.as_str()) {
        return Err(ParseError::InvalidStatus(response.status.clone()));
    }

    if let Some(Value::Object(do_output)) = &response.do_output {
        if let Some(Value::Array(files)) = do_output.get("files") {
            for file in files {
                if let Value::String(path) = file {
                    if is_unsafe_path(path) {
                        return Err(ParseError::UnsafeFilePath(path.clone()));
                    }
                }
            }
        }
    }

    Ok(response)
}

fn is_unsafe_path(path: &str) -> bool {
    std::path::Path::new(path).is_absolute()
        || path
            .split('/')
            .any(|segment| segment == "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_prefers_strict_parse() {
        let value = extract_json(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn extract_json_falls_back_to_bracket_extraction() {
        let value = extract_json("garbage before {\"status\":\"ok\"} trailing garbage").unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn extract_json_is_idempotent_on_valid_json() {
        let input = r#"{"status":"ok","summary":{"text":"x"}}"#;
        let first = extract_json(input).unwrap();
        let reparsed = extract_json(&first.to_string()).unwrap();
        assert_eq!(first, reparsed);
    }

    #[test]
    fn rejects_invalid_status() {
        let stdout = r#"{"status":"weird","summary":{"text":"x"},"progress":{"title":"t","details":[]}}"#;
        let err = parse_agent_response(stdout).unwrap_err();
        assert!(matches!(err, ParseError::InvalidStatus(_)));
    }

    #[test]
    fn rejects_unsafe_file_paths() {
        let stdout = r#"{"status":"ok","summary":{"text":"x"},"progress":{"title":"t","details":[]},
            "do_output":{"files":["../escape.rs"]}}"#;
        let err = parse_agent_response(stdout).unwrap_err();
        assert!(matches!(err, ParseError::UnsafeFilePath(_)));
    }

    #[test]
    fn accepts_well_formed_ok_response() {
        let stdout = r#"{"status":"ok","summary":{"text":"done"},
            "progress":{"title":"t","details":["a"]},
            "do_output":{"files":["src/lib.rs"]}}"#;
        let response = parse_agent_response(stdout).unwrap();
        assert_eq!(response.status, "ok");
        assert_eq!(response.summary.text, "done");
    }
}
