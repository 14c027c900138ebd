//! Per-role prompt templates and output-payload schemas (spec Sections 4.6, 4.7).

use crate::errors::FatalError;
use crate::types::StepRole;
use serde_json::{json, Value};
use std::collections::HashMap;

/// A role's prompt template and the JSON schema its `*_output` payload
/// must satisfy when `status=ok`.
#[derive(Debug, Clone)]
pub struct Role {
    pub role: StepRole,
    pub prompt_template: &'static str,
    pub output_schema: Value,
}

/// Looks up the fixed set of 4 PDCA roles by name.
#[derive(Debug, Default)]
pub struct RoleRegistry;

impl RoleRegistry {
    pub fn get(&self, role: StepRole) -> Role {
        match role {
            StepRole::Plan => Role {
                role,
                prompt_template: PLAN_PROMPT,
                output_schema: plan_schema(),
            },
            StepRole::Do => Role {
                role,
                prompt_template: DO_PROMPT,
                output_schema: do_schema(),
            },
            StepRole::Check => Role {
                role,
                prompt_template: CHECK_PROMPT,
                output_schema: check_schema(),
            },
            StepRole::Act => Role {
                role,
                prompt_template: ACT_PROMPT,
                output_schema: act_schema(),
            },
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Role, FatalError> {
        StepRole::from_str_opt(name)
            .map(|role| self.get(role))
            .ok_or_else(|| FatalError::UnknownRole(name.to_string()))
    }
}

const PLAN_PROMPT: &str = "Plan the work for task {{task_id}}.\n\nGoal: {{goal}}\n";

const DO_PROMPT: &str =
    "Execute the work plan for task {{task_id}}.\n\nWork plan:\n{{work_plan}}\n\nEffective acceptance criteria:\n{{effective_criteria}}\n";

const CHECK_PROMPT: &str =
    "Verify task {{task_id}} against its acceptance criteria.\n\nWork plan:\n{{work_plan}}\n\nEffective acceptance criteria:\n{{effective_criteria}}\n\nExecution summary:\n{{execution_summary}}\n";

const ACT_PROMPT: &str =
    "Decide the next action for task {{task_id}}.\n\nCheck verdict: {{verdict}}\n\nAcceptance results:\n{{acceptance_results}}\n";

/// Minimal `{{field}}` substitution, no conditionals or loops (spec doesn't
/// call for a templating engine beyond this).
pub fn render_template(template: &str, fields: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in fields {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["work_plan"],
        "properties": {
            "work_plan": {"type": "string"},
            "acceptance_criteria": {
                "type": "object",
                "properties": { "effective": {"type": "array"} }
            }
        }
    })
}

fn do_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary"],
        "properties": {
            "summary": {"type": "string"},
            "files": {"type": "array", "items": {"type": "string"}}
        }
    })
}

fn check_schema() -> Value {
    json!({
        "type": "object",
        "required": ["verdict"],
        "properties": {
            "verdict": {
                "type": "object",
                "required": ["status"],
                "properties": {
                    "status": {"type": "string", "enum": ["PASS", "FAIL"]}
                }
            }
        }
    })
}

fn act_schema() -> Value {
    json!({
        "type": "object",
        "required": ["decision"],
        "properties": {
            "decision": {"type": "string", "enum": ["close", "continue", "replan"]}
        }
    })
}

/// Validate `status=ok` role-specific payload presence (spec Section 4.6,
/// step 9).
pub fn validate_ok_payload(role: StepRole, payload: Option<&Value>) -> Result<(), String> {
    let Some(payload) = payload else {
        return Err(format!("{role} output missing when status=ok"));
    };

    match role {
        StepRole::Plan => {
            if payload.get("work_plan").is_none() {
                return Err("plan output missing work_plan".to_string());
            }
        }
        StepRole::Do => {}
        StepRole::Check => {
            let status = payload
                .get("verdict")
                .and_then(|v| v.get("status"))
                .and_then(Value::as_str);
            match status {
                Some("PASS") | Some("FAIL") => {}
                _ => return Err("check output missing verdict.status in {PASS,FAIL}".to_string()),
            }
        }
        StepRole::Act => {
            let decision = payload.get("decision").and_then(Value::as_str);
            match decision {
                Some("close") | Some("continue") | Some("replan") => {}
                _ => {
                    return Err(
                        "act output missing decision in {close,continue,replan}".to_string()
                    )
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_roles_by_name() {
        let registry = RoleRegistry;
        for role in StepRole::ALL {
            let resolved = registry.get_by_name(role.as_str()).unwrap();
            assert_eq!(resolved.role, role);
        }
    }

    #[test]
    fn registry_rejects_unknown_role() {
        let registry = RoleRegistry;
        let err = registry.get_by_name("bogus").unwrap_err();
        assert!(matches!(err, FatalError::UnknownRole(_)));
    }

    #[test]
    fn render_template_substitutes_fields() {
        let mut fields = HashMap::new();
        fields.insert("task_id", "norma-a3f2dd".to_string());
        fields.insert("goal", "Fix panic".to_string());
        let rendered = render_template(PLAN_PROMPT, &fields);
        assert!(rendered.contains("task norma-a3f2dd"));
        assert!(rendered.contains("Goal: Fix panic"));
    }

    #[test]
    fn validate_check_payload_requires_pass_or_fail() {
        assert!(validate_ok_payload(StepRole::Check, Some(&json!({"verdict": {"status": "PASS"}})))
            .is_ok());
        assert!(validate_ok_payload(
            StepRole::Check,
            Some(&json!({"verdict": {"status": "MAYBE"}}))
        )
        .is_err());
    }

    #[test]
    fn validate_act_payload_requires_known_decision() {
        assert!(validate_ok_payload(StepRole::Act, Some(&json!({"decision": "close"}))).is_ok());
        assert!(validate_ok_payload(StepRole::Act, Some(&json!({"decision": "unknown"}))).is_err());
    }

    #[test]
    fn validate_payload_requires_presence() {
        assert!(validate_ok_payload(StepRole::Plan, None).is_err());
    }
}
