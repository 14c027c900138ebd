//! Error taxonomy for the orchestrator (spec Section 7).

use thiserror::Error;

/// Errors that abort the run and surface to the caller wrapped with
/// component context (spec Section 7: "Fatal").
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to acquire run lock: {0}")]
    LockAcquisition(String),
    #[error("failed to create run directory {path}: {source}")]
    RunDirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sql execution failed: {0}")]
    Sql(String),
    #[error("task-tracker read failed for initial task fetch: {0}")]
    TrackerRead(String),
    #[error("unknown role name: {0}")]
    UnknownRole(String),
    #[error("missing agent config for role {0}")]
    MissingAgentConfig(String),
}

/// Step-level errors absorbed by the iteration controller and retried up to
/// 3 attempts with `(attempt+1)s` linear backoff (spec Section 7: "Retryable").
#[derive(Debug, Error)]
pub enum RetryableError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailure(String),
    #[error("agent exited with non-zero status: {0}")]
    AgentFailed(i32),
    #[error("could not parse agent stdout: {0}")]
    Unparseable(#[from] crate::agent_io::ParseError),
    #[error("response failed schema validation: {0}")]
    SchemaMismatch(String),
    #[error("status=ok response is missing the role-specific payload")]
    MissingPayload,
}

/// Non-retryable errors that propagate immediately (spec Section 7.2:
/// "failure to create directories, disk full, context cancel").
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Retryable(#[from] RetryableError),
    #[error("non-retryable: {0}")]
    NonRetryable(String),
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_retryable_classification() {
        let retryable = StepError::Retryable(RetryableError::AgentFailed(1));
        assert!(retryable.is_retryable());

        let fatal = StepError::NonRetryable("disk full".to_string());
        assert!(!fatal.is_retryable());
    }
}
