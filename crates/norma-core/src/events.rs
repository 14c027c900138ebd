//! Event type names and payloads for the run store's audit log
//! (spec Section 3: `Event`).

use crate::types::StepRole;
use serde::{Deserialize, Serialize};

/// Event type names (spec Section 3, stored verbatim in `events.event_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    StepStarted,
    StepFinished,
    StepRetried,
    RunPassed,
    RunFailed,
    RunStopped,
    MergeCommitted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::StepRetried => "STEP_RETRIED",
            Self::RunPassed => "RUN_PASSED",
            Self::RunFailed => "RUN_FAILED",
            Self::RunStopped => "RUN_STOPPED",
            Self::MergeCommitted => "MERGE_COMMITTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub task_id: String,
    pub goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStartedPayload {
    pub step_index: u32,
    pub role: StepRole,
    pub iteration: u32,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub step_index: u32,
    pub role: StepRole,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRetriedPayload {
    pub step_index: u32,
    pub role: StepRole,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPassedPayload {
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStoppedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeCommittedPayload {
    pub commit_message_subject: String,
}

/// Union of all event payloads. Used to compute `event_type` and to
/// serialize `events.data_json`; the row itself keeps `type`/`message` as
/// plain columns (spec Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    StepStarted(StepStartedPayload),
    StepFinished(StepFinishedPayload),
    StepRetried(StepRetriedPayload),
    RunPassed(RunPassedPayload),
    RunFailed(RunFailedPayload),
    RunStopped(RunStoppedPayload),
    MergeCommitted(MergeCommittedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::StepStarted(_) => EventType::StepStarted,
            Self::StepFinished(_) => EventType::StepFinished,
            Self::StepRetried(_) => EventType::StepRetried,
            Self::RunPassed(_) => EventType::RunPassed,
            Self::RunFailed(_) => EventType::RunFailed,
            Self::RunStopped(_) => EventType::RunStopped,
            Self::MergeCommitted(_) => EventType::MergeCommitted,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventType::RunStarted).unwrap(),
            "\"RUN_STARTED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::StepFinished).unwrap(),
            "\"STEP_FINISHED\""
        );
    }

    #[test]
    fn step_finished_payload_round_trips() {
        let payload = EventPayload::StepFinished(StepFinishedPayload {
            step_index: 3,
            role: StepRole::Check,
            status: "ok".to_string(),
            protocol: None,
        });
        assert_eq!(payload.event_type(), EventType::StepFinished);
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"check\""));
        assert!(!json.contains("protocol"));
    }

    #[test]
    fn run_stopped_payload_omits_null_reason() {
        let payload = EventPayload::RunStopped(RunStoppedPayload { stop_reason: None });
        let json = payload.to_json().unwrap();
        assert_eq!(json, "{}");
    }
}
