pub mod agent_io;
pub mod branch;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod progress;
pub mod roles;
pub mod task_id;
pub mod types;

pub use agent_io::{parse_agent_response, AgentRequest, AgentResponse};
pub use branch::{merge_commit_message, task_branch_name};
pub use config::Config;
pub use errors::{FatalError, RetryableError, StepError};
pub use events::{EventPayload, EventType};
pub use ids::new_run_id;
pub use progress::render_progress_md;
pub use roles::RoleRegistry;
pub use task_id::is_valid_task_id;
pub use types::{
    AcceptanceCriterion, Event, Id, JournalEntry, Run, RunStatus, Step, StepRole, StepStatus,
    Task, TaskState,
};
