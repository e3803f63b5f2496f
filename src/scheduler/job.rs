use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, OrchestratorError};
use crate::request::PayloadRef;

/// Where a job's work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Local,
    Remote,
    Hybrid,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Remote => write!(f, "remote"),
            ExecutionMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Routing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Routing)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Routing, Executing)
                | (Routing, Failed)
                | (Routing, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    /// Cancellation is immediate only before a worker has accepted the work.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobState::Queued | JobState::Routing)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Routing => write!(f, "routing"),
            JobState::Executing => write!(f, "executing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub payload_ref: PayloadRef,
    pub cached: bool,
    /// `local` or `remote`, whichever produced the payload.
    pub mode: ExecutionMode,
    pub model_used: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
    pub transient: bool,
    /// Sub-commands that finished before the failure, in execution order.
    pub completed_sub_commands: Vec<String>,
    /// Output of the last completed step, if any.
    pub last_payload: Option<PayloadRef>,
}

impl JobFailure {
    pub fn from_error(err: &OrchestratorError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            transient: err.is_transient(),
            completed_sub_commands: Vec::new(),
            last_payload: None,
        }
    }

    pub fn with_progress(mut self, completed: Vec<String>, last_payload: Option<PayloadRef>) -> Self {
        self.completed_sub_commands = completed;
        self.last_payload = last_payload;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub service_id: String,
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    pub mode: Option<ExecutionMode>,
    pub total_steps: usize,
    pub completed_sub_commands: Vec<String>,
    pub intermediate_payload: Option<PayloadRef>,
    pub result: Option<JobResult>,
    pub failure: Option<JobFailure>,
    /// Set when a cancel request is accepted. Status output only: the driver
    /// stops on the job's cancellation token, and this flag lets callers tell
    /// a cancelled executing job (which ends Failed) from an ordinary failure.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: String, service_id: String, total_steps: usize) -> Self {
        Self {
            id,
            service_id,
            state: JobState::Queued,
            progress: 0,
            message: "queued".to_string(),
            mode: None,
            total_steps: total_steps.max(1),
            completed_sub_commands: Vec::new(),
            intermediate_payload: None,
            result: None,
            failure: None,
            cancel_requested: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to `next`, returning false if the transition is not allowed.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Progress never moves backwards.
    pub fn advance_progress(&mut self, progress: u8) -> u8 {
        self.progress = self.progress.max(progress.min(100));
        self.progress
    }

    /// `floor(100 * completed / total)`.
    pub fn step_progress(completed: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        ((100 * completed.min(total)) / total) as u8
    }
}
