//! Task data model: records, the status state machine, progress and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::ArtifactRef;
use crate::error::TaskError;
use crate::session::Action;

/// Longest accepted instruction, in characters.
pub const MAX_INSTRUCTION_LEN: usize = 4000;

/// Most explicit steps a single request may carry.
pub const MAX_STEPS: usize = 50;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the execution queue.
    Queued,
    /// Currently driving the automation session.
    Running,
    /// All steps succeeded.
    Completed,
    /// A step or the session failed.
    Error,
    /// Removed from the queue before it started.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) | (Running, Completed) | (Running, Error)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A task as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Natural-language description of what to do.
    pub instruction: String,
    /// Page to start from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Explicit action list; takes precedence over `url`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Action>,
    /// Opaque caller data, stored untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskRequest {
    /// Create a request with only an instruction.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            url: None,
            steps: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the start URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set explicit steps.
    pub fn with_steps(mut self, steps: Vec<Action>) -> Self {
        self.steps = steps;
        self
    }

    /// Reject malformed requests before a record is created.
    pub fn validate(&self) -> Result<(), TaskError> {
        let instruction = self.instruction.trim();
        if instruction.is_empty() {
            return Err(TaskError::InvalidRequest(
                "instruction must not be empty".to_string(),
            ));
        }
        let len = instruction.chars().count();
        if len > MAX_INSTRUCTION_LEN {
            return Err(TaskError::InvalidRequest(format!(
                "instruction too long: {len} > {MAX_INSTRUCTION_LEN} characters"
            )));
        }
        if let Some(url) = &self.url {
            validate_url(url)?;
        }
        if self.steps.len() > MAX_STEPS {
            return Err(TaskError::InvalidRequest(format!(
                "too many steps: {} > {MAX_STEPS}",
                self.steps.len()
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|reason| TaskError::InvalidRequest(format!("step {i}: {reason}")))?;
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), TaskError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(TaskError::InvalidRequest(format!(
            "url must start with http:// or https://, got '{url}'"
        )))
    }
}

/// One timestamped, human-readable progress message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a single executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Position in the plan, starting at 0.
    pub index: usize,
    /// Short action name (`navigate`, `click`, ...).
    pub action: String,
    pub success: bool,
    pub message: String,
    /// Screenshot captured after this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    pub duration_ms: u64,
}

impl StepRecord {
    /// Record for a step about to run.
    pub fn new(index: usize, action: &Action) -> Self {
        Self {
            index,
            action: action.label().to_string(),
            success: false,
            message: action.describe(),
            artifact: None,
            duration_ms: 0,
        }
    }

    /// Mark the step as successful.
    pub fn succeed(mut self, message: impl Into<String>, duration: std::time::Duration) -> Self {
        self.success = true;
        self.message = message.into();
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Mark the step as failed.
    pub fn fail(mut self, error: impl Into<String>, duration: std::time::Duration) -> Self {
        self.success = false;
        self.message = error.into();
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Final payload of a task; set exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub summary: String,
    pub steps: Vec<StepRecord>,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// Result for a task whose steps all succeeded.
    pub fn completed(steps: Vec<StepRecord>, artifacts: Vec<ArtifactRef>) -> Self {
        let summary = format!("Completed {} step(s)", steps.len());
        Self {
            summary,
            steps,
            artifacts,
            error: None,
        }
    }

    /// Result for a task that stopped on an error.
    pub fn failed(
        steps: Vec<StepRecord>,
        artifacts: Vec<ArtifactRef>,
        error: impl Into<String>,
    ) -> Self {
        let succeeded = steps.iter().filter(|s| s.success).count();
        Self {
            summary: format!("Failed after {succeeded} successful step(s)"),
            steps,
            artifacts,
            error: Some(error.into()),
        }
    }

    /// Result for a task cancelled before it started.
    pub fn cancelled() -> Self {
        Self {
            summary: "Cancelled before execution".to_string(),
            steps: Vec::new(),
            artifacts: Vec::new(),
            error: Some("cancelled by caller".to_string()),
        }
    }
}

/// The stored state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub status: TaskStatus,
    pub request: TaskRequest,
    pub progress: Vec<ProgressEntry>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a caller asks to cancel a task that is already running.
    pub cancel_requested: bool,
}

impl TaskRecord {
    /// Create a new queued record.
    pub fn new(request: TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Queued,
            request,
            progress: Vec::new(),
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        }
    }

    /// Move to a non-terminal status.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if target.is_terminal() {
            // Terminal transitions must carry a result; see `finish`.
            return Err(self.invalid(target));
        }
        self.check_transition(target)?;
        self.status = target;
        if target == TaskStatus::Running {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to a terminal status and set the result, both at once.
    pub fn finish(&mut self, target: TaskStatus, result: TaskResult) -> Result<(), TaskError> {
        if !target.is_terminal() || self.result.is_some() {
            return Err(self.invalid(target));
        }
        self.check_transition(target)?;
        self.status = target;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Append a progress message. Timestamps never go backwards.
    pub fn push_progress(&mut self, message: impl Into<String>) -> ProgressEntry {
        let mut timestamp = Utc::now();
        if let Some(last) = self.progress.last()
            && last.timestamp > timestamp
        {
            timestamp = last.timestamp;
        }
        let entry = ProgressEntry {
            message: message.into(),
            timestamp,
        };
        self.progress.push(entry.clone());
        entry
    }

    /// Whether the record is older than `max_age` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.created_at) > max_age
    }

    fn check_transition(&self, target: TaskStatus) -> Result<(), TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(target) {
            return Err(self.invalid(target));
        }
        Ok(())
    }

    fn invalid(&self, target: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id,
            from: self.status,
            to: target,
        }
    }
}

/// Read-only view returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: Vec<ProgressEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Tasks ahead of this one in the execution queue, while queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

impl From<TaskRecord> for TaskSnapshot {
    fn from(record: TaskRecord) -> Self {
        Self {
            task_id: record.id,
            status: record.status,
            progress: record.progress,
            result: record.result,
            created_at: record.created_at,
            updated_at: record.updated_at,
            cancel_requested: record.cancel_requested,
            queue_position: None,
        }
    }
}

/// Row in a task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id,
            status: record.status,
            created_at: record.created_at,
        }
    }
}

/// Change notifications pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged { task_id: Uuid, status: TaskStatus },
    Progress { task_id: Uuid, entry: ProgressEntry },
    Evicted { task_id: Uuid },
}

impl TaskEvent {
    /// Get the task ID from any variant.
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::StatusChanged { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Evicted { task_id } => *task_id,
        }
    }

    /// Whether no further events will follow for this task.
    pub fn is_final(&self) -> bool {
        match self {
            Self::StatusChanged { status, .. } => status.is_terminal(),
            Self::Evicted { .. } => true,
            Self::Progress { .. } => false,
        }
    }
}
