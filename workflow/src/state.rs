use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal and non-terminal statuses a workflow can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("unknown"))
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
    }
}

/// The four ITUV phases plus the bracketing pseudo-phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Pending,
    Implement,
    Test,
    Use,
    Verify,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowPhase {
    /// The phase that follows this one on success, in ITUV order.
    pub fn next(self) -> WorkflowPhase {
        match self {
            WorkflowPhase::Pending => WorkflowPhase::Implement,
            WorkflowPhase::Implement => WorkflowPhase::Test,
            WorkflowPhase::Test => WorkflowPhase::Use,
            WorkflowPhase::Use => WorkflowPhase::Verify,
            WorkflowPhase::Verify => WorkflowPhase::Completed,
            other => other,
        }
    }

    /// 1-indexed position among the four ITUV phases, used for progress math.
    pub fn ordinal(self) -> Option<u32> {
        match self {
            WorkflowPhase::Implement => Some(1),
            WorkflowPhase::Test => Some(2),
            WorkflowPhase::Use => Some(3),
            WorkflowPhase::Verify => Some(4),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("unknown"))
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
    }
}

/// The outcome recorded for a single phase's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: WorkflowPhase,
    pub success: bool,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Durable state for one ITUV run. This is the single source of truth on
/// restart: the native backend does not survive a mid-phase crash, so a
/// `Running`/in-progress-phase row found at backend construction time is
/// marked `Failed` with `error_message = "process exited"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub task_id: String,
    pub blueprint_id: Option<String>,
    pub project_id: Option<String>,
    pub status: WorkflowStatus,
    pub phase: WorkflowPhase,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context_snapshot_id: Option<String>,
    pub phase_results: Vec<PhaseResult>,
    pub artifacts: Value,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: String, task_id: String, blueprint_id: Option<String>, config: Value) -> Self {
        let now = Utc::now();
        WorkflowState {
            workflow_id,
            task_id,
            blueprint_id,
            project_id: None,
            status: WorkflowStatus::Pending,
            phase: WorkflowPhase::Pending,
            progress: 0,
            started_at: None,
            updated_at: now,
            completed_at: None,
            context_snapshot_id: None,
            phase_results: Vec::new(),
            artifacts: Value::Object(Default::default()),
            error_message: None,
            retry_count: 0,
            config,
            created_at: now,
        }
    }

    pub fn to_info(&self) -> WorkflowInfo {
        WorkflowInfo {
            workflow_id: self.workflow_id.clone(),
            task_id: self.task_id.clone(),
            status: self.status,
            phase: self.phase,
            progress: self.progress,
            error_message: self.error_message.clone(),
        }
    }
}

/// The trimmed-down view returned by status/list queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub task_id: String,
    pub status: WorkflowStatus,
    pub phase: WorkflowPhase,
    pub progress: u8,
    pub error_message: Option<String>,
}

/// An append-only snapshot of a phase's working context, referenced by
/// `WorkflowState::context_snapshot_id`. GC'd alongside its owning workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub snapshot_id: String,
    pub workflow_id: String,
    pub phase: WorkflowPhase,
    pub created_at: DateTime<Utc>,
    pub conversation_history: Value,
    pub tool_outputs: Value,
    pub metadata: Value,
}
