use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queries::{snapshot as snapshot_queries, workflow as workflow_queries};
use crate::retry::RetryPolicy;
use crate::schema;
use crate::state::{ContextSnapshot, PhaseResult, WorkflowInfo, WorkflowPhase, WorkflowState, WorkflowStatus};

/// A feedback payload delivered via `inject_feedback`, consumed by a phase
/// implementation that is awaiting human input (`waiting_input`).
pub type Feedback = Value;

/// The outcome of running one ITUV phase.
pub struct PhaseOutcome {
    pub success: bool,
    pub output: String,
    pub artifacts: Value,
    pub tool_outputs: Value,
}

/// Implemented by the embedder (the `penguin-core` Client facade drives an
/// `Engine` here); the workflow crate only knows the state machine, not how
/// a phase is actually carried out.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute_phase(
        &self,
        workflow_id: &str,
        task_id: &str,
        phase: WorkflowPhase,
        config: &Value,
        feedback: Arc<Mutex<mpsc::UnboundedReceiver<Feedback>>>,
    ) -> std::result::Result<PhaseOutcome, String>;
}

struct WorkflowHandle {
    task: JoinHandle<()>,
    feedback_tx: mpsc::UnboundedSender<Feedback>,
}

/// Per-phase timeout configuration, in seconds.
#[derive(Debug, Clone)]
pub struct PhaseTimeouts {
    pub implement: u64,
    pub test: u64,
    pub use_: u64,
    pub verify: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        PhaseTimeouts {
            implement: 300,
            test: 300,
            use_: 300,
            verify: 300,
        }
    }
}

impl PhaseTimeouts {
    fn for_phase(&self, phase: WorkflowPhase) -> u64 {
        match phase {
            WorkflowPhase::Implement => self.implement,
            WorkflowPhase::Test => self.test,
            WorkflowPhase::Use => self.use_,
            WorkflowPhase::Verify => self.verify,
            _ => 300,
        }
    }
}

/// The native (non-Temporal) durable ITUV backend. State lives in SQLite;
/// each in-flight workflow is one tokio task. Cancellation and pausing are
/// cooperative flags checked at phase boundaries.
pub struct NativeOrchestrationBackend {
    conn: Arc<Mutex<Connection>>,
    executor: Arc<dyn PhaseExecutor>,
    retry_policy: RetryPolicy,
    timeouts: PhaseTimeouts,
    handles: Arc<Mutex<HashMap<String, WorkflowHandle>>>,
    paused: Arc<Mutex<HashSet<String>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl NativeOrchestrationBackend {
    pub fn open(
        db_path: &Path,
        executor: Arc<dyn PhaseExecutor>,
        retry_policy: RetryPolicy,
        timeouts: PhaseTimeouts,
    ) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        schema::init_schema(&conn)?;

        let backend = NativeOrchestrationBackend {
            conn: Arc::new(Mutex::new(conn)),
            executor,
            retry_policy,
            timeouts,
            handles: Arc::new(Mutex::new(HashMap::new())),
            paused: Arc::new(Mutex::new(HashSet::new())),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        };
        Ok(backend)
    }

    pub fn open_in_memory(executor: Arc<dyn PhaseExecutor>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(NativeOrchestrationBackend {
            conn: Arc::new(Mutex::new(conn)),
            executor,
            retry_policy: RetryPolicy::default(),
            timeouts: PhaseTimeouts::default(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            paused: Arc::new(Mutex::new(HashSet::new())),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Marks any workflow left in a non-terminal status as failed. Must be
    /// called once at process startup, before any `start_workflow` calls,
    /// since the native backend does not survive mid-phase crashes.
    pub async fn recover_from_cold_start(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let stale = workflow_queries::list_non_terminal(&conn)?;
        for mut state in stale {
            state.status = WorkflowStatus::Failed;
            state.phase = WorkflowPhase::Failed;
            state.error_message = Some("process exited".to_string());
            state.updated_at = Utc::now();
            state.completed_at = Some(Utc::now());
            workflow_queries::update(&conn, &state)?;
        }
        let count = workflow_queries::list(&conn, Some(WorkflowStatus::Failed))?
            .iter()
            .filter(|w| w.error_message.as_deref() == Some("process exited"))
            .count();
        Ok(count)
    }

    pub async fn start_workflow(
        &self,
        task_id: &str,
        blueprint_id: Option<String>,
        config: Value,
    ) -> Result<String> {
        let workflow_id = Uuid::new_v4().to_string();
        let mut state = WorkflowState::new(workflow_id.clone(), task_id.to_string(), blueprint_id, config);
        state.status = WorkflowStatus::Running;
        state.phase = WorkflowPhase::Implement;
        state.started_at = Some(Utc::now());

        {
            let conn = self.conn.lock().await;
            workflow_queries::insert(&conn, &state)?;
        }

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let runner = self.clone_for_runner();
        let wf_id = workflow_id.clone();
        let task = tokio::spawn(async move {
            runner.run_workflow(wf_id, feedback_rx).await;
        });

        self.handles
            .lock()
            .await
            .insert(workflow_id.clone(), WorkflowHandle { task, feedback_tx });

        Ok(workflow_id)
    }

    fn clone_for_runner(&self) -> RunnerContext {
        RunnerContext {
            conn: self.conn.clone(),
            executor: self.executor.clone(),
            retry_policy: self.retry_policy,
            timeouts: self.timeouts.clone(),
            paused: self.paused.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowInfo> {
        let conn = self.conn.lock().await;
        let state = workflow_queries::get(&conn, workflow_id)?.ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        Ok(state.to_info())
    }

    pub async fn get_workflow_result(&self, workflow_id: &str) -> Result<WorkflowState> {
        let conn = self.conn.lock().await;
        workflow_queries::get(&conn, workflow_id)?.ok_or_else(|| Error::NotFound(workflow_id.to_string()))
    }

    pub async fn query_workflow(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.get_workflow_result(workflow_id).await
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowInfo>> {
        let conn = self.conn.lock().await;
        Ok(workflow_queries::list(&conn, status)?.iter().map(WorkflowState::to_info).collect())
    }

    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_known(workflow_id).await?;
        self.paused.lock().await.insert(workflow_id.to_string());

        let conn = self.conn.lock().await;
        if let Some(mut state) = workflow_queries::get(&conn, workflow_id)? {
            state.status = WorkflowStatus::Paused;
            state.updated_at = Utc::now();
            workflow_queries::update(&conn, &state)?;
        }
        Ok(())
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_known(workflow_id).await?;
        self.paused.lock().await.remove(workflow_id);

        let conn = self.conn.lock().await;
        if let Some(mut state) = workflow_queries::get(&conn, workflow_id)? {
            if state.status == WorkflowStatus::Paused {
                state.status = WorkflowStatus::Running;
                state.updated_at = Utc::now();
                workflow_queries::update(&conn, &state)?;
            }
        }
        Ok(())
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.ensure_known(workflow_id).await?;
        self.cancelled.lock().await.insert(workflow_id.to_string());
        if let Some(handle) = self.handles.lock().await.get(workflow_id) {
            handle.task.abort();
        }
        let conn = self.conn.lock().await;
        if let Some(mut state) = workflow_queries::get(&conn, workflow_id)? {
            if !state.status.is_terminal() {
                state.status = WorkflowStatus::Cancelled;
                state.phase = WorkflowPhase::Cancelled;
                state.updated_at = Utc::now();
                state.completed_at = Some(Utc::now());
                workflow_queries::update(&conn, &state)?;
            }
        }
        Ok(())
    }

    pub async fn inject_feedback(&self, workflow_id: &str, payload: Feedback) -> Result<()> {
        let handles = self.handles.lock().await;
        let handle = handles
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        handle
            .feedback_tx
            .send(payload)
            .map_err(|_| Error::InvalidSignal {
                workflow_id: workflow_id.to_string(),
                signal: "inject_feedback".to_string(),
            })
    }

    pub async fn cleanup_completed(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let conn = self.conn.lock().await;
        workflow_queries::delete_older_than(&conn, cutoff)
    }

    async fn ensure_known(&self, workflow_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        workflow_queries::get(&conn, workflow_id)?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))
    }
}

/// The state a running workflow's task needs, cloned out of the backend so
/// the spawned task doesn't borrow `self`.
#[derive(Clone)]
struct RunnerContext {
    conn: Arc<Mutex<Connection>>,
    executor: Arc<dyn PhaseExecutor>,
    retry_policy: RetryPolicy,
    timeouts: PhaseTimeouts,
    paused: Arc<Mutex<HashSet<String>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl RunnerContext {
    async fn is_cancelled(&self, workflow_id: &str) -> bool {
        self.cancelled.lock().await.contains(workflow_id)
    }

    async fn wait_while_paused(&self, workflow_id: &str) {
        loop {
            if !self.paused.lock().await.contains(workflow_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn run_workflow(self, workflow_id: String, feedback_rx: mpsc::UnboundedReceiver<Feedback>) {
        let feedback_rx = Arc::new(Mutex::new(feedback_rx));
        let phases = [
            WorkflowPhase::Implement,
            WorkflowPhase::Test,
            WorkflowPhase::Use,
            WorkflowPhase::Verify,
        ];

        let (task_id, config) = {
            let conn = self.conn.lock().await;
            match workflow_queries::get(&conn, &workflow_id) {
                Ok(Some(state)) => (state.task_id, state.config),
                _ => return,
            }
        };

        for phase in phases {
            if self.is_cancelled(&workflow_id).await {
                return;
            }
            self.wait_while_paused(&workflow_id).await;
            if self.is_cancelled(&workflow_id).await {
                return;
            }

            match self.run_phase_with_retry(&workflow_id, &task_id, phase, &config, feedback_rx.clone()).await {
                Ok(outcome) => {
                    if let Err(e) = self.record_phase_success(&workflow_id, phase, outcome).await {
                        log::error!("failed to persist phase success for workflow {}: {}", workflow_id, e);
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("workflow {} failed in phase {}: {}", workflow_id, phase, e);
                    let _ = self.record_phase_failure(&workflow_id, phase, &e).await;
                    return;
                }
            }
        }

        let _ = self.record_completion(&workflow_id).await;
    }

    async fn run_phase_with_retry(
        &self,
        workflow_id: &str,
        task_id: &str,
        phase: WorkflowPhase,
        config: &Value,
        feedback_rx: Arc<Mutex<mpsc::UnboundedReceiver<Feedback>>>,
    ) -> std::result::Result<PhaseOutcome, String> {
        let timeout = std::time::Duration::from_secs(self.timeouts.for_phase(phase));
        let mut last_error = String::new();

        for attempt in 1..=self.retry_policy.max_retries.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.retry_policy.delay_for(attempt - 1)).await;
            }

            let fut = self
                .executor
                .execute_phase(workflow_id, task_id, phase, config, feedback_rx.clone());

            let result = tokio::time::timeout(timeout, fut).await;
            match result {
                Ok(Ok(outcome)) if outcome.success => return Ok(outcome),
                Ok(Ok(outcome)) => last_error = outcome.output,
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = format!("phase '{}' timed out after {:?}", phase, timeout),
            }

            self.bump_retry_count(workflow_id).await;
        }

        Err(last_error)
    }

    async fn bump_retry_count(&self, workflow_id: &str) {
        let conn = self.conn.lock().await;
        if let Ok(Some(mut state)) = workflow_queries::get(&conn, workflow_id) {
            state.retry_count += 1;
            state.updated_at = Utc::now();
            let _ = workflow_queries::update(&conn, &state);
        }
    }

    async fn record_phase_success(&self, workflow_id: &str, phase: WorkflowPhase, outcome: PhaseOutcome) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut state = workflow_queries::get(&conn, workflow_id)?.ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;

        let now = Utc::now();
        state.phase_results.push(PhaseResult {
            phase,
            success: true,
            output: outcome.output,
            started_at: now,
            completed_at: now,
            retry_count: state.retry_count,
        });
        if let Value::Object(existing) = &mut state.artifacts {
            if let Value::Object(new) = outcome.artifacts {
                existing.extend(new);
            }
        }
        let completed_phases = phase.ordinal().unwrap_or(0);
        state.progress = ((completed_phases * 100) / 4) as u8;
        state.phase = phase.next();
        state.updated_at = now;

        let snapshot = ContextSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            phase,
            created_at: now,
            conversation_history: Value::Array(vec![]),
            tool_outputs: outcome.tool_outputs,
            metadata: Value::Object(Default::default()),
        };
        snapshot_queries::insert(&conn, &snapshot)?;
        state.context_snapshot_id = Some(snapshot.snapshot_id);

        workflow_queries::update(&conn, &state)?;
        Ok(())
    }

    async fn record_phase_failure(&self, workflow_id: &str, phase: WorkflowPhase, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut state = workflow_queries::get(&conn, workflow_id)?.ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        let now = Utc::now();
        state.phase_results.push(PhaseResult {
            phase,
            success: false,
            output: error.to_string(),
            started_at: now,
            completed_at: now,
            retry_count: state.retry_count,
        });
        state.status = WorkflowStatus::Failed;
        state.phase = WorkflowPhase::Failed;
        state.error_message = Some(error.to_string());
        state.updated_at = now;
        state.completed_at = Some(now);
        workflow_queries::update(&conn, &state)
    }

    async fn record_completion(&self, workflow_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut state = workflow_queries::get(&conn, workflow_id)?.ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        let now = Utc::now();
        state.status = WorkflowStatus::Completed;
        state.phase = WorkflowPhase::Completed;
        state.progress = 100;
        state.updated_at = now;
        state.completed_at = Some(now);
        workflow_queries::update(&conn, &state)
    }
}
