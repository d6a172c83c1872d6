//! Thin embedder-facing facade (component K): wires config into the
//! concrete collaborators and exposes the handful of calls a host
//! application needs without touching `Engine`/`ConversationManager`
//! directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::action_executor::{ActionExecutor, ApprovalManager, ToolRegistry};
use crate::config::PenguinConfig;
use crate::engine::{Engine, ProviderAdapter, RunResult, StreamCallback};
use crate::error::{PenguinError, Result};
use crate::event_bus::EventBus;
use crate::message_bus::MessageBus;
use crate::part_event::PartEventAdapter;
use crate::permission::{AuditLog, PermissionEnforcer, WorkspaceBoundaryPolicy};
use crate::session::{AgentRecord, ConversationManager};
use workflow::{Feedback, NativeOrchestrationBackend, PhaseExecutor, PhaseOutcome, PhaseTimeouts, RetryPolicy, WorkflowInfo, WorkflowPhase};

/// Bridges the workflow crate's phase-execution seam to this crate's
/// `Engine`, translating an ITUV phase into a single `run_task` call. Kept
/// separate from `Client` so it can be hung off an `Arc` the backend holds
/// without the backend needing to know about `Client` itself.
struct EngineExecutor {
    engine: Arc<Engine>,
}

#[async_trait]
impl PhaseExecutor for EngineExecutor {
    async fn execute_phase(
        &self,
        workflow_id: &str,
        task_id: &str,
        phase: WorkflowPhase,
        config: &Value,
        feedback: Arc<TokioMutex<mpsc::UnboundedReceiver<Feedback>>>,
    ) -> std::result::Result<PhaseOutcome, String> {
        // Drain any feedback queued before this phase started so a prior
        // `inject_feedback` isn't silently dropped.
        let mut pending_feedback = Vec::new();
        {
            let mut rx = feedback.lock().await;
            while let Ok(payload) = rx.try_recv() {
                pending_feedback.push(payload);
            }
        }

        let agent_id = format!("workflow:{}", workflow_id);
        let prompt = format!(
            "[{} phase] task {}\nconfig: {}\nfeedback: {}",
            phase,
            task_id,
            config,
            serde_json::to_string(&pending_feedback).unwrap_or_default(),
        );

        let result = self
            .engine
            .run_task(&prompt, Some(200), Some(&agent_id), false)
            .await
            .map_err(|e| e.to_string())?;

        Ok(PhaseOutcome {
            success: !matches!(result.status, crate::engine::RunStatus::Error | crate::engine::RunStatus::LlmEmptyResponseError),
            output: result.assistant_response,
            artifacts: serde_json::json!({}),
            tool_outputs: serde_json::json!({
                "action_results": result.action_results,
            }),
        })
    }
}

pub struct Client {
    config: PenguinConfig,
    conversations: Arc<ConversationManager>,
    event_bus: Arc<EventBus>,
    message_bus: Arc<MessageBus>,
    permissions: Arc<PermissionEnforcer>,
    engine: Arc<Engine>,
    orchestration: Option<Arc<NativeOrchestrationBackend>>,
}

impl Client {
    /// Builds every collaborator from `config` and wires them together the
    /// way the external-interfaces section describes. `provider` is the
    /// embedder's LLM adapter; `workspace_root` anchors the built-in
    /// `WorkspaceBoundaryPolicy`.
    pub async fn new(config: PenguinConfig, provider: Arc<dyn ProviderAdapter>, workspace_root: PathBuf) -> Result<Self> {
        let conversations = Arc::new(ConversationManager::new(config.max_history_tokens));
        let event_bus = Arc::new(EventBus::new());
        let message_bus = Arc::new(MessageBus::new(event_bus.clone(), conversations.clone()));

        let boundary_policy = WorkspaceBoundaryPolicy::new(config.permissions_mode, workspace_root);
        let audit = AuditLog::new(config.audit_verbosity, config.audit_max_memory_entries, config.audit_log_file.clone());
        let permissions = Arc::new(
            PermissionEnforcer::new(config.yolo, vec![Arc::new(boundary_policy)], audit)
                .with_session_allowlist(config.require_approval.clone()),
        );

        let approvals = Arc::new(ApprovalManager::new(Duration::from_secs(300)));
        let action_executor = Arc::new(ActionExecutor::new(ToolRegistry::new(), permissions.clone(), approvals, conversations.clone(), event_bus.clone()));
        let part_events = Arc::new(PartEventAdapter::new(event_bus.clone(), "default-session".to_string()));

        let engine = Arc::new(Engine::new(conversations.clone(), provider, action_executor, event_bus.clone(), part_events));
        engine.register_agent(crate::engine::DEFAULT_AGENT_ID, None).await;

        let orchestration = if config.orchestration_backend == "native" {
            let executor: Arc<dyn PhaseExecutor> = Arc::new(EngineExecutor { engine: engine.clone() });
            let retry_policy = RetryPolicy {
                max_retries: config.default_max_retries,
                ..RetryPolicy::default()
            };
            let timeouts = PhaseTimeouts {
                implement: config.phase_timeouts.implement_secs,
                test: config.phase_timeouts.test_secs,
                use_: config.phase_timeouts.use_secs,
                verify: config.phase_timeouts.verify_secs,
            };
            std::fs::create_dir_all(&config.workflow_state_dir).map_err(|e| PenguinError::Storage(e.to_string()))?;
            let db_path = config.workflow_state_dir.join("workflows.sqlite3");
            let backend = NativeOrchestrationBackend::open(&db_path, executor, retry_policy, timeouts)?;
            backend.recover_from_cold_start().await?;
            Some(Arc::new(backend))
        } else {
            log::warn!("orchestration backend '{}' is not implemented; workflow calls will error", config.orchestration_backend);
            None
        };

        Ok(Client { config, conversations, event_bus, message_bus, permissions, engine, orchestration })
    }

    pub fn config(&self) -> &PenguinConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.message_bus
    }

    pub fn permissions(&self) -> &Arc<PermissionEnforcer> {
        &self.permissions
    }

    pub async fn create_agent(&self, agent_id: &str, system_prompt: Option<String>) -> Result<AgentRecord> {
        self.engine.register_agent(agent_id, system_prompt).await;
        self.conversations
            .get_agent(agent_id)
            .await
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: agent_id.to_string() })
    }

    pub async fn create_sub_agent(
        &self,
        agent_id: &str,
        parent_id: &str,
        share_session: bool,
        share_context_window: bool,
        shared_cw_max_tokens: Option<usize>,
    ) -> Result<AgentRecord> {
        self.conversations
            .create_sub_agent(agent_id, parent_id, share_session, share_context_window, shared_cw_max_tokens)
            .await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        self.engine.unregister_agent(agent_id).await
    }

    /// `chat`: one user turn through a single `_llm_step`.
    pub async fn chat(&self, prompt: &str, agent: Option<&str>) -> Result<(String, Vec<crate::action::ActionResult>)> {
        self.engine.run_single_turn(prompt, agent).await
    }

    /// `stream_chat`: the streaming counterpart of `chat`.
    pub async fn stream_chat(&self, prompt: &str, agent: Option<&str>, on_chunk: StreamCallback) -> Result<(String, Vec<crate::action::ActionResult>)> {
        self.engine.stream(prompt, agent, on_chunk).await
    }

    /// Runs the full reasoning loop until a stop condition, an empty
    /// response run, or `max_iterations` is reached.
    pub async fn execute_response(&self, prompt: &str, max_iterations: Option<usize>, agent: Option<&str>) -> Result<RunResult> {
        self.engine.run_response(prompt, max_iterations, agent).await
    }

    pub async fn send_to_agent(&self, sender: &str, recipient: &str, content: &str) -> Result<()> {
        self.message_bus
            .send(sender, recipient, content, crate::message_bus::MessageType::Message, None, None)
            .await?;
        Ok(())
    }

    pub async fn send_to_human(&self, sender: &str, content: &str) -> Result<()> {
        self.message_bus.send_to_human(sender, content).await?;
        Ok(())
    }

    pub async fn human_reply(&self, recipient: &str, content: &str) -> Result<()> {
        self.message_bus.human_reply(recipient, content).await?;
        Ok(())
    }

    /// `execute_task` / `start_run_mode`: hands a task prompt to the ITUV
    /// orchestration backend rather than running it inline.
    pub async fn execute_task(&self, task_id: &str, blueprint_id: Option<String>, config: Value) -> Result<String> {
        let backend = self.orchestration_backend()?;
        Ok(backend.start_workflow(task_id, blueprint_id, config).await?)
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowInfo> {
        Ok(self.orchestration_backend()?.get_workflow_status(workflow_id).await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowInfo>> {
        Ok(self.orchestration_backend()?.list_workflows(None).await?)
    }

    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        Ok(self.orchestration_backend()?.pause_workflow(workflow_id).await?)
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        Ok(self.orchestration_backend()?.resume_workflow(workflow_id).await?)
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        Ok(self.orchestration_backend()?.cancel_workflow(workflow_id).await?)
    }

    pub async fn inject_feedback(&self, workflow_id: &str, payload: Value) -> Result<()> {
        Ok(self.orchestration_backend()?.inject_feedback(workflow_id, payload).await?)
    }

    pub async fn cleanup_completed_workflows(&self) -> Result<usize> {
        Ok(self.orchestration_backend()?.cleanup_completed(self.config.cleanup_completed_after_days).await?)
    }

    fn orchestration_backend(&self) -> Result<&Arc<NativeOrchestrationBackend>> {
        self.orchestration
            .as_ref()
            .ok_or_else(|| PenguinError::Storage(format!("orchestration backend '{}' is unavailable", self.config.orchestration_backend)))
    }

    /// `get_token_usage`: total tokens currently tracked for an agent's
    /// context window.
    pub async fn token_usage(&self, agent_id: &str) -> Result<usize> {
        let record = self
            .conversations
            .get_agent(agent_id)
            .await
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: agent_id.to_string() })?;
        let total_tokens = record.context_window.read().await.total_tokens();
        Ok(total_tokens)
    }

    pub async fn system_info(&self) -> Value {
        serde_json::json!({
            "orchestration_backend": self.config.orchestration_backend,
            "permissions_mode": format!("{:?}", self.config.permissions_mode),
            "yolo": self.config.yolo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Message;
    use tempfile::tempdir;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        async fn get_response(&self, messages: &[Message], _stream: bool, _stream_cb: Option<StreamCallback>) -> std::result::Result<String, String> {
            Ok(format!("echo: {}", messages.last().map(|m| m.content.clone()).unwrap_or_default()))
        }
    }

    #[tokio::test]
    async fn chat_round_trips_through_the_engine() {
        let dir = tempdir().unwrap();
        let mut config = PenguinConfig::default();
        config.yolo = true;
        config.workflow_state_dir = dir.path().join("workflows");

        let client = Client::new(config, Arc::new(Echo), dir.path().to_path_buf()).await.unwrap();
        let (response, _) = client.chat("hello", None).await.unwrap();
        assert_eq!(response, "echo: hello");
    }

    #[tokio::test]
    async fn execute_task_reaches_completion_via_native_backend() {
        let dir = tempdir().unwrap();
        let mut config = PenguinConfig::default();
        config.yolo = true;
        config.workflow_state_dir = dir.path().join("workflows");

        let client = Client::new(config, Arc::new(Echo), dir.path().to_path_buf()).await.unwrap();
        let workflow_id = client.execute_task("T1", None, serde_json::json!({})).await.unwrap();

        for _ in 0..50 {
            let info = client.workflow_status(&workflow_id).await.unwrap();
            if info.status == workflow::WorkflowStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workflow did not complete in time");
    }
}
