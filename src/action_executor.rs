//! Tool resolution, permission gating, dispatch, and the approval flow for
//! ASK results (component E).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::action::{Action, ActionResult, ActionStatus, ActionType};
use crate::event_bus::EventBus;
use crate::permission::PermissionEnforcer;
use crate::session::ConversationManager;

const TRUNCATE_DISPLAY_CHARS: usize = 200;

/// A registered tool. `required_operations` lists the namespaced
/// permission operations the tool needs (e.g. `apply_diff` needs both a
/// read and a write), and `extract_resource` pulls the canonical resource
/// (path/URL/command/query) out of a parsed payload.
pub struct ToolSpec {
    pub name: String,
    pub required_operations: Vec<String>,
    pub extract_resource: Box<dyn Fn(&Value) -> String + Send + Sync>,
    pub handler: Arc<dyn ToolHandler>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, payload: &Value) -> Result<String, String>;
}

/// Maps [`ActionType`] to a [`ToolSpec`], resolved at registration time
/// (not per call) — the typed-registry replacement for the source's
/// string-keyed `importlib` dispatch (spec section 9).
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<ActionType, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: HashMap::new() }
    }

    pub fn register(&mut self, action_type: ActionType, spec: ToolSpec) {
        self.tools.insert(action_type, spec);
    }

    pub fn get(&self, action_type: ActionType) -> Option<&ToolSpec> {
        self.tools.get(&action_type)
    }
}

/// Tracks ASK decisions pending human input. An expired approval is
/// treated identically to a denial (spec section 9's explicit resolution).
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    default_timeout: Duration,
}

impl ApprovalManager {
    pub fn new(default_timeout: Duration) -> Self {
        ApprovalManager { pending: Mutex::new(HashMap::new()), default_timeout }
    }

    /// Opens a request and blocks (cooperatively) until `resolve` is
    /// called with the same id, or the timeout elapses.
    pub async fn request_and_wait(&self, request_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.to_string(), tx);

        match tokio::time::timeout(self.default_timeout, rx).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => {
                self.pending.lock().await.remove(request_id);
                false
            }
        }
    }

    pub async fn resolve(&self, request_id: &str, approved: bool) -> bool {
        if let Some(sender) = self.pending.lock().await.remove(request_id) {
            let _ = sender.send(approved);
            true
        } else {
            false
        }
    }
}

pub struct ActionExecutor {
    registry: ToolRegistry,
    permissions: Arc<PermissionEnforcer>,
    approvals: Arc<ApprovalManager>,
    pub(crate) conversations: Arc<ConversationManager>,
    event_bus: Arc<EventBus>,
}

impl ActionExecutor {
    pub fn new(
        registry: ToolRegistry,
        permissions: Arc<PermissionEnforcer>,
        approvals: Arc<ApprovalManager>,
        conversations: Arc<ConversationManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        ActionExecutor { registry, permissions, approvals, conversations, event_bus }
    }

    pub async fn execute(&self, action: &Action, agent_id: &str, parent_message_id: u64) -> ActionResult {
        let started_at = Utc::now();
        let tag_name = action.tag_name();

        let payload = match &action.payload {
            Some(payload) => payload.clone(),
            None => {
                return self
                    .finish(tag_name, ActionStatus::Error, "malformed payload: could not parse required JSON".to_string(), agent_id, parent_message_id, started_at)
                    .await;
            }
        };

        if matches!(action.action_type, ActionType::FinishResponse | ActionType::FinishTask) {
            return self.finish(tag_name, ActionStatus::Completed, action.raw_payload.clone(), agent_id, parent_message_id, started_at).await;
        }

        let spec = match self.registry.get(action.action_type) {
            Some(spec) => spec,
            None => {
                return self
                    .finish(tag_name, ActionStatus::Error, format!("no tool registered for '{}'", tag_name), agent_id, parent_message_id, started_at)
                    .await;
            }
        };

        let resource = (spec.extract_resource)(&payload);

        let mut saw_ask = false;
        for operation in &spec.required_operations {
            let check = self
                .permissions
                .check(operation, &resource, HashMap::new(), Some(agent_id.to_string()), Some(spec.name.clone()))
                .await;

            match check.result {
                crate::permission::PermissionResult::Deny => {
                    return self.finish(tag_name, ActionStatus::Denied, check.reason, agent_id, parent_message_id, started_at).await;
                }
                crate::permission::PermissionResult::Ask => saw_ask = true,
                crate::permission::PermissionResult::Allow => {}
            }
        }

        if saw_ask {
            let request_id = Uuid::new_v4().to_string();
            self.event_bus
                .emit("approval.requested", serde_json::json!({"request_id": request_id, "operation": tag_name, "resource": resource}))
                .await;
            let approved = self.approvals.request_and_wait(&request_id).await;
            if !approved {
                return self
                    .finish(tag_name, ActionStatus::Denied, "approval denied or expired".to_string(), agent_id, parent_message_id, started_at)
                    .await;
            }
        }

        self.event_bus.emit("tool", serde_json::json!({"phase": "start", "action": tag_name, "resource": resource})).await;

        let (status, output) = match spec.handler.call(&payload).await {
            Ok(output) => (ActionStatus::Completed, output),
            Err(error) => (ActionStatus::Error, error),
        };

        let display_output: String = output.chars().take(TRUNCATE_DISPLAY_CHARS).collect();
        self.event_bus
            .emit("tool", serde_json::json!({"phase": "end", "action": tag_name, "status": format!("{:?}", status), "output": display_output}))
            .await;

        self.finish(tag_name, status, output, agent_id, parent_message_id, started_at).await
    }

    async fn finish(
        &self,
        tag_name: &str,
        status: ActionStatus,
        output: String,
        agent_id: &str,
        parent_message_id: u64,
        started_at: chrono::DateTime<Utc>,
    ) -> ActionResult {
        let _ = self
            .conversations
            .add_action_result(agent_id, tag_name, &output, &format!("{:?}", status).to_lowercase(), parent_message_id)
            .await;

        ActionResult {
            action_name: tag_name.to_string(),
            status,
            output,
            artifacts: None,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionParser;
    use crate::permission::{AuditLog, AuditVerbosity};
    use std::time::Duration as StdDuration;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, payload: &Value) -> Result<String, String> {
            Ok(payload.to_string())
        }
    }

    fn build_executor() -> ActionExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(
            ActionType::ReadFile,
            ToolSpec {
                name: "read_file".to_string(),
                required_operations: vec!["filesystem.read".to_string()],
                extract_resource: Box::new(|payload| payload.get("path").and_then(|v| v.as_str()).unwrap_or("").to_string()),
                handler: Arc::new(EchoTool),
            },
        );
        let permissions = Arc::new(PermissionEnforcer::new(true, vec![], AuditLog::new(AuditVerbosity::All, 10, None)));
        let approvals = Arc::new(ApprovalManager::new(StdDuration::from_millis(50)));
        let conversations = Arc::new(ConversationManager::new(10_000));
        let event_bus = Arc::new(EventBus::new());
        ActionExecutor::new(registry, permissions, approvals, conversations, event_bus)
    }

    #[tokio::test]
    async fn yolo_mode_executes_tool_successfully() {
        let executor = build_executor();
        executor.conversations.ensure_agent("default", None).await;
        let parser = ActionParser::new();
        let actions = parser.parse("<read_file>{\"path\":\"x.txt\"}</read_file>");
        let result = executor.execute(&actions[0], "default", 1).await;
        assert_eq!(result.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn unregistered_tool_is_an_error() {
        let executor = build_executor();
        executor.conversations.ensure_agent("default", None).await;
        let parser = ActionParser::new();
        let actions = parser.parse("<search>{\"query\":\"rust\"}</search>");
        let result = executor.execute(&actions[0], "default", 1).await;
        assert_eq!(result.status, ActionStatus::Error);
    }
}
