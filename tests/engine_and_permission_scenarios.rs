//! End-to-end scenarios spanning the action parser, permission chain, and
//! the engine's one-action-per-iteration rule.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penguin_core::action::ActionStatus;
use penguin_core::action_executor::{ActionExecutor, ApprovalManager, ToolHandler, ToolRegistry, ToolSpec};
use penguin_core::engine::{Engine, ProviderAdapter, RunStatus, StreamCallback};
use penguin_core::event_bus::{EventBus, EventHandler, Priority};
use penguin_core::part_event::PartEventAdapter;
use penguin_core::permission::{AuditLog, AuditVerbosity, PermissionEnforcer, PermissionMode, WorkspaceBoundaryPolicy};
use penguin_core::session::{ConversationManager, Message};
use serde_json::{json, Value};
use tempfile::tempdir;

struct ScriptedResponder {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedResponder {
    fn new(responses: Vec<&str>) -> Self {
        ScriptedResponder {
            responses: std::sync::Mutex::new(responses.into_iter().rev().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedResponder {
    async fn get_response(&self, _messages: &[Message], _stream: bool, _stream_cb: Option<StreamCallback>) -> Result<String, String> {
        let mut responses = self.responses.lock().unwrap();
        Ok(responses.pop().unwrap_or_else(|| "done".to_string()))
    }
}

struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    async fn call(&self, payload: &Value) -> Result<String, String> {
        Ok(format!("wrote {}", payload.get("path").and_then(|v| v.as_str()).unwrap_or("")))
    }
}

fn write_tool_spec() -> ToolSpec {
    ToolSpec {
        name: "write_to_file".to_string(),
        required_operations: vec!["filesystem.write".to_string()],
        extract_resource: Box::new(|payload| payload.get("path").and_then(|v| v.as_str()).unwrap_or("").to_string()),
        handler: Arc::new(WriteFileTool),
    }
}

/// Scenario: a write to a system path is denied outright by the workspace
/// boundary policy, with no tool invocation taking place.
#[tokio::test]
async fn write_to_system_path_is_denied() {
    let workspace_root = tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    registry.register(penguin_core::action::ActionType::WriteToFile, write_tool_spec());

    let policy = WorkspaceBoundaryPolicy::new(PermissionMode::Workspace, workspace_root.path().to_path_buf());
    let permissions = Arc::new(PermissionEnforcer::new(false, vec![Arc::new(policy)], AuditLog::new(AuditVerbosity::All, 50, None)));
    let approvals = Arc::new(ApprovalManager::new(Duration::from_millis(50)));
    let conversations = Arc::new(ConversationManager::new(10_000));
    conversations.ensure_agent("default", None).await;
    let event_bus = Arc::new(EventBus::new());
    let executor = ActionExecutor::new(registry, permissions, approvals, conversations, event_bus);

    let parser = penguin_core::action::ActionParser::new();
    let actions = parser.parse("<write_to_file>{\"path\":\"/etc/passwd\",\"content\":\"oops\"}</write_to_file>");
    let result = executor.execute(&actions[0], "default", 1).await;

    assert_eq!(result.status, ActionStatus::Denied);
}

struct RequestIdCapture(Arc<std::sync::Mutex<Option<String>>>);

#[async_trait]
impl EventHandler for RequestIdCapture {
    async fn handle(&self, _event_name: &str, payload: &Value) {
        if let Some(id) = payload.get("request_id").and_then(|v| v.as_str()) {
            *self.0.lock().unwrap() = Some(id.to_string());
        }
    }
}

/// Scenario: a sensitive path triggers ASK; approving it via the
/// `ApprovalManager` lets the tool run to completion.
#[tokio::test]
async fn sensitive_path_asks_then_executes_on_approval() {
    let workspace_root = tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    registry.register(penguin_core::action::ActionType::WriteToFile, write_tool_spec());

    let policy = WorkspaceBoundaryPolicy::new(PermissionMode::Workspace, workspace_root.path().to_path_buf());
    let permissions = Arc::new(PermissionEnforcer::new(false, vec![Arc::new(policy)], AuditLog::new(AuditVerbosity::All, 50, None)));
    let approvals = Arc::new(ApprovalManager::new(Duration::from_secs(5)));
    let conversations = Arc::new(ConversationManager::new(10_000));
    conversations.ensure_agent("default", None).await;
    let event_bus = Arc::new(EventBus::new());

    let captured_id = Arc::new(std::sync::Mutex::new(None));
    event_bus
        .subscribe("approval.requested", Arc::new(RequestIdCapture(captured_id.clone())), Priority::Normal)
        .await;

    let executor = Arc::new(ActionExecutor::new(registry, permissions, approvals.clone(), conversations, event_bus));

    let parser = penguin_core::action::ActionParser::new();
    let path = workspace_root.path().join(".env");
    let actions = parser.parse(&format!("<write_to_file>{{\"path\":\"{}\",\"content\":\"SECRET=1\"}}</write_to_file>", path.display()));

    let executor_for_task = executor.clone();
    let action = actions[0].clone();
    let handle = tokio::spawn(async move { executor_for_task.execute(&action, "default", 1).await });

    // Give the approval request time to register, then approve it.
    let mut pending_id = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending_id = captured_id.lock().unwrap().clone();
        if pending_id.is_some() {
            break;
        }
    }
    approvals.resolve(&pending_id.expect("an approval should have been requested"), true).await;

    let result = handle.await.unwrap();
    assert_eq!(result.status, ActionStatus::Completed);
}

/// Property: exactly one action is parsed and executed per `_llm_step`,
/// even when the model emits two action tags in the same response.
#[tokio::test]
async fn engine_executes_at_most_one_action_per_iteration() {
    let conversations = Arc::new(ConversationManager::new(10_000));
    let event_bus = Arc::new(EventBus::new());
    let part_events = Arc::new(PartEventAdapter::new(event_bus.clone(), "sess".to_string()));
    let permissions = Arc::new(PermissionEnforcer::new(true, vec![], AuditLog::new(AuditVerbosity::All, 10, None)));
    let approvals = Arc::new(ApprovalManager::new(Duration::from_millis(50)));
    let mut registry = ToolRegistry::new();
    registry.register(penguin_core::action::ActionType::WriteToFile, write_tool_spec());
    let action_executor = Arc::new(ActionExecutor::new(registry, permissions, approvals, conversations.clone(), event_bus.clone()));

    let provider = Arc::new(ScriptedResponder::new(vec![
        "<write_to_file>{\"path\":\"a.txt\",\"content\":\"x\"}</write_to_file> <write_to_file>{\"path\":\"b.txt\",\"content\":\"y\"}</write_to_file>",
        ".",
        ".",
        ".",
    ]));

    let engine = Engine::new(conversations, provider, action_executor, event_bus, part_events);
    let result = engine.run_response("go", Some(10), None).await.unwrap();

    assert_eq!(result.action_results.len(), 1, "only the first action tag should have been executed");
    assert_eq!(result.status, RunStatus::Completed);
}

/// Sanity check that a workspace-root `PathBuf` round-trips through config
/// defaults without panicking, exercising the seam `Client` relies on.
#[test]
fn workspace_root_is_a_plain_path() {
    let root: PathBuf = tempdir().unwrap().path().to_path_buf();
    assert!(root.is_absolute());
}
