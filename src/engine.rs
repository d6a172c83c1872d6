//! The reasoning/action loop (component H): `run_single_turn`, `run_response`,
//! `run_task`, `stream`, stop conditions, and the agent registry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::action::{extract_finish_status, ActionResult, ActionStatus, ActionType};
use crate::action_executor::ActionExecutor;
use crate::error::{PenguinError, Result};
use crate::event_bus::EventBus;
use crate::part_event::PartEventAdapter;
use crate::session::{ConversationManager, Message};

pub const DEFAULT_AGENT_ID: &str = "default";

/// `(chunk, kind)` where `kind` is `"assistant"` or `"reasoning"`.
pub type StreamCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// The provider adapter contract this crate consumes (spec section 6); the
/// concrete HTTP client is out of scope and supplied by the embedder.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn get_response(
        &self,
        messages: &[Message],
        stream: bool,
        stream_cb: Option<StreamCallback>,
    ) -> std::result::Result<String, String>;

    /// Surfaces a provider-side (structured tool calling) invocation made
    /// during the most recent `get_response`, if any.
    fn get_and_clear_last_tool_call(&self) -> Option<(String, String)> {
        None
    }
}

#[async_trait]
pub trait StopCondition: Send + Sync {
    async fn should_stop(&self, engine: &Engine, agent_id: &str) -> bool;
    fn name(&self) -> &str {
        "stop_condition"
    }
}

pub struct TokenBudgetStop;

#[async_trait]
impl StopCondition for TokenBudgetStop {
    async fn should_stop(&self, engine: &Engine, agent_id: &str) -> bool {
        match engine.conversations.get_agent(agent_id).await {
            Some(record) => record.context_window.read().await.is_over_budget(),
            None => false,
        }
    }

    fn name(&self) -> &str {
        "token_budget"
    }
}

pub struct WallClockStop {
    pub limit: Duration,
}

#[async_trait]
impl StopCondition for WallClockStop {
    async fn should_stop(&self, engine: &Engine, _agent_id: &str) -> bool {
        engine.elapsed().await >= self.limit
    }

    fn name(&self) -> &str {
        "wall_clock"
    }
}

pub struct ExternalCallbackStop {
    pub callback: Arc<dyn Fn() -> bool + Send + Sync>,
}

#[async_trait]
impl StopCondition for ExternalCallbackStop {
    async fn should_stop(&self, _engine: &Engine, _agent_id: &str) -> bool {
        (self.callback)()
    }

    fn name(&self) -> &str {
        "external_callback"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    MaxIterations,
    Error,
    Stopped,
    LlmEmptyResponseError,
}

pub struct RunResult {
    pub assistant_response: String,
    pub iterations: usize,
    pub action_results: Vec<ActionResult>,
    pub status: RunStatus,
    pub execution_time: Duration,
    /// The `[FINISH_STATUS:..]` marker extracted from a `finish_task`
    /// tool's output (spec section 4.H.3), e.g. `pending_review`. `None`
    /// outside `run_task`, or when the run never reached `finish_task`.
    pub finish_status: Option<String>,
}

struct LlmStepResult {
    assistant_response: String,
    action_results: Vec<ActionResult>,
}

/// The reasoning loop. One `Engine` drives any number of registered agents
/// sharing the same provider, conversation manager, and action pipeline.
pub struct Engine {
    conversations: Arc<ConversationManager>,
    provider: Arc<dyn ProviderAdapter>,
    action_parser: crate::action::ActionParser,
    action_executor: Arc<ActionExecutor>,
    event_bus: Arc<EventBus>,
    part_events: Arc<PartEventAdapter>,
    stop_conditions: Mutex<Vec<Arc<dyn StopCondition>>>,
    registered_agents: Mutex<Vec<String>>,
    default_agent_id: Mutex<String>,
    interrupted: AtomicBool,
    current_iteration: AtomicUsize,
    start_time: Mutex<Option<Instant>>,
    forced_tool_choice_name: Mutex<Option<String>>,
}

impl Engine {
    pub fn new(
        conversations: Arc<ConversationManager>,
        provider: Arc<dyn ProviderAdapter>,
        action_executor: Arc<ActionExecutor>,
        event_bus: Arc<EventBus>,
        part_events: Arc<PartEventAdapter>,
    ) -> Self {
        Engine {
            conversations,
            provider,
            action_parser: crate::action::ActionParser::new(),
            action_executor,
            event_bus,
            part_events,
            stop_conditions: Mutex::new(Vec::new()),
            registered_agents: Mutex::new(vec![DEFAULT_AGENT_ID.to_string()]),
            default_agent_id: Mutex::new(DEFAULT_AGENT_ID.to_string()),
            interrupted: AtomicBool::new(false),
            current_iteration: AtomicUsize::new(0),
            start_time: Mutex::new(None),
            forced_tool_choice_name: Mutex::new(None),
        }
    }

    pub async fn add_stop_condition(&self, condition: Arc<dyn StopCondition>) {
        self.stop_conditions.lock().await.push(condition);
    }

    pub async fn register_agent(&self, agent_id: &str, system_prompt: Option<String>) {
        self.conversations.ensure_agent(agent_id, system_prompt).await;
        let mut agents = self.registered_agents.lock().await;
        if !agents.iter().any(|id| id == agent_id) {
            agents.push(agent_id.to_string());
        }
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        if agent_id == DEFAULT_AGENT_ID {
            return Err(PenguinError::UnknownAgent { agent_id: "default agent cannot be unregistered".to_string() });
        }
        self.registered_agents.lock().await.retain(|id| id != agent_id);
        Ok(())
    }

    pub async fn set_default_agent(&self, agent_id: &str) -> Result<()> {
        if self.conversations.get_agent(agent_id).await.is_none() {
            return Err(PenguinError::UnknownAgent { agent_id: agent_id.to_string() });
        }
        *self.default_agent_id.lock().await = agent_id.to_string();
        Ok(())
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }

    pub fn current_iteration(&self) -> usize {
        self.current_iteration.load(Ordering::SeqCst)
    }

    async fn elapsed(&self) -> Duration {
        self.start_time.lock().await.map(|t| t.elapsed()).unwrap_or_default()
    }

    async fn resolve_agent(&self, explicit: Option<&str>) -> String {
        if let Some(id) = explicit {
            return id.to_string();
        }
        self.default_agent_id.lock().await.clone()
    }

    /// `run_single_turn` (spec section 4.H.1): one user turn, one `_llm_step`.
    pub async fn run_single_turn(&self, prompt: &str, agent: Option<&str>) -> Result<(String, Vec<ActionResult>)> {
        let agent_id = self.resolve_agent(agent).await;
        self.conversations.ensure_agent(&agent_id, None).await;
        self.conversations.add_user_message(&agent_id, prompt, None).await?;
        let step = self.llm_step(&agent_id, false, None).await?;
        Ok((step.assistant_response, step.action_results))
    }

    /// `run_response` (spec section 4.H.2): the conversational loop.
    pub async fn run_response(&self, prompt: &str, max_iterations: Option<usize>, agent: Option<&str>) -> Result<RunResult> {
        let agent_id = self.resolve_agent(agent).await;
        self.conversations.ensure_agent(&agent_id, None).await;
        self.conversations.add_user_message(&agent_id, prompt, None).await?;

        *self.start_time.lock().await = Some(Instant::now());
        self.current_iteration.store(0, Ordering::SeqCst);
        self.clear_interrupt();

        let max_iterations = max_iterations.unwrap_or(5000);
        let mut empty_response_counter = 0u32;
        let mut last_response = String::new();
        let mut all_results = Vec::new();
        let mut status = RunStatus::MaxIterations;

        for iteration in 1..=max_iterations {
            self.current_iteration.store(iteration, Ordering::SeqCst);

            for condition in self.stop_conditions.lock().await.iter() {
                if condition.should_stop(self, &agent_id).await {
                    log::debug!("run_response: stop condition '{}' triggered at iteration {}", condition.name(), iteration);
                    status = RunStatus::Stopped;
                    break;
                }
            }
            if status == RunStatus::Stopped {
                break;
            }

            if self.interrupted.load(Ordering::SeqCst) {
                status = RunStatus::Stopped;
                break;
            }

            let step = match self.llm_step(&agent_id, true, None).await {
                Ok(step) => step,
                Err(PenguinError::LlmEmptyResponse { .. }) => {
                    status = RunStatus::LlmEmptyResponseError;
                    break;
                }
                Err(_) => {
                    status = RunStatus::Error;
                    break;
                }
            };

            self.conversations.save().await?;

            last_response = step.assistant_response.clone();
            let finished_response = step.action_results.iter().any(|r| r.action_name == "finish_response");
            all_results.extend(step.action_results);

            if finished_response {
                status = RunStatus::Completed;
                break;
            }

            let non_whitespace = last_response.chars().filter(|c| !c.is_whitespace()).count();
            if non_whitespace < 10 {
                empty_response_counter += 1;
                if empty_response_counter >= 3 {
                    status = RunStatus::Completed;
                    break;
                }
            } else {
                empty_response_counter = 0;
            }
        }

        Ok(RunResult {
            assistant_response: last_response,
            iterations: self.current_iteration(),
            action_results: all_results,
            status,
            execution_time: self.elapsed().await,
            finish_status: None,
        })
    }

    /// `run_task` (spec section 4.H.3): same loop shape as `run_response`,
    /// with `TaskEvent` publication and `finish_task`-marker termination.
    pub async fn run_task(&self, task_prompt: &str, max_iterations: Option<usize>, agent: Option<&str>, enable_events: bool) -> Result<RunResult> {
        let agent_id = self.resolve_agent(agent).await;
        self.conversations.ensure_agent(&agent_id, None).await;
        self.conversations.add_user_message(&agent_id, task_prompt, None).await?;

        *self.start_time.lock().await = Some(Instant::now());
        self.current_iteration.store(0, Ordering::SeqCst);
        self.clear_interrupt();

        if enable_events {
            self.event_bus.emit("task.started", serde_json::json!({"agent_id": agent_id})).await;
        }

        let max_iterations = max_iterations.unwrap_or(5000);
        let mut empty_response_counter = 0u32;
        let mut last_response = String::new();
        let mut all_results = Vec::new();
        let mut status = RunStatus::MaxIterations;
        let mut finish_status: Option<String> = None;

        for iteration in 1..=max_iterations {
            self.current_iteration.store(iteration, Ordering::SeqCst);

            let mut stop_triggered = false;
            for condition in self.stop_conditions.lock().await.iter() {
                if condition.should_stop(self, &agent_id).await {
                    stop_triggered = true;
                    break;
                }
            }
            if stop_triggered || self.interrupted.load(Ordering::SeqCst) {
                status = RunStatus::Stopped;
                break;
            }

            let step = match self.llm_step(&agent_id, true, None).await {
                Ok(step) => step,
                Err(PenguinError::LlmEmptyResponse { .. }) => {
                    if enable_events {
                        self.event_bus.emit("task.failed", serde_json::json!({"agent_id": agent_id, "reason": "empty_response"})).await;
                    }
                    status = RunStatus::LlmEmptyResponseError;
                    break;
                }
                Err(e) => {
                    if enable_events {
                        self.event_bus.emit("task.failed", serde_json::json!({"agent_id": agent_id, "reason": e.to_string()})).await;
                    }
                    status = RunStatus::Error;
                    break;
                }
            };

            tokio::spawn({
                let conversations = self.conversations.clone();
                async move {
                    if let Err(e) = conversations.save().await {
                        log::error!("background save failed: {}", e);
                    }
                }
            });

            last_response = step.assistant_response.clone();

            if enable_events {
                self.event_bus
                    .emit("task.progressed", serde_json::json!({"agent_id": agent_id, "progress": (100 * iteration / max_iterations).min(100)}))
                    .await;
            }

            let finish_task_result = step.action_results.iter().find(|r| r.action_name == "finish_task").cloned();
            all_results.extend(step.action_results);

            if let Some(result) = finish_task_result {
                finish_status = Some(extract_finish_status(&result.output).unwrap_or_else(|| "pending_review".to_string()));
                status = RunStatus::Completed;
                break;
            }

            let non_whitespace = last_response.chars().filter(|c| !c.is_whitespace()).count();
            if non_whitespace < 10 {
                empty_response_counter += 1;
                if empty_response_counter >= 3 {
                    status = RunStatus::Completed;
                    break;
                }
            } else {
                empty_response_counter = 0;
            }
        }

        Ok(RunResult {
            assistant_response: last_response,
            iterations: self.current_iteration(),
            action_results: all_results,
            status,
            execution_time: self.elapsed().await,
            finish_status,
        })
    }

    /// `stream` (spec section 4.H.5): yields text chunks via `on_chunk`,
    /// then commits the finalized assistant message exactly once.
    pub async fn stream(&self, prompt: &str, agent: Option<&str>, on_chunk: StreamCallback) -> Result<(String, Vec<ActionResult>)> {
        let agent_id = self.resolve_agent(agent).await;
        self.conversations.ensure_agent(&agent_id, None).await;
        self.conversations.add_user_message(&agent_id, prompt, None).await?;
        let step = self.llm_step(&agent_id, true, Some(on_chunk)).await?;
        Ok((step.assistant_response, step.action_results))
    }

    /// `_llm_step` (spec section 4.H.4): the atom of the loop.
    async fn llm_step(&self, agent_id: &str, streaming: bool, stream_cb: Option<StreamCallback>) -> Result<LlmStepResult> {
        let messages = self.conversations.get_formatted_messages(agent_id).await?;

        let stream_ids: Option<(String, String)> = if streaming {
            Some(self.part_events.on_stream_start(Some(agent_id), None, None).await)
        } else {
            None
        };

        let forwarding_cb: Option<StreamCallback> = if let Some((message_id, part_id)) = &stream_ids {
            let part_events = self.part_events.clone();
            let message_id = message_id.clone();
            let part_id = part_id.clone();
            let user_cb = stream_cb.clone();
            Some(Arc::new(move |chunk: &str, kind: &str| {
                if let Some(cb) = &user_cb {
                    cb(chunk, kind);
                }
                let part_events = part_events.clone();
                let message_id = message_id.clone();
                let part_id = part_id.clone();
                let chunk = chunk.to_string();
                let kind = kind.to_string();
                tokio::spawn(async move {
                    part_events.on_stream_chunk(&message_id, &part_id, &chunk, &kind).await;
                });
            }))
        } else {
            None
        };

        let mut response = self
            .provider
            .get_response(&messages, streaming, forwarding_cb.clone())
            .await
            .unwrap_or_default();

        if response.trim().is_empty() {
            response = self
                .provider
                .get_response(&messages, false, None)
                .await
                .unwrap_or_default();
        }

        if response.trim().is_empty() {
            return Err(PenguinError::LlmEmptyResponse { agent_id: agent_id.to_string() });
        }

        if let Some((message_id, part_id)) = &stream_ids {
            self.part_events.on_stream_end(message_id, part_id).await;
        }

        let assistant_message = self.conversations.add_assistant_message(agent_id, &response).await?;

        let mut actions = self.action_parser.parse(&response);
        let mut action_results = Vec::new();

        if let Some(action) = actions.drain(..).next() {
            let forced_next = matches!(action.action_type, ActionType::ExecuteCommand | ActionType::Execute);
            let input = action.payload.clone().unwrap_or(serde_json::Value::Null);
            let part_id = self.part_events.on_tool_start(action.tag_name(), &input, None).await;
            let result = self.action_executor.execute(&action, agent_id, assistant_message.id).await;
            if forced_next {
                *self.forced_tool_choice_name.lock().await = None;
            }
            let error = match result.status {
                ActionStatus::Completed => None,
                _ => Some(result.output.as_str()),
            };
            self.part_events.on_tool_end(&part_id, Some(result.output.as_str()), error).await;
            action_results.push(result);
        }

        Ok(LlmStepResult { assistant_response: response, action_results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_executor::{ActionExecutor, ApprovalManager, ToolRegistry};
    use crate::permission::{AuditLog, AuditVerbosity, PermissionEnforcer};
    use std::time::Duration as StdDuration;

    struct ConstantResponder(String);

    #[async_trait]
    impl ProviderAdapter for ConstantResponder {
        async fn get_response(&self, _messages: &[Message], _stream: bool, _stream_cb: Option<StreamCallback>) -> std::result::Result<String, String> {
            Ok(self.0.clone())
        }
    }

    fn build_engine(response: &str) -> Engine {
        let conversations = Arc::new(ConversationManager::new(10_000));
        let event_bus = Arc::new(EventBus::new());
        let part_events = Arc::new(PartEventAdapter::new(event_bus.clone(), "sess".to_string()));
        let permissions = Arc::new(PermissionEnforcer::new(true, vec![], AuditLog::new(AuditVerbosity::All, 10, None)));
        let approvals = Arc::new(ApprovalManager::new(StdDuration::from_millis(50)));
        let action_executor = Arc::new(ActionExecutor::new(ToolRegistry::new(), permissions, approvals, conversations.clone(), event_bus.clone()));
        let provider = Arc::new(ConstantResponder(response.to_string()));
        Engine::new(conversations, provider, action_executor, event_bus, part_events)
    }

    #[tokio::test]
    async fn empty_response_terminates_after_three_iterations() {
        let engine = build_engine(".");
        let result = engine.run_response("go", Some(100), None).await.unwrap();
        assert_eq!(result.iterations, 3);
    }

    #[tokio::test]
    async fn wall_clock_stop_with_zero_duration_exits_after_one_iteration() {
        let engine = build_engine("a substantive response that keeps going");
        engine.add_stop_condition(Arc::new(WallClockStop { limit: Duration::from_secs(0) })).await;
        let result = engine.run_task("go", Some(100), None, false).await.unwrap();
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn run_single_turn_returns_assistant_response() {
        let engine = build_engine("hello there, this is a long enough response");
        let (response, _) = engine.run_single_turn("hi", None).await.unwrap();
        assert_eq!(response, "hello there, this is a long enough response");
    }
}
