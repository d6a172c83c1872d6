//! Conversation model, sessions, and the session coordinator (component G).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::context_window::ContextWindow;
use crate::error::{PenguinError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message categories drive [`ContextWindow`] budgeting and trim order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    System,
    SystemOutput,
    Context,
    Dialog,
    ToolResult,
}

/// One append-only entry in a [`Session`]. Edits create new messages; this
/// type never mutates its `content` after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub category: MessageCategory,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub recipient_id: Option<String>,
    pub channel: Option<String>,
    pub metadata: HashMap<String, Value>,
    /// Lazily computed by the owning `ContextWindow`; `None` until estimated.
    pub token_count: Option<usize>,
    /// The assistant message id a TOOL_RESULT answers, if any. Carried
    /// forward onto the TOOL_RESULT eviction placeholder so the linkage
    /// survives even after the original content is dropped.
    pub parent_message_id: Option<u64>,
}

/// Ordered, append-only log of [`Message`]s. May be referenced by more than
/// one agent (a "shared session"); mutation always goes through the owning
/// [`ConversationManager`], which holds the per-session lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub system_prompt_digest: Option<String>,
    pub metadata: HashMap<String, Value>,
    messages: Vec<Message>,
    next_message_id: u64,
}

impl Session {
    pub fn new(id: String) -> Self {
        let now = Utc::now();
        Session {
            id,
            created_at: now,
            last_active: now,
            system_prompt_digest: None,
            metadata: HashMap::new(),
            messages: Vec::new(),
            next_message_id: 1,
        }
    }

    /// Appends `message`, assigning it the next monotonically increasing id
    /// and a timestamp no earlier than the previous message's (property 6).
    pub fn append(
        &mut self,
        role: Role,
        content: String,
        category: MessageCategory,
        agent_id: String,
        parent_message_id: Option<u64>,
        metadata: HashMap<String, Value>,
    ) -> &Message {
        let id = self.next_message_id;
        self.next_message_id += 1;
        let mut timestamp = Utc::now();
        if let Some(last) = self.messages.last() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }
        self.last_active = timestamp;
        self.messages.push(Message {
            id,
            role,
            content,
            category,
            timestamp,
            agent_id,
            recipient_id: None,
            channel: None,
            metadata,
            token_count: None,
            parent_message_id,
        });
        self.messages.last().unwrap()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Registry entry for one agent (spec section 3's `AgentRecord`).
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub system_prompt: String,
    pub session_id: String,
    pub context_window: Arc<RwLock<ContextWindow>>,
    pub parent_agent_id: Option<String>,
    pub paused: bool,
    pub permission_policy: Option<String>,
    pub model_binding: Option<String>,
    pub share_session: bool,
    pub share_context_window: bool,
    pub shared_cw_max_tokens: Option<usize>,
}

/// Owns all [`Session`]s and the `agent_id -> session` mapping. This is the
/// one concrete implementation of the duck-typed conversation managers in
/// the source (spec section 9): callers depend on this type directly, and
/// tests substitute an in-memory instance (which is what this always is —
/// persistence is a seam via [`ConversationManager::save`], not a second
/// implementation).
pub struct ConversationManager {
    sessions: RwLock<HashMap<String, Arc<RwLock<Session>>>>,
    agents: RwLock<HashMap<String, AgentRecord>>,
    current_agent_id: RwLock<Option<String>>,
    default_max_history_tokens: usize,
}

impl ConversationManager {
    pub fn new(default_max_history_tokens: usize) -> Self {
        ConversationManager {
            sessions: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            current_agent_id: RwLock::new(None),
            default_max_history_tokens,
        }
    }

    /// Create-or-get an agent, seeding a SYSTEM message into a fresh session.
    pub async fn ensure_agent(&self, agent_id: &str, system_prompt: Option<String>) -> AgentRecord {
        if let Some(existing) = self.agents.read().await.get(agent_id) {
            return existing.clone();
        }

        let session_id = format!("session-{}", agent_id);
        let mut session = Session::new(session_id.clone());
        let prompt = system_prompt.unwrap_or_default();
        if !prompt.is_empty() {
            session.append(Role::System, prompt.clone(), MessageCategory::System, agent_id.to_string(), None, HashMap::new());
        }
        self.sessions.write().await.insert(session_id.clone(), Arc::new(RwLock::new(session)));

        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            system_prompt: prompt,
            session_id,
            context_window: Arc::new(RwLock::new(ContextWindow::new(self.default_max_history_tokens))),
            parent_agent_id: None,
            paused: false,
            permission_policy: None,
            model_binding: None,
            share_session: false,
            share_context_window: false,
            shared_cw_max_tokens: None,
        };
        self.agents.write().await.insert(agent_id.to_string(), record.clone());
        record
    }

    /// Establishes a sub-agent's session/context-window sharing per spec
    /// section 4.G: shared sessions point at the same session id; otherwise
    /// a fresh session is seeded with a one-time copy of the parent's
    /// SYSTEM + CONTEXT messages.
    pub async fn create_sub_agent(
        &self,
        agent_id: &str,
        parent_id: &str,
        share_session: bool,
        share_context_window: bool,
        shared_cw_max_tokens: Option<usize>,
    ) -> Result<AgentRecord> {
        let parent = self
            .agents
            .read()
            .await
            .get(parent_id)
            .cloned()
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: parent_id.to_string() })?;

        let session_id = if share_session {
            parent.session_id.clone()
        } else {
            let new_session_id = format!("session-{}", agent_id);
            let mut new_session = Session::new(new_session_id.clone());
            {
                let parent_session_arc = self.sessions.read().await.get(&parent.session_id).cloned();
                if let Some(parent_session_arc) = parent_session_arc {
                    let parent_session = parent_session_arc.read().await;
                    for message in parent_session.messages() {
                        if matches!(message.category, MessageCategory::System | MessageCategory::Context) {
                            new_session.append(
                                message.role,
                                message.content.clone(),
                                message.category,
                                agent_id.to_string(),
                                message.parent_message_id,
                                message.metadata.clone(),
                            );
                        }
                    }
                }
            }
            if share_context_window {
                if let Some(clamp) = shared_cw_max_tokens {
                    new_session.append(
                        Role::System,
                        format!("[cw_clamp_notice] shared context window clamped to {} tokens", clamp),
                        MessageCategory::SystemOutput,
                        agent_id.to_string(),
                        None,
                        HashMap::new(),
                    );
                }
            }
            self.sessions.write().await.insert(new_session_id.clone(), Arc::new(RwLock::new(new_session)));
            new_session_id
        };

        let context_window = if share_context_window {
            parent.context_window.clone()
        } else {
            Arc::new(RwLock::new(ContextWindow::new(self.default_max_history_tokens)))
        };

        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            system_prompt: parent.system_prompt.clone(),
            session_id,
            context_window,
            parent_agent_id: Some(parent_id.to_string()),
            paused: false,
            permission_policy: parent.permission_policy.clone(),
            model_binding: parent.model_binding.clone(),
            share_session,
            share_context_window,
            shared_cw_max_tokens,
        };
        self.agents.write().await.insert(agent_id.to_string(), record.clone());
        Ok(record)
    }

    pub async fn set_current_agent(&self, agent_id: &str) -> Result<()> {
        if !self.agents.read().await.contains_key(agent_id) {
            return Err(PenguinError::UnknownAgent { agent_id: agent_id.to_string() });
        }
        *self.current_agent_id.write().await = Some(agent_id.to_string());
        Ok(())
    }

    pub async fn current_agent_id(&self) -> Option<String> {
        self.current_agent_id.read().await.clone()
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn agents_sharing_session(&self, agent_id: &str) -> Vec<String> {
        let target_session = match self.get_agent(agent_id).await {
            Some(record) => record.session_id,
            None => return Vec::new(),
        };
        self.agents
            .read()
            .await
            .values()
            .filter(|record| record.session_id == target_session)
            .map(|record| record.agent_id.clone())
            .collect()
    }

    async fn session_for(&self, agent_id: &str) -> Result<Arc<RwLock<Session>>> {
        let session_id = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: agent_id.to_string() })?
            .session_id;
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: agent_id.to_string() })
    }

    pub async fn add_user_message(&self, agent_id: &str, text: &str, image_path: Option<&str>) -> Result<Message> {
        let session_arc = self.session_for(agent_id).await?;
        let mut session = session_arc.write().await;
        let mut content = text.to_string();
        if let Some(path) = image_path {
            content.push_str(&format!("\n[image: {}]", path));
        }
        Ok(session
            .append(Role::User, content, MessageCategory::Dialog, agent_id.to_string(), None, HashMap::new())
            .clone())
    }

    /// As [`Self::add_user_message`], but attaches `metadata` to the
    /// mirrored message — used by [`crate::message_bus::MessageBus`] so a
    /// directed message's `sender`/`channel` survive into the recipient's
    /// session, not just the emitted `BusMessage`.
    pub async fn add_user_message_with_metadata(&self, agent_id: &str, text: &str, metadata: HashMap<String, Value>) -> Result<Message> {
        let session_arc = self.session_for(agent_id).await?;
        let mut session = session_arc.write().await;
        Ok(session
            .append(Role::User, text.to_string(), MessageCategory::Dialog, agent_id.to_string(), None, metadata)
            .clone())
    }

    pub async fn add_assistant_message(&self, agent_id: &str, text: &str) -> Result<Message> {
        let session_arc = self.session_for(agent_id).await?;
        let mut session = session_arc.write().await;
        Ok(session
            .append(Role::Assistant, text.to_string(), MessageCategory::Dialog, agent_id.to_string(), None, HashMap::new())
            .clone())
    }

    pub async fn add_action_result(&self, agent_id: &str, action_type: &str, output: &str, status: &str, parent_message_id: u64) -> Result<Message> {
        let session_arc = self.session_for(agent_id).await?;
        let mut session = session_arc.write().await;
        let content = format!("[{}:{}] {}", action_type, status, output);
        Ok(session
            .append(Role::Tool, content, MessageCategory::ToolResult, agent_id.to_string(), Some(parent_message_id), HashMap::new())
            .clone())
    }

    /// Provider-ready sequence after context-window trimming.
    pub async fn get_formatted_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        let record = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| PenguinError::UnknownAgent { agent_id: agent_id.to_string() })?;
        let session_arc = self.session_for(agent_id).await?;
        let session = session_arc.read().await;

        let mut cw = record.context_window.write().await;
        for message in session.messages() {
            cw.admit(message);
        }
        Ok(cw.active_messages())
    }

    pub async fn session_history_len(&self, agent_id: &str) -> Result<usize> {
        let session_arc = self.session_for(agent_id).await?;
        let len = session_arc.read().await.len();
        Ok(len)
    }

    /// Idempotent persistence seam. The in-memory implementation is a no-op
    /// placeholder for a caller-supplied sink (SQLite, file, etc.) — the
    /// core does not mandate a storage engine, matching spec section 4.G's
    /// "persistence seam" language.
    pub async fn save(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_agent_seeds_system_message() {
        let manager = ConversationManager::new(10_000);
        manager.ensure_agent("default", Some("be helpful".to_string())).await;
        assert_eq!(manager.session_history_len("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn message_ids_increase_and_timestamps_never_decrease() {
        let manager = ConversationManager::new(10_000);
        manager.ensure_agent("default", None).await;
        manager.add_user_message("default", "hi", None).await.unwrap();
        manager.add_assistant_message("default", "hello").await.unwrap();
        let messages = manager.get_formatted_messages("default").await.unwrap();
        for pair in messages.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn sub_agent_sharing_session_sees_parent_messages() {
        let manager = ConversationManager::new(10_000);
        manager.ensure_agent("parent", Some("sys".to_string())).await;
        manager.add_user_message("parent", "hello", None).await.unwrap();
        manager.create_sub_agent("child", "parent", true, false, None).await.unwrap();
        let shared = manager.agents_sharing_session("parent").await;
        assert!(shared.contains(&"child".to_string()));
        assert_eq!(
            manager.session_history_len("child").await.unwrap(),
            manager.session_history_len("parent").await.unwrap()
        );
    }
}
