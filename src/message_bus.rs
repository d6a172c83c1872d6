//! Directed, structured messaging between agents and humans (component B),
//! layered above [`EventBus`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{PenguinError, Result};
use crate::event_bus::EventBus;
use crate::session::{ConversationManager, MessageCategory, Role};

pub const HUMAN_RECIPIENT: &str = "human";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Message,
    Status,
    Control,
    Handoff,
}

/// A structured, directed message, mirrored into the recipient's session as
/// a user-role [`Message`](crate::session::Message) annotated with
/// `metadata.channel`/`metadata.sender`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub sender: String,
    pub recipient: String,
    pub channel: Option<String>,
    pub message_type: MessageType,
    pub content: String,
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Delivers messages exactly once, for the lifetime of the process, to the
/// recipient's session, and emits `bus.message` on the shared [`EventBus`].
/// Durability across restarts is an `OrchestrationBackend` concern, not
/// this bus's.
pub struct MessageBus {
    event_bus: Arc<EventBus>,
    conversations: Arc<ConversationManager>,
}

impl MessageBus {
    pub fn new(event_bus: Arc<EventBus>, conversations: Arc<ConversationManager>) -> Self {
        MessageBus { event_bus, conversations }
    }

    pub async fn send(
        &self,
        sender: &str,
        recipient: &str,
        content: &str,
        message_type: MessageType,
        metadata: Option<HashMap<String, Value>>,
        channel: Option<String>,
    ) -> Result<BusMessage> {
        if recipient != HUMAN_RECIPIENT && self.conversations.get_agent(recipient).await.is_none() {
            return Err(PenguinError::UnknownAgent { agent_id: recipient.to_string() });
        }

        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("sender".to_string(), json!(sender));
        if let Some(channel) = &channel {
            metadata.insert("channel".to_string(), json!(channel));
        }

        if recipient != HUMAN_RECIPIENT {
            self.conversations.add_user_message_with_metadata(recipient, content, metadata.clone()).await?;
        }

        let bus_message = BusMessage {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            channel,
            message_type,
            content: content.to_string(),
            metadata,
            timestamp: Utc::now(),
        };

        self.event_bus
            .emit("bus.message", serde_json::to_value(&bus_message).unwrap_or(Value::Null))
            .await;

        Ok(bus_message)
    }

    pub async fn send_to_human(&self, sender: &str, content: &str) -> Result<BusMessage> {
        self.send(sender, HUMAN_RECIPIENT, content, MessageType::Message, None, None).await
    }

    pub async fn human_reply(&self, recipient: &str, content: &str) -> Result<BusMessage> {
        self.send(HUMAN_RECIPIENT, recipient, content, MessageType::Message, None, None).await
    }
}

/// Unused directly but documents the relationship: a mirrored message's
/// `Message::category` is always `Dialog`, since it enters the recipient's
/// session the same way a user turn would.
pub const MIRRORED_CATEGORY: MessageCategory = MessageCategory::Dialog;
pub const MIRRORED_ROLE: Role = Role::User;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_mirrors_into_recipient_session_and_emits() {
        let event_bus = Arc::new(EventBus::new());
        let conversations = Arc::new(ConversationManager::new(10_000));
        conversations.ensure_agent("bob", None).await;

        let bus = MessageBus::new(event_bus.clone(), conversations.clone());
        bus.send("alice", "bob", "hi bob", MessageType::Message, None, Some("general".to_string()))
            .await
            .unwrap();

        assert_eq!(conversations.session_history_len("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_recipient_fails() {
        let event_bus = Arc::new(EventBus::new());
        let conversations = Arc::new(ConversationManager::new(10_000));
        let bus = MessageBus::new(event_bus, conversations);

        let result = bus.send("alice", "ghost", "hi", MessageType::Message, None, None).await;
        assert!(matches!(result, Err(PenguinError::UnknownAgent { .. })));
    }
}
