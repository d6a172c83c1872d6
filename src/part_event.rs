//! Canonical streaming wire event envelope (component I).
//!
//! The adapter is the only place that mints `msg_`/`part_` ids for wire
//! events; it publishes every envelope on [`EventBus`] under a single event
//! name (`"part_event"`) so transport layers (SSE, WebSocket — out of
//! scope here) can multiplex by filtering on `properties.session_id` /
//! `properties.agent_id` / `properties.directory`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::event_bus::EventBus;

pub const PART_EVENT_NAME: &str = "part_event";

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub struct PartEventAdapter {
    event_bus: Arc<EventBus>,
    session_id: String,
}

impl PartEventAdapter {
    pub fn new(event_bus: Arc<EventBus>, session_id: String) -> Self {
        PartEventAdapter { event_bus, session_id }
    }

    /// Initial event sent by the SSE channel (spec section 6).
    pub async fn on_connected(&self, agent_id: Option<&str>, directory: Option<&str>) {
        self.emit(
            "server.connected",
            json!({"sessionID": self.session_id, "agentID": agent_id, "directory": directory}),
        )
        .await;
    }

    pub async fn on_user_message(&self, text: &str) -> String {
        let message_id = new_id("msg");
        self.emit(
            "message.updated",
            json!({
                "id": message_id,
                "role": "user",
                "session_id": self.session_id,
                "time": {"created": Utc::now()},
            }),
        )
        .await;
        self.emit(
            "message.part.updated",
            json!({
                "message_id": message_id,
                "part_id": new_id("part"),
                "type": "text",
                "text": text,
            }),
        )
        .await;
        message_id
    }

    pub async fn on_stream_start(&self, agent_id: Option<&str>, model: Option<&str>, provider: Option<&str>) -> (String, String) {
        let message_id = new_id("msg");
        let part_id = new_id("part");
        self.emit(
            "message.updated",
            json!({
                "id": message_id,
                "role": "assistant",
                "agent_id": agent_id,
                "session_id": self.session_id,
                "model_id": model,
                "provider_id": provider,
                "time": {"created": Utc::now()},
            }),
        )
        .await;
        (message_id, part_id)
    }

    pub async fn on_stream_chunk(&self, message_id: &str, part_id: &str, delta: &str, role: &str) {
        self.emit(
            "message.part.updated",
            json!({
                "message_id": message_id,
                "part_id": part_id,
                "type": if role == "reasoning" { "reasoning" } else { "text" },
                "delta": delta,
            }),
        )
        .await;
    }

    pub async fn on_stream_end(&self, message_id: &str, _part_id: &str) {
        self.emit(
            "message.updated",
            json!({
                "id": message_id,
                "session_id": self.session_id,
                "time": {"completed": Utc::now()},
            }),
        )
        .await;
    }

    pub async fn on_tool_start(&self, name: &str, input: &Value, tool_call_ref: Option<&str>) -> String {
        let part_id = new_id("part");
        self.emit(
            "tool",
            json!({
                "phase": "start",
                "part_id": part_id,
                "action": name,
                "input": input,
                "tool_call_ref": tool_call_ref,
            }),
        )
        .await;
        part_id
    }

    pub async fn on_tool_end(&self, part_id: &str, output: Option<&str>, error: Option<&str>) {
        self.emit(
            "tool",
            json!({
                "phase": "end",
                "part_id": part_id,
                "status": if error.is_some() { "error" } else { "completed" },
                "output": output,
                "error": error,
            }),
        )
        .await;
    }

    async fn emit(&self, event_type: &str, properties: Value) {
        self.event_bus.emit(PART_EVENT_NAME, json!({"type": event_type, "properties": properties})).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{EventHandler, Priority};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<Value>>>);

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, _event_name: &str, payload: &Value) {
            self.0.lock().await.push(payload.clone());
        }
    }

    #[tokio::test]
    async fn stream_lifecycle_emits_expected_envelope_types() {
        let event_bus = Arc::new(EventBus::new());
        let captured = Arc::new(Mutex::new(Vec::new()));
        event_bus.subscribe(PART_EVENT_NAME, Arc::new(Capture(captured.clone())), Priority::Normal).await;

        let adapter = PartEventAdapter::new(event_bus, "sess1".to_string());
        adapter.on_connected(None, None).await;
        let (message_id, part_id) = adapter.on_stream_start(Some("default"), None, None).await;
        adapter.on_stream_chunk(&message_id, &part_id, "hel", "assistant").await;
        adapter.on_stream_chunk(&message_id, &part_id, "lo", "assistant").await;
        adapter.on_stream_end(&message_id, &part_id).await;

        let events = captured.lock().await;
        let types: Vec<String> = events.iter().map(|e| e["type"].as_str().unwrap().to_string()).collect();
        assert_eq!(types, vec!["server.connected", "message.updated", "message.part.updated", "message.part.updated", "message.updated"]);
    }
}
