//! Minimal end-to-end demo of the `Client` facade.
//!
//! Wires a trivial `ProviderAdapter` (it just echoes the last user message
//! back, no network calls) through `Client::chat` so the collaborator
//! graph — `ConversationManager`, `PermissionEnforcer`, `Engine` — can be
//! exercised without an LLM API key.
//!
//! Run with:
//! ```bash
//! cargo run --example echo_chat
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use penguin_core::engine::{ProviderAdapter, StreamCallback};
use penguin_core::session::Message;
use penguin_core::{Client, PenguinConfig};

struct EchoProvider;

#[async_trait]
impl ProviderAdapter for EchoProvider {
    async fn get_response(&self, messages: &[Message], _stream: bool, _stream_cb: Option<StreamCallback>) -> Result<String, String> {
        let last_user = messages.iter().rev().find(|m| m.role == penguin_core::Role::User);
        Ok(match last_user {
            Some(message) => format!("you said: {}", message.content),
            None => "(nothing to echo)".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).init();

    let workspace_root = std::env::current_dir()?;
    let mut config = PenguinConfig::from_env();
    config.yolo = true;
    config.workflow_state_dir = std::env::temp_dir().join("penguin_echo_chat_demo");

    let client = Client::new(config, Arc::new(EchoProvider), workspace_root).await?;

    let (response, _actions) = client.chat("hello from the demo", None).await?;
    println!("{}", response);

    Ok(())
}
