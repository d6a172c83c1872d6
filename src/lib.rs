//! An embeddable agent runtime: an `Engine` reasoning loop over LLM-backed
//! agents, with conversation and context-window management, tag-delimited
//! tool action parsing and execution, an event/message bus, a permission
//! policy chain, and a durable ITUV orchestration backend (the `workflow`
//! crate).
//!
//! `client::Client` is the facade most embedders start from; the other
//! modules are usable directly for callers that want finer control.

pub mod action;
pub mod action_executor;
pub mod client;
pub mod config;
pub mod context_window;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod message_bus;
pub mod part_event;
pub mod permission;
pub mod session;

pub use client::Client;
pub use config::PenguinConfig;
pub use engine::{Engine, ProviderAdapter, RunResult, RunStatus};
pub use error::{PenguinError, Result};
pub use session::{ConversationManager, Message, Role};
