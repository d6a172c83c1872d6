//! Crate-wide error taxonomy (spec section 7).

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PenguinError>;

/// The error kinds a caller of this crate can observe. Each variant maps to
/// one entry in the error taxonomy; `code()` gives the stable string a host
/// surface would place in `{error:{code,...}}`.
#[derive(Debug)]
pub enum PenguinError {
    /// The provider returned no content after one non-streaming retry.
    LlmEmptyResponse { agent_id: String },
    /// A tool raised while executing; the loop captured it as an ActionResult and continued.
    ToolExecution { tool_name: String, message: String },
    /// The policy chain denied an operation outright.
    PermissionDenied { operation: String, resource: String, reason: String },
    /// An ASK result is pending human approval.
    ApprovalRequired { request_id: String },
    /// No agent is registered under this id.
    UnknownAgent { agent_id: String },
    /// No tool is registered under this name.
    UnknownTool { tool_name: String },
    /// A phase, tool, or provider call exceeded its timeout.
    Timeout { context: String },
    /// The storage layer (SQLite) failed.
    Storage(String),
    /// A path failed normalization or escaped its allowed boundary.
    PathTraversal { path: String },
}

impl PenguinError {
    pub fn code(&self) -> &'static str {
        match self {
            PenguinError::LlmEmptyResponse { .. } => "llm_empty_response_error",
            PenguinError::ToolExecution { .. } => "tool_execution_error",
            PenguinError::PermissionDenied { .. } => "permission_denied",
            PenguinError::ApprovalRequired { .. } => "approval_required",
            PenguinError::UnknownAgent { .. } => "unknown_agent",
            PenguinError::UnknownTool { .. } => "unknown_tool",
            PenguinError::Timeout { .. } => "timeout_error",
            PenguinError::Storage(_) => "storage_error",
            PenguinError::PathTraversal { .. } => "path_traversal_error",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            PenguinError::LlmEmptyResponse { .. } => false,
            PenguinError::ToolExecution { .. } => true,
            PenguinError::PermissionDenied { .. } => true,
            PenguinError::ApprovalRequired { .. } => true,
            PenguinError::UnknownAgent { .. } => false,
            PenguinError::UnknownTool { .. } => false,
            PenguinError::Timeout { .. } => true,
            PenguinError::Storage(_) => false,
            PenguinError::PathTraversal { .. } => false,
        }
    }

    pub fn suggested_action(&self) -> Option<&'static str> {
        match self {
            PenguinError::PermissionDenied { .. } => Some("choose a different resource or request approval"),
            PenguinError::ApprovalRequired { .. } => Some("wait for human approval or denial"),
            PenguinError::Timeout { .. } => Some("retry with a longer timeout"),
            PenguinError::ToolExecution { .. } => Some("inspect the tool output and retry"),
            _ => None,
        }
    }
}

impl fmt::Display for PenguinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PenguinError::LlmEmptyResponse { agent_id } => {
                write!(f, "agent '{}' produced an empty response after retry", agent_id)
            }
            PenguinError::ToolExecution { tool_name, message } => {
                write!(f, "tool '{}' failed: {}", tool_name, message)
            }
            PenguinError::PermissionDenied { operation, resource, reason } => {
                write!(f, "denied '{}' on '{}': {}", operation, resource, reason)
            }
            PenguinError::ApprovalRequired { request_id } => {
                write!(f, "approval request '{}' is pending", request_id)
            }
            PenguinError::UnknownAgent { agent_id } => write!(f, "unknown agent '{}'", agent_id),
            PenguinError::UnknownTool { tool_name } => write!(f, "unknown tool '{}'", tool_name),
            PenguinError::Timeout { context } => write!(f, "timed out: {}", context),
            PenguinError::Storage(message) => write!(f, "storage error: {}", message),
            PenguinError::PathTraversal { path } => write!(f, "path '{}' escapes its allowed boundary", path),
        }
    }
}

impl std::error::Error for PenguinError {}

impl From<workflow::Error> for PenguinError {
    fn from(err: workflow::Error) -> Self {
        PenguinError::Storage(err.to_string())
    }
}
