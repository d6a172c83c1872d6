//! Permission enforcer and policy chain (component C).
//!
//! Mirrors the evaluation order used throughout the rest of the pack for
//! ordered-rule engines: collect, then decide once, rather than short-
//! circuiting on the first matching rule of any kind. See
//! [`PermissionEnforcer::check`] for the exact five-step algorithm.

pub mod audit;
pub mod policies;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::PenguinError;
pub use audit::{AuditLog, AuditVerbosity};
pub use policies::{AgentScopedPolicy, WorkspaceBoundaryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionResult {
    Allow,
    Ask,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    ReadOnly,
    Workspace,
    Full,
}

/// A single permission decision, suitable for audit logging and for
/// testable-property 4/5's inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub operation: String,
    pub resource: String,
    pub result: PermissionResult,
    pub reason: String,
    pub policy_name: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: Option<String>,
    pub tool_name: Option<String>,
}

/// One rule in the chain. `priority` breaks ties — higher runs first.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    fn check(&self, operation: &str, resource: &str, context: &HashMap<String, Value>) -> (PermissionResult, String);
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&format!("^{}$", escaped))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Orchestrates the policy chain. Construction is immutable after boot
/// (spec section 5): policies and the session allowlist are set once and
/// never mutated by the enforcer itself.
pub struct PermissionEnforcer {
    yolo: bool,
    session_allowlist: Vec<String>,
    policies: Vec<Arc<dyn Policy>>,
    audit: AuditLog,
}

impl PermissionEnforcer {
    pub fn new(yolo: bool, mut policies: Vec<Arc<dyn Policy>>, audit: AuditLog) -> Self {
        policies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        PermissionEnforcer { yolo, session_allowlist: Vec::new(), policies, audit }
    }

    pub fn with_session_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.session_allowlist = allowlist;
        self
    }

    /// The five-step algorithm from spec section 4.C:
    /// 1. yolo -> ALLOW
    /// 2. session allowlist match -> ALLOW
    /// 3. else, for each policy in priority order: first DENY wins; collect ASKs
    /// 4. any ASK and no DENY -> ASK
    /// 5. else -> ALLOW
    pub async fn check(
        &self,
        operation: &str,
        resource: &str,
        context: HashMap<String, Value>,
        agent_id: Option<String>,
        tool_name: Option<String>,
    ) -> PermissionCheck {
        if self.yolo {
            log::warn!("YOLO bypass: allowing '{}' on '{}' without policy evaluation", operation, resource);
            return self.record(operation, resource, PermissionResult::Allow, "yolo bypass".to_string(), "yolo".to_string(), agent_id, tool_name).await;
        }

        let key = format!("{}:{}", operation, resource);
        if self.session_allowlist.iter().any(|pattern| glob_match(pattern, &key)) {
            return self
                .record(operation, resource, PermissionResult::Allow, "session allowlist match".to_string(), "session_allowlist".to_string(), agent_id, tool_name)
                .await;
        }

        let mut saw_ask: Option<(String, String)> = None;
        for policy in &self.policies {
            let (result, reason) = policy.check(operation, resource, &context);
            match result {
                PermissionResult::Deny => {
                    return self.record(operation, resource, PermissionResult::Deny, reason, policy.name().to_string(), agent_id, tool_name).await;
                }
                PermissionResult::Ask if saw_ask.is_none() => {
                    saw_ask = Some((reason, policy.name().to_string()));
                }
                _ => {}
            }
        }

        if let Some((reason, policy_name)) = saw_ask {
            return self.record(operation, resource, PermissionResult::Ask, reason, policy_name, agent_id, tool_name).await;
        }

        self.record(operation, resource, PermissionResult::Allow, "no policy objected".to_string(), "default".to_string(), agent_id, tool_name).await
    }

    /// Convenience wrapper: turns a DENY into `Err`, passes ASK through
    /// unchanged for callers that handle the approval flow separately.
    pub async fn check_and_raise(
        &self,
        operation: &str,
        resource: &str,
        context: HashMap<String, Value>,
        agent_id: Option<String>,
        tool_name: Option<String>,
    ) -> Result<PermissionCheck, PenguinError> {
        let check = self.check(operation, resource, context, agent_id, tool_name).await;
        if check.result == PermissionResult::Deny {
            return Err(PenguinError::PermissionDenied {
                operation: operation.to_string(),
                resource: resource.to_string(),
                reason: check.reason,
            });
        }
        Ok(check)
    }

    async fn record(
        &self,
        operation: &str,
        resource: &str,
        result: PermissionResult,
        reason: String,
        policy_name: String,
        agent_id: Option<String>,
        tool_name: Option<String>,
    ) -> PermissionCheck {
        let check = PermissionCheck {
            operation: operation.to_string(),
            resource: resource.to_string(),
            result,
            reason,
            policy_name,
            timestamp: Utc::now(),
            agent_id,
            tool_name,
        };
        self.audit.record(check.clone()).await;
        check
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}

/// Thread-safe handle used when a policy needs to read live approval state
/// (not needed by the built-in policies, but kept as the seam an embedder's
/// custom `Policy` would use).
pub type SharedContext = Arc<RwLock<HashMap<String, Value>>>;

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDeny;
    impl Policy for AlwaysDeny {
        fn name(&self) -> &str {
            "always_deny"
        }
        fn priority(&self) -> i32 {
            100
        }
        fn check(&self, _operation: &str, _resource: &str, _context: &HashMap<String, Value>) -> (PermissionResult, String) {
            (PermissionResult::Deny, "nope".to_string())
        }
    }

    struct AlwaysAsk;
    impl Policy for AlwaysAsk {
        fn name(&self) -> &str {
            "always_ask"
        }
        fn priority(&self) -> i32 {
            10
        }
        fn check(&self, _operation: &str, _resource: &str, _context: &HashMap<String, Value>) -> (PermissionResult, String) {
            (PermissionResult::Ask, "maybe".to_string())
        }
    }

    #[tokio::test]
    async fn deny_short_circuits_lower_priority_policies() {
        let enforcer = PermissionEnforcer::new(
            false,
            vec![Arc::new(AlwaysAsk), Arc::new(AlwaysDeny)],
            AuditLog::new(AuditVerbosity::All, 100, None),
        );
        let check = enforcer.check("filesystem.write", "/tmp/x", HashMap::new(), None, None).await;
        assert_eq!(check.result, PermissionResult::Deny);
        assert_eq!(check.policy_name, "always_deny");
    }

    #[tokio::test]
    async fn yolo_bypasses_everything() {
        let enforcer = PermissionEnforcer::new(
            true,
            vec![Arc::new(AlwaysDeny)],
            AuditLog::new(AuditVerbosity::All, 100, None),
        );
        let check = enforcer.check("filesystem.write", "/etc/shadow", HashMap::new(), None, None).await;
        assert_eq!(check.result, PermissionResult::Allow);
    }

    #[tokio::test]
    async fn ask_without_deny_surfaces_as_ask() {
        let enforcer = PermissionEnforcer::new(
            false,
            vec![Arc::new(AlwaysAsk)],
            AuditLog::new(AuditVerbosity::All, 100, None),
        );
        let check = enforcer.check("filesystem.write", "/tmp/x", HashMap::new(), None, None).await;
        assert_eq!(check.result, PermissionResult::Ask);
    }
}
