//! Ring-buffer + optional JSONL audit trail for permission decisions.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{PermissionCheck, PermissionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditVerbosity {
    Off,
    DenyOnly,
    AskAndDeny,
    All,
}

impl AuditVerbosity {
    fn should_write(self, result: PermissionResult) -> bool {
        match self {
            AuditVerbosity::Off => false,
            AuditVerbosity::DenyOnly => result == PermissionResult::Deny,
            AuditVerbosity::AskAndDeny => matches!(result, PermissionResult::Deny | PermissionResult::Ask),
            AuditVerbosity::All => true,
        }
    }
}

/// Keeps the last `max_memory_entries` checks regardless of file verbosity
/// (so `recent()` always reflects reality for tests/introspection), and
/// optionally appends JSON Lines to `log_file` filtered by `verbosity`.
pub struct AuditLog {
    verbosity: AuditVerbosity,
    max_memory_entries: usize,
    entries: Arc<Mutex<VecDeque<PermissionCheck>>>,
    log_file: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(verbosity: AuditVerbosity, max_memory_entries: usize, log_file: Option<PathBuf>) -> Self {
        AuditLog {
            verbosity,
            max_memory_entries,
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(max_memory_entries))),
            log_file,
        }
    }

    pub async fn record(&self, check: PermissionCheck) {
        {
            let mut entries = self.entries.lock().await;
            entries.push_back(check.clone());
            while entries.len() > self.max_memory_entries {
                entries.pop_front();
            }
        }

        if self.verbosity.should_write(check.result) {
            if let Some(path) = &self.log_file {
                if let Ok(line) = serde_json::to_string(&check) {
                    if let Err(e) = append_line(path, &line).await {
                        log::error!("failed to write audit log entry to {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<PermissionCheck> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }
}

async fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn check(result: PermissionResult) -> PermissionCheck {
        PermissionCheck {
            operation: "filesystem.read".to_string(),
            resource: "/tmp/x".to_string(),
            result,
            reason: "test".to_string(),
            policy_name: "test_policy".to_string(),
            timestamp: Utc::now(),
            agent_id: None,
            tool_name: None,
        }
    }

    #[tokio::test]
    async fn ring_buffer_caps_at_max_entries() {
        let audit = AuditLog::new(AuditVerbosity::All, 3, None);
        for _ in 0..10 {
            audit.record(check(PermissionResult::Allow)).await;
        }
        assert_eq!(audit.recent(100).await.len(), 3);
    }

    #[tokio::test]
    async fn deny_only_verbosity_still_records_allows_in_memory() {
        let audit = AuditLog::new(AuditVerbosity::DenyOnly, 10, None);
        audit.record(check(PermissionResult::Allow)).await;
        assert_eq!(audit.recent(10).await.len(), 1);
    }
}
