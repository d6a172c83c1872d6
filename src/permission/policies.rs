//! Built-in policies: workspace boundary enforcement and agent-scoped
//! narrowing (spec section 4.C).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{Policy, PermissionMode, PermissionResult};

const SYSTEM_PATHS: &[&str] = &["/etc", "/root", "/boot", "/sys", "/proc", "/var/lib", "C:\\Windows", "C:\\System32"];

const SENSITIVE_GLOBS: &[&str] = &[".env*", "*.pem", ".ssh/*", "*.key", "id_rsa*", "*.p12"];

const READ_ONLY_COMMANDS: &[&str] = &["grep", "find", "cat", "head", "tail", "ls", "tree", "wc", "rg", "pwd", "echo"];

fn glob_match(pattern: &str, value: &str) -> bool {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&format!("(?i)^{}$", escaped))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn basename_matches_sensitive(path: &str) -> bool {
    let basename = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path);
    SENSITIVE_GLOBS.iter().any(|pattern| glob_match(pattern, basename) || glob_match(pattern, path))
}

/// Normalizes `path`, rejecting traversal outside `start_dir` and null
/// bytes (testable property 8). Does not touch the filesystem beyond
/// `canonicalize`-equivalent string manipulation, since the resource may
/// not exist yet (e.g. `write_to_file` creating a new path).
pub fn normalize_path(path: &str, start_dir: &Path) -> Result<PathBuf, String> {
    if path.contains('\0') {
        return Err("path contains a null byte".to_string());
    }

    let expanded = if let Some(stripped) = path.strip_prefix("~/") {
        dirs_home().join(stripped)
    } else if path == "~" {
        dirs_home()
    } else {
        PathBuf::from(path)
    };

    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        start_dir.join(expanded)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(format!("path '{}' escapes its starting directory", path));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(start_dir) {
        return Err(format!("path '{}' resolves outside '{}'", path, start_dir.display()));
    }

    Ok(normalized)
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/root"))
}

/// Enforces that filesystem resources resolve within the workspace root,
/// the project root, or an explicit allowlist; denies system paths and
/// sensitive glob patterns; in READ_ONLY mode, denies non-read operations
/// unless a shell command is recognized as read-only.
pub struct WorkspaceBoundaryPolicy {
    pub mode: PermissionMode,
    pub workspace_root: PathBuf,
    pub project_root: Option<PathBuf>,
    pub allowed_paths: Vec<PathBuf>,
    pub denied_paths: Vec<String>,
}

impl WorkspaceBoundaryPolicy {
    pub fn new(mode: PermissionMode, workspace_root: PathBuf) -> Self {
        WorkspaceBoundaryPolicy {
            mode,
            workspace_root,
            project_root: None,
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
        }
    }

    fn within_boundary(&self, path: &Path) -> bool {
        path.starts_with(&self.workspace_root)
            || self.project_root.as_ref().map(|root| path.starts_with(root)).unwrap_or(false)
            || self.allowed_paths.iter().any(|allowed| path.starts_with(allowed))
    }

    fn is_read_operation(operation: &str) -> bool {
        operation.ends_with(".read") || operation == "filesystem.list" || operation == "filesystem.search"
    }

    fn command_is_read_only(command: &str) -> bool {
        let first_word = command.trim().split_whitespace().next().unwrap_or("");
        let bare = first_word.rsplit('/').next().unwrap_or(first_word);
        READ_ONLY_COMMANDS.contains(&bare) || (bare == "git" && command.contains(" log") || command.contains(" show") || command.contains(" diff"))
    }
}

impl Policy for WorkspaceBoundaryPolicy {
    fn name(&self) -> &str {
        "workspace_boundary"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn check(&self, operation: &str, resource: &str, _context: &HashMap<String, Value>) -> (PermissionResult, String) {
        if operation == "process.execute" {
            if self.mode == PermissionMode::ReadOnly && !Self::command_is_read_only(resource) {
                return (PermissionResult::Deny, format!("read-only mode: command '{}' is not recognized as read-only", resource));
            }
            return (PermissionResult::Allow, "command permitted".to_string());
        }

        if !operation.starts_with("filesystem.") {
            return (PermissionResult::Allow, "not a filesystem operation".to_string());
        }

        if self.denied_paths.iter().any(|pattern| glob_match(pattern, resource)) {
            return (PermissionResult::Deny, format!("path '{}' matches a denied pattern", resource));
        }

        let normalized = match normalize_path(resource, &self.workspace_root) {
            Ok(path) => path,
            Err(reason) => return (PermissionResult::Deny, reason),
        };

        if SYSTEM_PATHS.iter().any(|sys| normalized.starts_with(sys)) {
            return (PermissionResult::Deny, format!("system path '{}' — access not allowed", normalized.display()));
        }

        if basename_matches_sensitive(resource) {
            return (PermissionResult::Ask, format!("'{}' matches a sensitive file pattern", resource));
        }

        if !self.within_boundary(&normalized) {
            return (PermissionResult::Deny, format!("path '{}' is outside the workspace", normalized.display()));
        }

        if operation == "filesystem.delete" && self.mode == PermissionMode::Workspace {
            return (PermissionResult::Ask, "delete operations require approval in workspace mode".to_string());
        }

        if self.mode == PermissionMode::ReadOnly && !Self::is_read_operation(operation) {
            return (PermissionResult::Deny, "read-only mode: non-read filesystem operations are denied".to_string());
        }

        (PermissionResult::Allow, "within workspace boundary".to_string())
    }
}

/// Refines a parent's policy: the child may only narrow, never widen.
/// Mode only becomes more restrictive, allowlists intersect, denylists
/// union. This implements testable property 5 (monotonic narrowing).
pub struct AgentScopedPolicy {
    pub parent: std::sync::Arc<dyn Policy>,
    pub narrowed_mode: Option<PermissionMode>,
    pub additional_denied_paths: Vec<String>,
    pub allowed_operations: Option<Vec<String>>,
}

fn mode_rank(mode: PermissionMode) -> u8 {
    match mode {
        PermissionMode::Full => 0,
        PermissionMode::Workspace => 1,
        PermissionMode::ReadOnly => 2,
    }
}

impl Policy for AgentScopedPolicy {
    fn name(&self) -> &str {
        "agent_scoped"
    }

    fn priority(&self) -> i32 {
        self.parent.priority() + 1
    }

    fn check(&self, operation: &str, resource: &str, context: &HashMap<String, Value>) -> (PermissionResult, String) {
        if let Some(allowed) = &self.allowed_operations {
            if !allowed.iter().any(|op| glob_match(op, operation)) {
                return (PermissionResult::Deny, format!("operation '{}' is outside this agent's allowlist", operation));
            }
        }

        if self.additional_denied_paths.iter().any(|pattern| glob_match(pattern, resource)) {
            return (PermissionResult::Deny, format!("'{}' is denied for this agent", resource));
        }

        let (parent_result, parent_reason) = self.parent.check(operation, resource, context);
        if parent_result == PermissionResult::Deny {
            return (parent_result, parent_reason);
        }

        if let Some(narrowed) = self.narrowed_mode {
            if mode_rank(narrowed) > mode_rank(PermissionMode::Full) && operation.starts_with("filesystem.") && narrowed == PermissionMode::ReadOnly && !operation.ends_with(".read") {
                return (PermissionResult::Deny, "agent scope narrows to read-only".to_string());
            }
        }

        (parent_result, parent_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_traversal_is_rejected() {
        let result = normalize_path("../../etc/passwd", &PathBuf::from("/workspace"));
        assert!(result.is_err());
    }

    #[test]
    fn null_byte_is_rejected() {
        let result = normalize_path("foo\0bar", &PathBuf::from("/workspace"));
        assert!(result.is_err());
    }

    #[test]
    fn system_path_is_denied() {
        let policy = WorkspaceBoundaryPolicy::new(PermissionMode::Workspace, PathBuf::from("/workspace"));
        let (result, _) = policy.check("filesystem.read", "/etc/passwd", &HashMap::new());
        assert_eq!(result, PermissionResult::Deny);
    }

    #[test]
    fn delete_always_asks_in_workspace_mode() {
        let policy = WorkspaceBoundaryPolicy::new(PermissionMode::Workspace, PathBuf::from("/workspace"));
        let (result, _) = policy.check("filesystem.delete", "/workspace/file.txt", &HashMap::new());
        assert_eq!(result, PermissionResult::Ask);
    }

    #[test]
    fn sensitive_pattern_asks() {
        let policy = WorkspaceBoundaryPolicy::new(PermissionMode::Workspace, PathBuf::from("/workspace"));
        let (result, _) = policy.check("filesystem.read", "/workspace/.env", &HashMap::new());
        assert_eq!(result, PermissionResult::Ask);
    }
}
