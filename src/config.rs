//! Configuration for the Penguin runtime.
//!
//! Users construct [`PenguinConfig`] manually, or via [`PenguinConfig::from_env`]
//! which applies the uppercased/underscored environment variable overrides
//! from the external interfaces section. No TOML/YAML/other config-file
//! parsing dependency is introduced.

use std::env;
use std::path::PathBuf;

pub use crate::permission::{AuditVerbosity, PermissionMode};

#[derive(Debug, Clone)]
pub struct PhaseTimeoutsConfig {
    pub implement_secs: u64,
    pub test_secs: u64,
    pub use_secs: u64,
    pub verify_secs: u64,
}

impl Default for PhaseTimeoutsConfig {
    fn default() -> Self {
        PhaseTimeoutsConfig {
            implement_secs: 300,
            test_secs: 300,
            use_secs: 300,
            verify_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PenguinConfig {
    /// `engine.max_iterations_default`
    pub max_iterations_default: usize,
    /// `context.max_history_tokens`
    pub max_history_tokens: usize,
    /// `context.uncategorized_budget_fraction`
    pub uncategorized_budget_fraction: f64,
    /// `context.max_images`
    pub max_context_images: usize,
    /// `permissions.mode`
    pub permissions_mode: PermissionMode,
    /// `permissions.yolo`
    pub yolo: bool,
    /// `permissions.allowed_paths`
    pub allowed_paths: Vec<String>,
    /// `permissions.denied_paths`
    pub denied_paths: Vec<String>,
    /// `permissions.require_approval`
    pub require_approval: Vec<String>,
    /// `orchestration.backend` — only "native" is implemented by this crate.
    pub orchestration_backend: String,
    /// `orchestration.phase_timeouts`
    pub phase_timeouts: PhaseTimeoutsConfig,
    /// `orchestration.default_max_retries`
    pub default_max_retries: u32,
    /// `orchestration.cleanup_completed_after_days`
    pub cleanup_completed_after_days: i64,
    /// `audit.log_file`
    pub audit_log_file: Option<PathBuf>,
    /// `audit.categories`
    pub audit_verbosity: AuditVerbosity,
    /// `audit.max_memory_entries`
    pub audit_max_memory_entries: usize,
    /// Directory workflow SQLite state is stored under.
    pub workflow_state_dir: PathBuf,
}

impl Default for PenguinConfig {
    fn default() -> Self {
        PenguinConfig {
            max_iterations_default: 5000,
            max_history_tokens: 32_000,
            uncategorized_budget_fraction: 0.05,
            max_context_images: 8,
            permissions_mode: PermissionMode::Workspace,
            yolo: false,
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            require_approval: Vec::new(),
            orchestration_backend: "native".to_string(),
            phase_timeouts: PhaseTimeoutsConfig::default(),
            default_max_retries: 3,
            cleanup_completed_after_days: 30,
            audit_log_file: None,
            audit_verbosity: AuditVerbosity::DenyOnly,
            audit_max_memory_entries: 500,
            workflow_state_dir: PathBuf::from("penguin_workflows"),
        }
    }
}

impl PenguinConfig {
    /// Applies numeric environment variable overrides on top of defaults.
    /// `YOLO=1` enables bypass mode with a loud warning, matching the
    /// external-interfaces contract.
    pub fn from_env() -> Self {
        let mut config = PenguinConfig::default();

        if let Some(v) = env_usize("MAX_HISTORY_TOKENS") {
            config.max_history_tokens = v;
        }
        if let Some(v) = env_usize("MAX_CONTEXT_IMAGES") {
            config.max_context_images = v;
        }
        if let Some(v) = env_usize("MAX_ITERATIONS_DEFAULT") {
            config.max_iterations_default = v;
        }
        if let Ok(v) = env::var("YOLO") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                log::warn!("YOLO mode enabled via environment: all permission checks are bypassed");
                config.yolo = true;
            }
        }

        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let config = PenguinConfig::default();
        assert_eq!(config.max_iterations_default, 5000);
        assert!((config.uncategorized_budget_fraction - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.orchestration_backend, "native");
    }
}
