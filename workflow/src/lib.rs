//! Durable ITUV (Implement/Test/Use/Verify) workflow orchestration, backed
//! by SQLite. See `backend::NativeOrchestrationBackend` for the entry point;
//! callers supply a `PhaseExecutor` (typically an adapter over an `Engine`
//! from the `penguin-core` crate) to actually carry out a phase.

pub mod backend;
pub mod error;
pub mod queries;
pub mod retry;
pub mod schema;
pub mod state;

pub use backend::{Feedback, NativeOrchestrationBackend, PhaseExecutor, PhaseOutcome, PhaseTimeouts};
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use state::{ContextSnapshot, PhaseResult, WorkflowInfo, WorkflowPhase, WorkflowState, WorkflowStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    struct AlwaysSucceeds;

    #[async_trait]
    impl PhaseExecutor for AlwaysSucceeds {
        async fn execute_phase(
            &self,
            _workflow_id: &str,
            _task_id: &str,
            phase: WorkflowPhase,
            _config: &serde_json::Value,
            _feedback: Arc<Mutex<mpsc::UnboundedReceiver<Feedback>>>,
        ) -> std::result::Result<PhaseOutcome, String> {
            Ok(PhaseOutcome {
                success: true,
                output: format!("{} ok", phase),
                artifacts: json!({}),
                tool_outputs: json!({}),
            })
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_completed() {
        let backend = NativeOrchestrationBackend::open_in_memory(Arc::new(AlwaysSucceeds)).unwrap();
        let workflow_id = backend.start_workflow("T1", None, json!({})).await.unwrap();

        for _ in 0..50 {
            let info = backend.get_workflow_status(&workflow_id).await.unwrap();
            if info.status == WorkflowStatus::Completed {
                assert_eq!(info.progress, 100);
                let state = backend.get_workflow_result(&workflow_id).await.unwrap();
                assert_eq!(state.phase_results.len(), 4);
                assert!(state.phase_results.iter().all(|r| r.success));
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("workflow did not complete in time");
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let backend = NativeOrchestrationBackend::open_in_memory(Arc::new(AlwaysSucceeds)).unwrap();
        let workflow_id = backend.start_workflow("T2", None, json!({})).await.unwrap();
        backend.cancel_workflow(&workflow_id).await.unwrap();
        let info = backend.get_workflow_status(&workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Cancelled);
        // idempotent
        backend.cancel_workflow(&workflow_id).await.unwrap();
    }
}
