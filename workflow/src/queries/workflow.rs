use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::state::{PhaseResult, WorkflowPhase, WorkflowState, WorkflowStatus};

fn row_to_state(row: &Row) -> rusqlite::Result<WorkflowState> {
    let status_str: String = row.get("status")?;
    let phase_str: String = row.get("phase")?;
    let phase_results_json: String = row.get("phase_results")?;
    let artifacts_json: String = row.get("artifacts")?;
    let config_json: String = row.get("config")?;

    let phase_results: Vec<PhaseResult> = serde_json::from_str(&phase_results_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let artifacts = serde_json::from_str(&artifacts_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let config = serde_json::from_str(&config_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(WorkflowState {
        workflow_id: row.get("workflow_id")?,
        task_id: row.get("task_id")?,
        blueprint_id: row.get("blueprint_id")?,
        project_id: row.get("project_id")?,
        status: status_str.parse().unwrap_or(WorkflowStatus::Failed),
        phase: phase_str.parse().unwrap_or(WorkflowPhase::Failed),
        progress: row.get::<_, i64>("progress")? as u8,
        started_at: row.get::<_, Option<DateTime<Utc>>>("started_at")?,
        updated_at: row.get("updated_at")?,
        completed_at: row.get::<_, Option<DateTime<Utc>>>("completed_at")?,
        context_snapshot_id: row.get("context_snapshot_id")?,
        phase_results,
        artifacts,
        error_message: row.get("error_message")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        config,
        created_at: row.get("created_at")?,
    })
}

pub fn insert(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO workflow_states (
            workflow_id, task_id, blueprint_id, project_id, status, phase,
            progress, started_at, updated_at, completed_at, context_snapshot_id,
            phase_results, artifacts, error_message, retry_count, config, created_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
        "#,
        params![
            state.workflow_id,
            state.task_id,
            state.blueprint_id,
            state.project_id,
            state.status.to_string(),
            state.phase.to_string(),
            state.progress as i64,
            state.started_at,
            state.updated_at,
            state.completed_at,
            state.context_snapshot_id,
            serde_json::to_string(&state.phase_results)?,
            serde_json::to_string(&state.artifacts)?,
            state.error_message,
            state.retry_count as i64,
            serde_json::to_string(&state.config)?,
            state.created_at,
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, state: &WorkflowState) -> Result<()> {
    conn.execute(
        r#"
        UPDATE workflow_states SET
            task_id = ?2, blueprint_id = ?3, project_id = ?4, status = ?5,
            phase = ?6, progress = ?7, started_at = ?8, updated_at = ?9,
            completed_at = ?10, context_snapshot_id = ?11, phase_results = ?12,
            artifacts = ?13, error_message = ?14, retry_count = ?15, config = ?16
        WHERE workflow_id = ?1
        "#,
        params![
            state.workflow_id,
            state.task_id,
            state.blueprint_id,
            state.project_id,
            state.status.to_string(),
            state.phase.to_string(),
            state.progress as i64,
            state.started_at,
            state.updated_at,
            state.completed_at,
            state.context_snapshot_id,
            serde_json::to_string(&state.phase_results)?,
            serde_json::to_string(&state.artifacts)?,
            state.error_message,
            state.retry_count as i64,
            serde_json::to_string(&state.config)?,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowState>> {
    let result = conn
        .query_row(
            "SELECT * FROM workflow_states WHERE workflow_id = ?1",
            [workflow_id],
            row_to_state,
        )
        .optional()?;
    Ok(result)
}

pub fn get_by_task(conn: &Connection, task_id: &str) -> Result<Vec<WorkflowState>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM workflow_states WHERE task_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt
        .query_map([task_id], row_to_state)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(rows)
}

pub fn list(conn: &Connection, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowState>> {
    let rows = match status {
        Some(status) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM workflow_states WHERE status = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([status.to_string()], row_to_state)?
                .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT * FROM workflow_states ORDER BY created_at DESC")?;
            let rows = stmt
                .query_map([], row_to_state)?
                .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Returns workflows left in a non-terminal status, used at backend
/// construction time to mark them failed after an unclean process exit.
pub fn list_non_terminal(conn: &Connection) -> Result<Vec<WorkflowState>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM workflow_states WHERE status NOT IN ('completed','failed','cancelled')",
    )?;
    let rows = stmt
        .query_map([], row_to_state)?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(rows)
}

pub fn delete_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM context_snapshots WHERE workflow_id IN (
            SELECT workflow_id FROM workflow_states WHERE completed_at IS NOT NULL AND completed_at < ?1
        )",
        params![cutoff],
    )?;
    let deleted = tx.execute(
        "DELETE FROM workflow_states WHERE completed_at IS NOT NULL AND completed_at < ?1",
        params![cutoff],
    )?;
    tx.commit()?;
    Ok(deleted)
}
