use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::state::{ContextSnapshot, WorkflowPhase};

fn row_to_snapshot(row: &Row) -> rusqlite::Result<ContextSnapshot> {
    let phase_str: String = row.get("phase")?;
    let conversation_history: String = row.get("conversation_history")?;
    let tool_outputs: String = row.get("tool_outputs")?;
    let metadata: String = row.get("metadata")?;

    Ok(ContextSnapshot {
        snapshot_id: row.get("snapshot_id")?,
        workflow_id: row.get("workflow_id")?,
        phase: phase_str.parse().unwrap_or(WorkflowPhase::Pending),
        created_at: row.get("created_at")?,
        conversation_history: serde_json::from_str(&conversation_history)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        tool_outputs: serde_json::from_str(&tool_outputs)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
    })
}

pub fn insert(conn: &Connection, snapshot: &ContextSnapshot) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO context_snapshots (
            snapshot_id, workflow_id, phase, created_at,
            conversation_history, tool_outputs, metadata
        ) VALUES (?1,?2,?3,?4,?5,?6,?7)
        "#,
        params![
            snapshot.snapshot_id,
            snapshot.workflow_id,
            snapshot.phase.to_string(),
            snapshot.created_at,
            serde_json::to_string(&snapshot.conversation_history)?,
            serde_json::to_string(&snapshot.tool_outputs)?,
            serde_json::to_string(&snapshot.metadata)?,
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, snapshot_id: &str) -> Result<Option<ContextSnapshot>> {
    let result = conn
        .query_row(
            "SELECT * FROM context_snapshots WHERE snapshot_id = ?1",
            [snapshot_id],
            row_to_snapshot,
        )
        .optional()?;
    Ok(result)
}

pub fn latest_for_workflow(conn: &Connection, workflow_id: &str) -> Result<Option<ContextSnapshot>> {
    let result = conn
        .query_row(
            "SELECT * FROM context_snapshots WHERE workflow_id = ?1 ORDER BY created_at DESC LIMIT 1",
            [workflow_id],
            row_to_snapshot,
        )
        .optional()?;
    Ok(result)
}
