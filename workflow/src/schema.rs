use rusqlite::Connection;

use crate::error::Result;

/// Bump when the DDL below changes shape; `init_schema` drops and recreates
/// on a mismatch rather than migrating in place, matching the teacher
/// pack's SQLite layers (no running system has upgrade-in-place needs yet).
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let user_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if user_version != SCHEMA_VERSION {
        if user_version != 0 {
            drop_all_tables(conn)?;
        }
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_id         TEXT PRIMARY KEY,
                task_id             TEXT NOT NULL,
                blueprint_id        TEXT,
                project_id          TEXT,
                status              TEXT NOT NULL,
                phase               TEXT NOT NULL,
                progress            INTEGER NOT NULL DEFAULT 0,
                started_at          TEXT,
                updated_at          TEXT NOT NULL,
                completed_at        TEXT,
                context_snapshot_id TEXT,
                phase_results       TEXT NOT NULL DEFAULT '[]',
                artifacts           TEXT NOT NULL DEFAULT '{}',
                error_message       TEXT,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                config              TEXT NOT NULL DEFAULT '{}',
                created_at          TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_workflow_states_task
                ON workflow_states(task_id);
            CREATE INDEX IF NOT EXISTS idx_workflow_states_project
                ON workflow_states(project_id);
            CREATE INDEX IF NOT EXISTS idx_workflow_states_status
                ON workflow_states(status);

            CREATE TABLE IF NOT EXISTS context_snapshots (
                snapshot_id          TEXT PRIMARY KEY,
                workflow_id          TEXT NOT NULL,
                phase                TEXT NOT NULL,
                created_at           TEXT NOT NULL,
                conversation_history TEXT NOT NULL DEFAULT '[]',
                tool_outputs         TEXT NOT NULL DEFAULT '{}',
                metadata             TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (workflow_id) REFERENCES workflow_states(workflow_id)
            );

            CREATE INDEX IF NOT EXISTS idx_context_snapshots_workflow
                ON context_snapshots(workflow_id);
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

pub fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS context_snapshots;
        DROP TABLE IF EXISTS workflow_states;
        "#,
    )?;
    Ok(())
}
