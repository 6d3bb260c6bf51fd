//! SQL persistence of finished runs.
//!
//! All operations run inside a caller-owned transaction, normally one
//! opened by `Transactor::transact`.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::adapters::SqliteTransaction;
use crate::domain::{Run, RunState, TaskResult, TaskRunResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id TEXT PRIMARY KEY,
    pipeline_spec_id INTEGER NOT NULL,
    job_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    inputs TEXT NOT NULL,
    outputs TEXT,
    errors TEXT NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_job_created
    ON pipeline_runs (job_id, created_at);

CREATE TABLE IF NOT EXISTS pipeline_task_runs (
    id TEXT PRIMARY KEY,
    pipeline_run_id TEXT NOT NULL REFERENCES pipeline_runs (id) ON DELETE CASCADE,
    task_name TEXT NOT NULL,
    value TEXT,
    error TEXT,
    is_terminal INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);
"#;

/// A persisted run without its task results
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline_spec_id: i32,
    pub job_id: i32,
    pub state: RunState,
    pub outputs: Option<serde_json::Value>,
    pub errors: Vec<Option<String>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Raw column values of a `pipeline_runs` row
type RunRow = (
    String,
    i32,
    i32,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
);

pub struct RunStore;

impl RunStore {
    /// Create tables if they do not exist
    pub fn migrate(tx: &SqliteTransaction) -> Result<()> {
        tx.connection()?
            .execute_batch(SCHEMA)
            .context("Failed to create run tables")
    }

    /// Insert a finished run and all of its task results
    pub fn insert_finished_run(tx: &SqliteTransaction, run: &Run) -> Result<()> {
        if run.is_running() {
            anyhow::bail!("Run {} is not finished", run.id);
        }

        let conn = tx.connection()?;

        conn.execute(
            "INSERT INTO pipeline_runs
                (id, pipeline_spec_id, job_id, state, inputs, outputs, errors, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id.to_string(),
                run.pipeline_spec_id,
                run.job_id,
                run.state.as_str(),
                serde_json::to_string(&run.inputs)?,
                run.outputs.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&run.errors)?,
                run.created_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
        .with_context(|| format!("Failed to insert run {}", run.id))?;

        let mut stmt = conn.prepare(
            "INSERT INTO pipeline_task_runs
                (id, pipeline_run_id, task_name, value, error, is_terminal, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for trr in &run.task_runs {
            stmt.execute(params![
                trr.id.to_string(),
                run.id.to_string(),
                trr.task_name,
                trr.result.value.as_ref().map(serde_json::to_string).transpose()?,
                trr.result.error,
                trr.is_terminal,
                trr.created_at.to_rfc3339(),
                trr.finished_at.to_rfc3339(),
            ])
            .with_context(|| format!("Failed to insert task run '{}'", trr.task_name))?;
        }

        Ok(())
    }

    /// Most recent runs first
    pub fn list_runs(tx: &SqliteTransaction, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = tx.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, pipeline_spec_id, job_id, state, outputs, errors, created_at, finished_at
             FROM pipeline_runs
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<RunRow>>>()
            .context("Failed to list runs")?;

        rows.into_iter().map(summary_from_row).collect()
    }

    pub fn count_runs(tx: &SqliteTransaction) -> Result<i64> {
        tx.connection()?
            .query_row("SELECT COUNT(*) FROM pipeline_runs", [], |row| row.get(0))
            .context("Failed to count runs")
    }

    /// Look up one run
    pub fn find_run(tx: &SqliteTransaction, id: Uuid) -> Result<Option<RunSummary>> {
        let row: Option<RunRow> = tx
            .connection()?
            .query_row(
                "SELECT id, pipeline_spec_id, job_id, state, outputs, errors, created_at, finished_at
                 FROM pipeline_runs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("Failed to load run {}", id))?;

        row.map(summary_from_row).transpose()
    }

    /// Task results of one run, in execution order
    pub fn task_runs(tx: &SqliteTransaction, run_id: Uuid) -> Result<Vec<TaskRunResult>> {
        let conn = tx.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_name, value, error, is_terminal, created_at, finished_at
             FROM pipeline_task_runs
             WHERE pipeline_run_id = ?1
             ORDER BY rowid",
        )?;

        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load task runs")?;

        rows.into_iter()
            .map(|(id, task_name, value, error, is_terminal, created_at, finished_at)| -> Result<TaskRunResult> {
                Ok(TaskRunResult {
                    id: Uuid::from_str(&id)?,
                    task_name,
                    result: TaskResult {
                        value: value.as_deref().map(serde_json::from_str).transpose()?,
                        error,
                    },
                    is_terminal,
                    created_at: parse_time(&created_at)?,
                    finished_at: parse_time(&finished_at)?,
                })
            })
            .collect()
    }
}

fn summary_from_row(row: RunRow) -> Result<RunSummary> {
    let (id, pipeline_spec_id, job_id, state, outputs, errors, created_at, finished_at) = row;

    Ok(RunSummary {
        id: Uuid::from_str(&id).with_context(|| format!("Invalid run id: {}", id))?,
        pipeline_spec_id,
        job_id,
        state: RunState::parse(&state)
            .with_context(|| format!("Invalid run state: {}", state))?,
        outputs: outputs.as_deref().map(serde_json::from_str).transpose()?,
        errors: serde_json::from_str(&errors).context("Invalid run errors")?,
        created_at: parse_time(&created_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
    })
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}
