//! Durable execution rows and their step traces.
//!
//! Status moves are guarded UPDATEs: the WHERE clause encodes the legal
//! source states, so a terminal row is never resurrected no matter how
//! late a cancel/approve arrives.

use super::{format_ts, json_or_null, parse_ts, parse_ts_opt, store_err};
use crate::model::{ExecutionStatus, ExecutionStep, WorkflowExecution};
use berth_core::error::{PlatformError, PlatformResult};
use berth_session::store::Db;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;

const EXECUTION_COLUMNS: &str = "id, workflow_id, user_id, trigger_id, status, trigger_type,
    trigger_metadata, variables, outputs, error, started_at, completed_at, workflow_version,
    workflow_hash, workflow_snapshot, idempotency_key, session_id, resume_token, runtime_state,
    initiator_type, initiator_user_id, attempt_count";

#[derive(Clone)]
pub struct ExecutionRepo {
    db: Db,
}

impl ExecutionRepo {
    pub fn new(db: Db) -> Self {
        ExecutionRepo { db }
    }

    /// Active (pending / running / waiting_approval) executions for the
    /// user, and platform-wide. Checked before any insert.
    pub async fn active_counts(&self, user_id: &str) -> PlatformResult<(u32, u32)> {
        let user = user_id.to_string();
        self.db
            .run(move |conn| {
                let user_active: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM workflow_executions
                     WHERE user_id = ? AND status IN ('pending', 'running', 'waiting_approval')",
                    params![user],
                    |row| row.get(0),
                )?;
                let global_active: u32 = conn.query_row(
                    "SELECT COUNT(*) FROM workflow_executions
                     WHERE status IN ('pending', 'running', 'waiting_approval')",
                    [],
                    |row| row.get(0),
                )?;
                Ok((user_active, global_active))
            })
            .await
    }

    /// Dedup lookup on the idempotency key.
    pub async fn find_by_idempotency(
        &self,
        workflow_id: &str,
        idempotency_key: &str,
    ) -> PlatformResult<Option<WorkflowExecution>> {
        let workflow = workflow_id.to_string();
        let key = idempotency_key.to_string();
        let row: Option<ExecutionRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                         WHERE workflow_id = ? AND idempotency_key = ?"
                    ),
                    params![workflow, key],
                    ExecutionRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    pub async fn insert(&self, execution: &WorkflowExecution) -> PlatformResult<()> {
        let row = execution.clone();
        let result = self
            .db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions
                         (id, workflow_id, user_id, trigger_id, status, trigger_type,
                          trigger_metadata, variables, outputs, error, started_at,
                          completed_at, workflow_version, workflow_hash, workflow_snapshot,
                          idempotency_key, session_id, resume_token, runtime_state,
                          initiator_type, initiator_user_id, attempt_count)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        row.id,
                        row.workflow_id,
                        row.user_id,
                        row.trigger_id,
                        row.status.as_str(),
                        row.trigger_type,
                        row.trigger_metadata.to_string(),
                        row.variables.to_string(),
                        row.outputs.as_ref().map(|v| v.to_string()),
                        row.error,
                        format_ts(&row.started_at),
                        row.completed_at.as_ref().map(format_ts),
                        row.workflow_version,
                        row.workflow_hash,
                        row.workflow_snapshot.to_string(),
                        row.idempotency_key,
                        row.session_id,
                        row.resume_token,
                        row.runtime_state.as_ref().map(|v| v.to_string()),
                        row.initiator_type,
                        row.initiator_user_id,
                        row.attempt_count as i64,
                    ],
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(PlatformError::Store(msg)) if msg.contains("UNIQUE") => Err(
                PlatformError::Conflict("execution already exists for idempotency key".into()),
            ),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, execution_id: &str) -> PlatformResult<Option<WorkflowExecution>> {
        let id = execution_id.to_string();
        let row: Option<ExecutionRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?"),
                    params![id],
                    ExecutionRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    pub async fn require(&self, execution_id: &str) -> PlatformResult<WorkflowExecution> {
        self.get(execution_id)
            .await?
            .ok_or_else(|| PlatformError::not_found("execution", execution_id))
    }

    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> PlatformResult<Vec<WorkflowExecution>> {
        let user = user_id.to_string();
        let rows: Vec<ExecutionRow> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                     WHERE user_id = ? ORDER BY started_at DESC LIMIT ?"
                ))?;
                let rows = stmt.query_map(params![user, limit as i64], ExecutionRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    // ── Guarded status moves ─────────────────────────────────────────────

    /// pending → running.
    pub async fn mark_running(&self, execution_id: &str) -> PlatformResult<bool> {
        let id = execution_id.to_string();
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_executions SET status = 'running'
                     WHERE id = ? AND status = 'pending'",
                    params![id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// running → waiting_approval, storing the resume token.
    pub async fn mark_waiting_approval(
        &self,
        execution_id: &str,
        resume_token: &str,
        runtime_state: Option<&Value>,
    ) -> PlatformResult<bool> {
        let id = execution_id.to_string();
        let token = resume_token.to_string();
        let state = runtime_state.map(|v| v.to_string());
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_executions
                     SET status = 'waiting_approval', resume_token = ?, runtime_state = ?
                     WHERE id = ? AND status = 'running'",
                    params![token, state, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// waiting_approval → running, token-checked. Clears the token and
    /// the previous error, writes the new runtime state, and counts the
    /// attempt.
    pub async fn mark_resumed(
        &self,
        execution_id: &str,
        resume_token: &str,
        runtime_state: Option<&Value>,
    ) -> PlatformResult<bool> {
        let id = execution_id.to_string();
        let token = resume_token.to_string();
        let state = runtime_state.map(|v| v.to_string());
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_executions
                     SET status = 'running', resume_token = NULL, error = NULL,
                         runtime_state = COALESCE(?, runtime_state),
                         attempt_count = attempt_count + 1
                     WHERE id = ? AND status = 'waiting_approval' AND resume_token = ?",
                    params![state, id, token],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Any non-terminal state → a terminal one. Clears the resume token
    /// and stamps `completed_at`. Returns false when the row was already
    /// terminal (callers treat that as a no-op).
    pub async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
        outputs: Option<&Value>,
    ) -> PlatformResult<bool> {
        if !status.is_terminal() {
            return Err(PlatformError::Internal(format!(
                "finalize called with non-terminal status {status}"
            )));
        }
        let id = execution_id.to_string();
        let error = error.map(|s| s.to_string());
        let outputs = outputs.map(|v| v.to_string());
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_executions
                     SET status = ?, error = ?, outputs = COALESCE(?, outputs),
                         completed_at = ?, resume_token = NULL
                     WHERE id = ? AND status IN ('pending', 'running', 'waiting_approval')",
                    params![status.as_str(), error, outputs, now, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    // ── Reconciliation queries ───────────────────────────────────────────

    /// All executions parked at the approval gate.
    pub async fn list_waiting_approval(&self) -> PlatformResult<Vec<WorkflowExecution>> {
        let rows: Vec<ExecutionRow> = self
            .db
            .run(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                     WHERE status = 'waiting_approval'"
                ))?;
                let rows = stmt.query_map([], ExecutionRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    /// Non-terminal executions whose workflow-purpose session is dead
    /// (terminated / error / hibernated). Joined against `sessions` in
    /// the shared database.
    pub async fn list_stale(&self) -> PlatformResult<Vec<(WorkflowExecution, String)>> {
        const STALE_QUERY: &str = "SELECT e.id, e.workflow_id, e.user_id, e.trigger_id,
                e.status, e.trigger_type, e.trigger_metadata, e.variables, e.outputs,
                e.error, e.started_at, e.completed_at, e.workflow_version, e.workflow_hash,
                e.workflow_snapshot, e.idempotency_key, e.session_id, e.resume_token,
                e.runtime_state, e.initiator_type, e.initiator_user_id, e.attempt_count,
                s.status
             FROM workflow_executions e
             JOIN sessions s ON s.id = e.session_id
             WHERE e.status IN ('pending', 'running', 'waiting_approval')
               AND s.status IN ('terminated', 'error', 'hibernated')";
        let rows: Vec<(ExecutionRow, String)> = self
            .db
            .run(|conn| {
                let mut stmt = conn.prepare(STALE_QUERY)?;
                let rows = stmt.query_map([], |row| {
                    let execution = ExecutionRow::from_row(row)?;
                    let session_status: String = row.get(22)?;
                    Ok((execution, session_status))
                })?;
                rows.collect()
            })
            .await?;
        rows.into_iter()
            .map(|(row, session_status)| Ok((row.into_execution()?, session_status)))
            .collect()
    }

    // ── Step trace ───────────────────────────────────────────────────────

    /// Upsert a step-trace row. On conflict the earliest non-null
    /// `started_at` and `input` are preserved while status, output,
    /// error and `completed_at` are overwritten.
    pub async fn upsert_step(&self, step: &ExecutionStep) -> PlatformResult<()> {
        let row = step.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_execution_steps
                         (execution_id, step_id, attempt, status, input, output, error,
                          started_at, completed_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT (execution_id, step_id, attempt) DO UPDATE SET
                         status = excluded.status,
                         input = COALESCE(workflow_execution_steps.input, excluded.input),
                         output = excluded.output,
                         error = excluded.error,
                         started_at = COALESCE(workflow_execution_steps.started_at,
                                               excluded.started_at),
                         completed_at = excluded.completed_at",
                    params![
                        row.execution_id,
                        row.step_id,
                        row.attempt as i64,
                        row.status,
                        row.input.as_ref().map(|v| v.to_string()),
                        row.output.as_ref().map(|v| v.to_string()),
                        row.error,
                        row.started_at.as_ref().map(format_ts),
                        row.completed_at.as_ref().map(format_ts),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn steps_for_execution(
        &self,
        execution_id: &str,
    ) -> PlatformResult<Vec<ExecutionStep>> {
        let id = execution_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT execution_id, step_id, attempt, status, input, output, error,
                            started_at, completed_at
                     FROM workflow_execution_steps
                     WHERE execution_id = ? ORDER BY step_id ASC, attempt ASC",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    let attempt: i64 = row.get(2)?;
                    let input: Option<String> = row.get(4)?;
                    let output: Option<String> = row.get(5)?;
                    let started_at: Option<String> = row.get(7)?;
                    let completed_at: Option<String> = row.get(8)?;
                    Ok(ExecutionStep {
                        execution_id: row.get(0)?,
                        step_id: row.get(1)?,
                        attempt: attempt as u32,
                        status: row.get(3)?,
                        input: json_or_null(input),
                        output: json_or_null(output),
                        error: row.get(6)?,
                        started_at: parse_ts_opt(started_at),
                        completed_at: parse_ts_opt(completed_at),
                    })
                })?;
                rows.collect()
            })
            .await
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    user_id: String,
    trigger_id: Option<String>,
    status: String,
    trigger_type: String,
    trigger_metadata: String,
    variables: String,
    outputs: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    workflow_version: Option<String>,
    workflow_hash: String,
    workflow_snapshot: String,
    idempotency_key: String,
    session_id: String,
    resume_token: Option<String>,
    runtime_state: Option<String>,
    initiator_type: String,
    initiator_user_id: Option<String>,
    attempt_count: i64,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(ExecutionRow {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            user_id: row.get(2)?,
            trigger_id: row.get(3)?,
            status: row.get(4)?,
            trigger_type: row.get(5)?,
            trigger_metadata: row.get(6)?,
            variables: row.get(7)?,
            outputs: row.get(8)?,
            error: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            workflow_version: row.get(12)?,
            workflow_hash: row.get(13)?,
            workflow_snapshot: row.get(14)?,
            idempotency_key: row.get(15)?,
            session_id: row.get(16)?,
            resume_token: row.get(17)?,
            runtime_state: row.get(18)?,
            initiator_type: row.get(19)?,
            initiator_user_id: row.get(20)?,
            attempt_count: row.get(21)?,
        })
    }

    fn into_execution(self) -> PlatformResult<WorkflowExecution> {
        Ok(WorkflowExecution {
            id: self.id,
            workflow_id: self.workflow_id,
            user_id: self.user_id,
            trigger_id: self.trigger_id,
            status: self.status.parse().map_err(store_err)?,
            trigger_type: self.trigger_type,
            trigger_metadata: serde_json::from_str(&self.trigger_metadata)
                .unwrap_or(Value::Null),
            variables: serde_json::from_str(&self.variables).unwrap_or(Value::Null),
            outputs: json_or_null(self.outputs),
            error: self.error,
            started_at: parse_ts(&self.started_at),
            completed_at: parse_ts_opt(self.completed_at),
            workflow_version: self.workflow_version,
            workflow_hash: self.workflow_hash,
            workflow_snapshot: serde_json::from_str(&self.workflow_snapshot)
                .unwrap_or(Value::Null),
            idempotency_key: self.idempotency_key,
            session_id: self.session_id,
            resume_token: self.resume_token,
            runtime_state: json_or_null(self.runtime_state),
            initiator_type: self.initiator_type,
            initiator_user_id: self.initiator_user_id,
            attempt_count: self.attempt_count as u32,
        })
    }
}
