//! Dispatch-side store: triggers, workflows, executions, step traces,
//! version history and mutation proposals.
//!
//! Shares the session database (the stale-execution sweep joins
//! `workflow_executions` to `sessions` directly), via the same
//! connection handle.

pub mod execution_repo;
pub mod proposal_repo;
pub mod trigger_repo;
pub mod workflow_repo;

use berth_core::error::{PlatformError, PlatformResult};
use berth_session::store::Db;
use rusqlite::Connection;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct DispatchStore {
    pub triggers: trigger_repo::TriggerRepo,
    pub workflows: workflow_repo::WorkflowRepo,
    pub executions: execution_repo::ExecutionRepo,
    pub proposals: proposal_repo::ProposalRepo,
}

impl DispatchStore {
    /// Attach to the shared database, creating the dispatch tables.
    pub async fn attach(db: Db) -> PlatformResult<Self> {
        db.run(|conn| init_schema(conn)).await?;
        Ok(DispatchStore {
            triggers: trigger_repo::TriggerRepo::new(db.clone()),
            workflows: workflow_repo::WorkflowRepo::new(db.clone()),
            executions: execution_repo::ExecutionRepo::new(db.clone()),
            proposals: proposal_repo::ProposalRepo::new(db),
        })
    }
}

pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            workflow_id TEXT,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            type TEXT NOT NULL,
            config TEXT NOT NULL,
            variable_mapping TEXT,
            last_run_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_triggers_user ON triggers(user_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_triggers_webhook_path
            ON triggers(user_id, json_extract(config, '$.path'))
            WHERE type = 'webhook';

        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            version TEXT NOT NULL,
            hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id);

        CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            trigger_id TEXT,
            status TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            trigger_metadata TEXT NOT NULL,
            variables TEXT NOT NULL,
            outputs TEXT,
            error TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            workflow_version TEXT,
            workflow_hash TEXT NOT NULL,
            workflow_snapshot TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            session_id TEXT NOT NULL,
            resume_token TEXT,
            runtime_state TEXT,
            initiator_type TEXT NOT NULL,
            initiator_user_id TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 1,
            UNIQUE (workflow_id, idempotency_key)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_user_active
            ON workflow_executions(user_id)
            WHERE status IN ('pending', 'running', 'waiting_approval');
        CREATE INDEX IF NOT EXISTS idx_executions_workflow
            ON workflow_executions(workflow_id);
        CREATE INDEX IF NOT EXISTS idx_executions_session
            ON workflow_executions(session_id);

        CREATE TABLE IF NOT EXISTS workflow_execution_steps (
            execution_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            input TEXT,
            output TEXT,
            error TEXT,
            started_at TEXT,
            completed_at TEXT,
            PRIMARY KEY (execution_id, step_id, attempt),
            FOREIGN KEY (execution_id) REFERENCES workflow_executions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS workflow_version_history (
            workflow_id TEXT NOT NULL,
            workflow_hash TEXT NOT NULL,
            version TEXT NOT NULL,
            data TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (workflow_id, workflow_hash)
        );

        CREATE TABLE IF NOT EXISTS workflow_mutation_proposals (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL,
            execution_id TEXT,
            user_id TEXT NOT NULL,
            base_workflow_hash TEXT NOT NULL,
            proposed_data TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            applied_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_proposals_workflow
            ON workflow_mutation_proposals(workflow_id)
            WHERE status = 'pending';
        "#,
    )
}

pub(crate) fn format_ts(ts: &OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

pub(crate) fn parse_ts(raw: &str) -> OffsetDateTime {
    OffsetDateTime::parse(raw, &Rfc3339).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<OffsetDateTime> {
    raw.map(|s| parse_ts(&s))
}

pub(crate) fn json_or_null(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn store_err(e: impl std::fmt::Display) -> PlatformError {
    PlatformError::Store(e.to_string())
}
