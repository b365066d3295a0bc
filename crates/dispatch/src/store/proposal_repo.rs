//! Self-modification proposal rows.

use super::{format_ts, parse_ts, parse_ts_opt, store_err};
use crate::model::{MutationProposal, ProposalStatus};
use berth_core::error::{PlatformError, PlatformResult};
use berth_session::store::Db;
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct ProposalRepo {
    db: Db,
}

impl ProposalRepo {
    pub fn new(db: Db) -> Self {
        ProposalRepo { db }
    }

    pub async fn insert(&self, proposal: &MutationProposal) -> PlatformResult<()> {
        let row = proposal.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_mutation_proposals
                         (id, workflow_id, execution_id, user_id, base_workflow_hash,
                          proposed_data, description, status, created_at, expires_at,
                          applied_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
                    params![
                        row.id,
                        row.workflow_id,
                        row.execution_id,
                        row.user_id,
                        row.base_workflow_hash,
                        row.proposed_data.to_string(),
                        row.description,
                        row.status.as_str(),
                        format_ts(&row.created_at),
                        format_ts(&row.expires_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, proposal_id: &str) -> PlatformResult<Option<MutationProposal>> {
        let id = proposal_id.to_string();
        let row: Option<ProposalRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, workflow_id, execution_id, user_id, base_workflow_hash,
                            proposed_data, description, status, created_at, expires_at,
                            applied_at
                     FROM workflow_mutation_proposals WHERE id = ?",
                    params![id],
                    ProposalRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(ProposalRow::into_proposal).transpose()
    }

    pub async fn require(&self, proposal_id: &str) -> PlatformResult<MutationProposal> {
        self.get(proposal_id)
            .await?
            .ok_or_else(|| PlatformError::not_found("proposal", proposal_id))
    }

    pub async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> PlatformResult<Vec<MutationProposal>> {
        let id = workflow_id.to_string();
        let rows: Vec<ProposalRow> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, execution_id, user_id, base_workflow_hash,
                            proposed_data, description, status, created_at, expires_at,
                            applied_at
                     FROM workflow_mutation_proposals
                     WHERE workflow_id = ? ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![id], ProposalRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(ProposalRow::into_proposal).collect()
    }

    /// Guarded status move from `pending` (and `approved`, for apply).
    pub async fn set_status(
        &self,
        proposal_id: &str,
        from: &[ProposalStatus],
        to: ProposalStatus,
    ) -> PlatformResult<bool> {
        let id = proposal_id.to_string();
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let applied_at = (to == ProposalStatus::Applied)
            .then(|| format_ts(&OffsetDateTime::now_utc()));
        self.db
            .run(move |conn| {
                let placeholders = vec!["?"; from.len()].join(", ");
                let sql = format!(
                    "UPDATE workflow_mutation_proposals
                     SET status = ?, applied_at = COALESCE(?, applied_at)
                     WHERE id = ? AND status IN ({placeholders})"
                );
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
                    Box::new(to.as_str().to_string()),
                    Box::new(applied_at),
                    Box::new(id),
                ];
                for status in from {
                    values.push(Box::new(status));
                }
                let refs: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                let n = conn.execute(&sql, refs.as_slice())?;
                Ok(n > 0)
            })
            .await
    }

    /// Expire pending proposals past their deadline; returns how many.
    pub async fn expire_overdue(&self, now: OffsetDateTime) -> PlatformResult<u32> {
        let cutoff = format_ts(&now);
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_mutation_proposals SET status = 'expired'
                     WHERE status = 'pending' AND expires_at <= ?",
                    params![cutoff],
                )?;
                Ok(n as u32)
            })
            .await
    }
}

struct ProposalRow {
    id: String,
    workflow_id: String,
    execution_id: Option<String>,
    user_id: String,
    base_workflow_hash: String,
    proposed_data: String,
    description: Option<String>,
    status: String,
    created_at: String,
    expires_at: String,
    applied_at: Option<String>,
}

impl ProposalRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(ProposalRow {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            execution_id: row.get(2)?,
            user_id: row.get(3)?,
            base_workflow_hash: row.get(4)?,
            proposed_data: row.get(5)?,
            description: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
            expires_at: row.get(9)?,
            applied_at: row.get(10)?,
        })
    }

    fn into_proposal(self) -> PlatformResult<MutationProposal> {
        Ok(MutationProposal {
            id: self.id,
            workflow_id: self.workflow_id,
            execution_id: self.execution_id,
            user_id: self.user_id,
            base_workflow_hash: self.base_workflow_hash,
            proposed_data: serde_json::from_str(&self.proposed_data).map_err(store_err)?,
            description: self.description,
            status: self.status.parse().map_err(store_err)?,
            created_at: parse_ts(&self.created_at),
            expires_at: parse_ts(&self.expires_at),
            applied_at: parse_ts_opt(self.applied_at),
        })
    }
}
