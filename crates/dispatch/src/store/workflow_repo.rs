//! Workflow rows and their version history.

use super::{format_ts, parse_ts, store_err};
use crate::model::{workflow_hash, VersionEntry, Workflow};
use berth_core::error::{PlatformError, PlatformResult};
use berth_session::store::Db;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct WorkflowRepo {
    db: Db,
}

impl WorkflowRepo {
    pub fn new(db: Db) -> Self {
        WorkflowRepo { db }
    }

    pub async fn create(
        &self,
        user_id: &str,
        name: &str,
        data: Value,
    ) -> PlatformResult<Workflow> {
        let now = OffsetDateTime::now_utc();
        let workflow = Workflow {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            hash: workflow_hash(&data),
            data,
            version: "1.0.0".to_string(),
            created_at: now,
            updated_at: now,
        };
        let row = workflow.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, user_id, name, data, version, hash,
                         created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        row.id,
                        row.user_id,
                        row.name,
                        row.data.to_string(),
                        row.version,
                        row.hash,
                        format_ts(&row.created_at),
                        format_ts(&row.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        // Seed history with the initial version.
        self.archive_version(&workflow, "sync").await?;
        Ok(workflow)
    }

    pub async fn get(&self, workflow_id: &str) -> PlatformResult<Option<Workflow>> {
        let id = workflow_id.to_string();
        let row: Option<WorkflowRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, name, data, version, hash, created_at, updated_at
                     FROM workflows WHERE id = ?",
                    params![id],
                    WorkflowRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(WorkflowRow::into_workflow).transpose()
    }

    pub async fn require(&self, workflow_id: &str) -> PlatformResult<Workflow> {
        self.get(workflow_id)
            .await?
            .ok_or_else(|| PlatformError::not_found("workflow", workflow_id))
    }

    pub async fn list_for_user(&self, user_id: &str) -> PlatformResult<Vec<Workflow>> {
        let user = user_id.to_string();
        let rows: Vec<WorkflowRow> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, name, data, version, hash, created_at, updated_at
                     FROM workflows WHERE user_id = ? ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![user], WorkflowRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(WorkflowRow::into_workflow).collect()
    }

    /// Replace the current definition (data, version, hash).
    pub async fn update_definition(
        &self,
        workflow_id: &str,
        data: &Value,
        version: &str,
    ) -> PlatformResult<()> {
        let id = workflow_id.to_string();
        let data_json = data.to_string();
        let hash = workflow_hash(data);
        let version = version.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE workflows SET data = ?, version = ?, hash = ?, updated_at = ?
                     WHERE id = ?",
                    params![data_json, version, hash, now, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Archive a workflow version, keyed `(workflow_id, workflow_hash)`.
    /// Duplicate archives of the same snapshot are silently ignored.
    pub async fn archive_version(&self, workflow: &Workflow, source: &str) -> PlatformResult<()> {
        let id = workflow.id.clone();
        let hash = workflow.hash.clone();
        let version = workflow.version.clone();
        let data = workflow.data.to_string();
        let source = source.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_version_history
                         (workflow_id, workflow_hash, version, data, source, created_at)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT (workflow_id, workflow_hash) DO NOTHING",
                    params![id, hash, version, data, source, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn history_lookup(
        &self,
        workflow_id: &str,
        hash: &str,
    ) -> PlatformResult<Option<VersionEntry>> {
        let id = workflow_id.to_string();
        let hash = hash.to_string();
        let row: Option<(String, String, String, String, String, String)> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT workflow_id, workflow_hash, version, data, source, created_at
                     FROM workflow_version_history
                     WHERE workflow_id = ? AND workflow_hash = ?",
                    params![id, hash],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;
        row.map(|(workflow_id, workflow_hash, version, data, source, created_at)| {
            Ok(VersionEntry {
                workflow_id,
                workflow_hash,
                version,
                data: serde_json::from_str(&data).map_err(store_err)?,
                source,
                created_at: parse_ts(&created_at),
            })
        })
        .transpose()
    }

    pub async fn history_for_workflow(
        &self,
        workflow_id: &str,
    ) -> PlatformResult<Vec<VersionEntry>> {
        let id = workflow_id.to_string();
        let rows: Vec<(String, String, String, String, String, String)> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT workflow_id, workflow_hash, version, data, source, created_at
                     FROM workflow_version_history
                     WHERE workflow_id = ? ORDER BY created_at DESC, rowid DESC",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?;
                rows.collect()
            })
            .await?;
        rows.into_iter()
            .map(|(workflow_id, workflow_hash, version, data, source, created_at)| {
                Ok(VersionEntry {
                    workflow_id,
                    workflow_hash,
                    version,
                    data: serde_json::from_str(&data).map_err(store_err)?,
                    source,
                    created_at: parse_ts(&created_at),
                })
            })
            .collect()
    }
}

struct WorkflowRow {
    id: String,
    user_id: String,
    name: String,
    data: String,
    version: String,
    hash: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(WorkflowRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            data: row.get(3)?,
            version: row.get(4)?,
            hash: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_workflow(self) -> PlatformResult<Workflow> {
        Ok(Workflow {
            id: self.id,
            user_id: self.user_id,
            name: self.name,
            data: serde_json::from_str(&self.data).map_err(store_err)?,
            version: self.version,
            hash: self.hash,
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::stores;
    use serde_json::json;

    #[tokio::test]
    async fn create_computes_hash_and_seeds_history() {
        let (_sessions, dispatch) = stores().await;
        let wf = dispatch
            .workflows
            .create("u1", "deploy", json!({"steps": []}))
            .await
            .unwrap();
        assert_eq!(wf.hash, workflow_hash(&json!({"steps": []})));
        assert_eq!(wf.version, "1.0.0");

        let entry = dispatch
            .workflows
            .history_lookup(&wf.id, &wf.hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.source, "sync");
        assert_eq!(entry.data, wf.data);
    }

    #[tokio::test]
    async fn duplicate_archive_is_a_no_op() {
        let (_sessions, dispatch) = stores().await;
        let wf = dispatch
            .workflows
            .create("u1", "w", json!({"steps": []}))
            .await
            .unwrap();
        // Archiving the same snapshot again keeps the original source.
        dispatch.workflows.archive_version(&wf, "rollback").await.unwrap();
        let entry = dispatch
            .workflows
            .history_lookup(&wf.id, &wf.hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.source, "sync");
    }

    #[tokio::test]
    async fn update_definition_changes_hash() {
        let (_sessions, dispatch) = stores().await;
        let wf = dispatch
            .workflows
            .create("u1", "w", json!({"steps": []}))
            .await
            .unwrap();
        dispatch
            .workflows
            .update_definition(&wf.id, &json!({"steps": [{"id": "s1"}]}), "1.0.1")
            .await
            .unwrap();
        let updated = dispatch.workflows.require(&wf.id).await.unwrap();
        assert_eq!(updated.version, "1.0.1");
        assert_ne!(updated.hash, wf.hash);
    }
}
