//! Session rows.

use super::{format_ts, parse_ts, Db};
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::SessionView;
use berth_core::status::{SessionPurpose, SessionStatus};
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;
use uuid::Uuid;

/// One row of the `sessions` table. The runner token is stored only as a
/// SHA-256 hash; the plaintext exists transiently at mint time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub owner_id: String,
    pub workspace: String,
    pub status: SessionStatus,
    pub purpose: SessionPurpose,
    pub parent_id: Option<String>,
    pub persona_id: Option<String>,
    pub gateway_url: Option<String>,
    pub sandbox_id: Option<String>,
    pub runner_token_hash: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_active_at: OffsetDateTime,
}

impl SessionRecord {
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            workspace: self.workspace.clone(),
            status: self.status,
            purpose: self.purpose,
            parent_id: self.parent_id.clone(),
            persona_id: self.persona_id.clone(),
            gateway_url: self.gateway_url.clone(),
            sandbox_id: self.sandbox_id.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
        }
    }

    /// Orchestrator and workflow sessions are never visible to users
    /// other than the owner.
    pub fn visible_to(&self, user_id: &str) -> bool {
        match self.purpose {
            SessionPurpose::Interactive => true,
            _ => self.owner_id == user_id,
        }
    }
}

/// Fields for creating a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner_id: String,
    pub workspace: String,
    pub purpose: SessionPurpose,
    pub parent_id: Option<String>,
    pub persona_id: Option<String>,
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Db,
}

impl SessionRepo {
    pub fn new(db: Db) -> Self {
        SessionRepo { db }
    }

    pub async fn create(&self, new: NewSession) -> PlatformResult<SessionRecord> {
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            id: Uuid::now_v7().to_string(),
            owner_id: new.owner_id,
            workspace: new.workspace,
            status: SessionStatus::Initializing,
            purpose: new.purpose,
            parent_id: new.parent_id,
            persona_id: new.persona_id,
            gateway_url: None,
            sandbox_id: None,
            runner_token_hash: None,
            created_at: now,
            last_active_at: now,
        };
        let row = record.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, owner_id, workspace, status, purpose, parent_id,
                         persona_id, gateway_url, sandbox_id, runner_token_hash, created_at,
                         last_active_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        row.id,
                        row.owner_id,
                        row.workspace,
                        row.status.as_str(),
                        row.purpose.as_str(),
                        row.parent_id,
                        row.persona_id,
                        row.gateway_url,
                        row.sandbox_id,
                        row.runner_token_hash,
                        format_ts(&row.created_at),
                        format_ts(&row.last_active_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    pub async fn get(&self, session_id: &str) -> PlatformResult<Option<SessionRecord>> {
        let id = session_id.to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, workspace, status, purpose, parent_id, persona_id,
                            gateway_url, sandbox_id, runner_token_hash, created_at, last_active_at
                     FROM sessions WHERE id = ?",
                    params![id],
                    row_to_record,
                )
                .optional()
            })
            .await
    }

    pub async fn require(&self, session_id: &str) -> PlatformResult<SessionRecord> {
        self.get(session_id)
            .await?
            .ok_or_else(|| PlatformError::not_found("session", session_id))
    }

    /// Sessions visible to a user: their own, plus other users'
    /// interactive sessions are out of scope here — list is per-owner.
    pub async fn list_for_owner(&self, owner_id: &str) -> PlatformResult<Vec<SessionRecord>> {
        let owner = owner_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, workspace, status, purpose, parent_id, persona_id,
                            gateway_url, sandbox_id, runner_token_hash, created_at, last_active_at
                     FROM sessions WHERE owner_id = ? ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![owner], row_to_record)?;
                rows.collect()
            })
            .await
    }

    /// The user's orchestrator session, if one exists.
    pub async fn find_orchestrator(&self, owner_id: &str) -> PlatformResult<Option<SessionRecord>> {
        let owner = owner_id.to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, workspace, status, purpose, parent_id, persona_id,
                            gateway_url, sandbox_id, runner_token_hash, created_at, last_active_at
                     FROM sessions
                     WHERE owner_id = ? AND purpose = 'orchestrator'
                     ORDER BY created_at DESC LIMIT 1",
                    params![owner],
                    row_to_record,
                )
                .optional()
            })
            .await
    }

    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> PlatformResult<()> {
        let id = session_id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = ? WHERE id = ?",
                    params![status.as_str(), id],
                )?;
                Ok(())
            })
            .await
    }

    /// Bump `last_active_at`, keeping it monotonic non-decreasing.
    pub async fn touch(&self, session_id: &str) -> PlatformResult<()> {
        let id = session_id.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE sessions SET last_active_at = MAX(last_active_at, ?) WHERE id = ?",
                    params![now, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_runner_token_hash(
        &self,
        session_id: &str,
        hash: &str,
    ) -> PlatformResult<()> {
        let id = session_id.to_string();
        let hash = hash.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE sessions SET runner_token_hash = ? WHERE id = ?",
                    params![hash, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_sandbox(
        &self,
        session_id: &str,
        gateway_url: Option<String>,
        sandbox_id: Option<String>,
    ) -> PlatformResult<()> {
        let id = session_id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE sessions SET gateway_url = ?, sandbox_id = ? WHERE id = ?",
                    params![gateway_url, sandbox_id, id],
                )?;
                Ok(())
            })
            .await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<SessionRecord, rusqlite::Error> {
    let status: String = row.get(3)?;
    let purpose: String = row.get(4)?;
    let created_at: String = row.get(10)?;
    let last_active_at: String = row.get(11)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        workspace: row.get(2)?,
        status: status.parse().unwrap_or(SessionStatus::Error),
        purpose: purpose.parse().unwrap_or(SessionPurpose::Interactive),
        parent_id: row.get(5)?,
        persona_id: row.get(6)?,
        gateway_url: row.get(7)?,
        sandbox_id: row.get(8)?,
        runner_token_hash: row.get(9)?,
        created_at: parse_ts(&created_at),
        last_active_at: parse_ts(&last_active_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;

    fn new_session(owner: &str, purpose: SessionPurpose) -> NewSession {
        NewSession {
            owner_id: owner.into(),
            workspace: "repo".into(),
            purpose,
            parent_id: None,
            persona_id: None,
        }
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let store = SessionStore::open_in_memory().unwrap();
        let created = store
            .sessions
            .create(new_session("u1", SessionPurpose::Interactive))
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Initializing);

        let loaded = store.sessions.require(&created.id).await.unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.owner_id, "u1");
    }

    #[tokio::test]
    async fn require_missing_is_not_found() {
        let store = SessionStore::open_in_memory().unwrap();
        let err = store.sessions.require("nope").await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn orchestrator_lookup_ignores_other_purposes() {
        let store = SessionStore::open_in_memory().unwrap();
        store
            .sessions
            .create(new_session("u1", SessionPurpose::Interactive))
            .await
            .unwrap();
        assert!(store.sessions.find_orchestrator("u1").await.unwrap().is_none());

        let orch = store
            .sessions
            .create(new_session("u1", SessionPurpose::Orchestrator))
            .await
            .unwrap();
        let found = store.sessions.find_orchestrator("u1").await.unwrap().unwrap();
        assert_eq!(found.id, orch.id);
        assert!(store.sessions.find_orchestrator("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_is_monotonic() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = store
            .sessions
            .create(new_session("u1", SessionPurpose::Interactive))
            .await
            .unwrap();
        store.sessions.touch(&session.id).await.unwrap();
        let after = store.sessions.require(&session.id).await.unwrap();
        assert!(after.last_active_at >= session.last_active_at);
    }

    #[test]
    fn workflow_sessions_hidden_from_other_users() {
        let record = SessionRecord {
            id: "s".into(),
            owner_id: "u1".into(),
            workspace: "w".into(),
            status: SessionStatus::Idle,
            purpose: SessionPurpose::Workflow,
            parent_id: None,
            persona_id: None,
            gateway_url: None,
            sandbox_id: None,
            runner_token_hash: None,
            created_at: OffsetDateTime::now_utc(),
            last_active_at: OffsetDateTime::now_utc(),
        };
        assert!(record.visible_to("u1"));
        assert!(!record.visible_to("u2"));
    }
}
