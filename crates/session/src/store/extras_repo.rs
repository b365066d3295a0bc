//! Side tables the runner reaches through the holder: prompt-queue
//! persistence, git state, files-changed, user memory, the cross-session
//! mailbox and the task board.

use super::{format_ts, Db};
use berth_core::error::PlatformResult;
use berth_core::protocol::QueuedPrompt;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct ExtrasRepo {
    db: Db,
}

impl ExtrasRepo {
    pub fn new(db: Db) -> Self {
        ExtrasRepo { db }
    }

    // ── Prompt queue persistence ─────────────────────────────────────────

    /// Persist a queued prompt; returns the row id used to delete it once
    /// the prompt finishes.
    pub async fn queue_push(
        &self,
        session_id: &str,
        prompt: &QueuedPrompt,
    ) -> PlatformResult<i64> {
        let session = session_id.to_string();
        let json = serde_json::to_string(prompt)?;
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_prompt_queue (session_id, prompt, enqueued_at)
                     VALUES (?, ?, ?)",
                    params![session, json, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Rewrite a coalesced prompt in place.
    pub async fn queue_update(&self, row_id: i64, prompt: &QueuedPrompt) -> PlatformResult<()> {
        let json = serde_json::to_string(prompt)?;
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE session_prompt_queue SET prompt = ? WHERE rowid = ?",
                    params![json, row_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn queue_remove(&self, row_id: i64) -> PlatformResult<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM session_prompt_queue WHERE rowid = ?",
                    params![row_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Replay persisted prompts in enqueue order. Prompts that were in
    /// flight when the holder died come back as queued.
    pub async fn queue_list(
        &self,
        session_id: &str,
    ) -> PlatformResult<Vec<(i64, QueuedPrompt)>> {
        let session = session_id.to_string();
        let rows: Vec<(i64, String)> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT rowid, prompt FROM session_prompt_queue
                     WHERE session_id = ? ORDER BY rowid ASC",
                )?;
                let rows = stmt.query_map(params![session], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect()
            })
            .await?;
        let mut prompts = Vec::with_capacity(rows.len());
        for (row_id, json) in rows {
            match serde_json::from_str(&json) {
                Ok(prompt) => prompts.push((row_id, prompt)),
                Err(e) => log::warn!("queue replay: dropping bad row {row_id}: {e}"),
            }
        }
        Ok(prompts)
    }

    // ── Git state / files changed ────────────────────────────────────────

    pub async fn set_git_state(&self, session_id: &str, state: &Value) -> PlatformResult<()> {
        let session = session_id.to_string();
        let json = state.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_git_state (session_id, state, updated_at)
                     VALUES (?, ?, ?)
                     ON CONFLICT(session_id) DO UPDATE SET
                         state = excluded.state, updated_at = excluded.updated_at",
                    params![session, json, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn git_state(&self, session_id: &str) -> PlatformResult<Option<Value>> {
        let session = session_id.to_string();
        let raw: Option<String> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT state FROM session_git_state WHERE session_id = ?",
                    params![session],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn set_files_changed(
        &self,
        session_id: &str,
        files: &[String],
    ) -> PlatformResult<()> {
        let session = session_id.to_string();
        let json = serde_json::to_string(files)?;
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_files_changed (session_id, files, updated_at)
                     VALUES (?, ?, ?)
                     ON CONFLICT(session_id) DO UPDATE SET
                         files = excluded.files, updated_at = excluded.updated_at",
                    params![session, json, now],
                )?;
                Ok(())
            })
            .await
    }

    // ── User memory ──────────────────────────────────────────────────────

    pub async fn memory_write(
        &self,
        user_id: &str,
        key: &str,
        value: &Value,
    ) -> PlatformResult<()> {
        let user = user_id.to_string();
        let key = key.to_string();
        let json = value.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_memory (user_id, key, value, updated_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(user_id, key) DO UPDATE SET
                         value = excluded.value, updated_at = excluded.updated_at",
                    params![user, key, json, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn memory_read(&self, user_id: &str, key: &str) -> PlatformResult<Option<Value>> {
        let user = user_id.to_string();
        let key = key.to_string();
        let raw: Option<String> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT value FROM session_memory WHERE user_id = ? AND key = ?",
                    params![user, key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub async fn memory_list(&self, user_id: &str) -> PlatformResult<Vec<String>> {
        let user = user_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM session_memory WHERE user_id = ? ORDER BY key ASC",
                )?;
                let rows = stmt.query_map(params![user], |row| row.get(0))?;
                rows.collect()
            })
            .await
    }

    // ── Mailbox ──────────────────────────────────────────────────────────

    pub async fn mailbox_send(
        &self,
        to_session: &str,
        from_session: &str,
        body: &str,
    ) -> PlatformResult<()> {
        let to = to_session.to_string();
        let from = from_session.to_string();
        let body = body.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_mailbox (to_session, from_session, body, read, created_at)
                     VALUES (?, ?, ?, 0, ?)",
                    params![to, from, body, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Drain unread mail for a session, marking it read.
    pub async fn mailbox_check(&self, session_id: &str) -> PlatformResult<Vec<Value>> {
        let session = session_id.to_string();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mail = {
                    let mut stmt = tx.prepare(
                        "SELECT rowid, from_session, body, created_at FROM session_mailbox
                         WHERE to_session = ? AND read = 0 ORDER BY rowid ASC",
                    )?;
                    let rows = stmt.query_map(params![session], |row| {
                        let rowid: i64 = row.get(0)?;
                        let from: String = row.get(1)?;
                        let body: String = row.get(2)?;
                        let created_at: String = row.get(3)?;
                        Ok((rowid, from, body, created_at))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };
                let mut out = Vec::with_capacity(mail.len());
                for (rowid, from, body, created_at) in mail {
                    tx.execute(
                        "UPDATE session_mailbox SET read = 1 WHERE rowid = ?",
                        params![rowid],
                    )?;
                    out.push(serde_json::json!({
                        "from": from,
                        "body": body,
                        "createdAt": created_at,
                    }));
                }
                tx.commit()?;
                Ok(out)
            })
            .await
    }

    // ── Task board ───────────────────────────────────────────────────────

    pub async fn task_create(
        &self,
        user_id: &str,
        title: &str,
        payload: Option<Value>,
    ) -> PlatformResult<String> {
        let id = Uuid::now_v7().to_string();
        let user = user_id.to_string();
        let title = title.to_string();
        let payload = payload.map(|p| p.to_string());
        let now = format_ts(&OffsetDateTime::now_utc());
        let created = id.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO task_board (id, user_id, title, status, payload, created_at, updated_at)
                     VALUES (?, ?, ?, 'open', ?, ?, ?)",
                    params![created, user, title, payload, now, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(id)
    }

    pub async fn task_set_status(&self, task_id: &str, status: &str) -> PlatformResult<bool> {
        let id = task_id.to_string();
        let status = status.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE task_board SET status = ?, updated_at = ? WHERE id = ?",
                    params![status, now, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn task_list(&self, user_id: &str) -> PlatformResult<Vec<Value>> {
        let user = user_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, status, payload, created_at FROM task_board
                     WHERE user_id = ? ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![user], |row| {
                    let id: String = row.get(0)?;
                    let title: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let payload: Option<String> = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    Ok(serde_json::json!({
                        "id": id,
                        "title": title,
                        "status": status,
                        "payload": payload.and_then(|p| serde_json::from_str::<Value>(&p).ok()),
                        "createdAt": created_at,
                    }))
                })?;
                rows.collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session_repo::NewSession;
    use crate::store::SessionStore;
    use berth_core::protocol::QueueMode;
    use berth_core::status::SessionPurpose;

    async fn store_with_session() -> (SessionStore, String) {
        let store = SessionStore::open_in_memory().unwrap();
        let session = store
            .sessions
            .create(NewSession {
                owner_id: "u1".into(),
                workspace: "w".into(),
                purpose: SessionPurpose::Interactive,
                parent_id: None,
                persona_id: None,
            })
            .await
            .unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn queue_survives_replay() {
        let (store, session_id) = store_with_session().await;
        let first = QueuedPrompt::text("one", QueueMode::Followup);
        let second = QueuedPrompt::text("two", QueueMode::Followup);
        let row1 = store.extras.queue_push(&session_id, &first).await.unwrap();
        store.extras.queue_push(&session_id, &second).await.unwrap();

        let replayed = store.extras.queue_list(&session_id).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].1.content, "one");

        store.extras.queue_remove(row1).await.unwrap();
        let replayed = store.extras.queue_list(&session_id).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].1.content, "two");
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let (store, _) = store_with_session().await;
        store
            .extras
            .memory_write("u1", "style", &serde_json::json!({"tone": "dry"}))
            .await
            .unwrap();
        let value = store.extras.memory_read("u1", "style").await.unwrap().unwrap();
        assert_eq!(value["tone"], "dry");
        assert_eq!(store.extras.memory_list("u1").await.unwrap(), ["style"]);
        assert!(store.extras.memory_read("u2", "style").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mailbox_drains_once() {
        let (store, session_id) = store_with_session().await;
        store
            .extras
            .mailbox_send(&session_id, "other", "ping")
            .await
            .unwrap();
        let mail = store.extras.mailbox_check(&session_id).await.unwrap();
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0]["body"], "ping");

        let again = store.extras.mailbox_check(&session_id).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn task_board_crud() {
        let (store, _) = store_with_session().await;
        let id = store.extras.task_create("u1", "ship it", None).await.unwrap();
        assert!(store.extras.task_set_status(&id, "done").await.unwrap());
        let tasks = store.extras.task_list("u1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["status"], "done");
        assert!(!store.extras.task_set_status("missing", "done").await.unwrap());
    }
}
