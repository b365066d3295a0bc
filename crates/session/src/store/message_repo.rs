//! Message rows: the persisted journal.

use super::{format_ts, parse_ts, Db};
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::message::{Author, ContentPart, Message, MessageFormat, Role};
use rusqlite::params;

#[derive(Clone)]
pub struct MessageRepo {
    db: Db,
}

impl MessageRepo {
    pub fn new(db: Db) -> Self {
        MessageRepo { db }
    }

    pub async fn insert(&self, session_id: &str, msg: &Message) -> PlatformResult<()> {
        let session = session_id.to_string();
        let row = MessageRow::from_message(msg)?;
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO messages
                         (id, session_id, role, content, parts, author, channel_type,
                          channel_id, format, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        row.id,
                        session,
                        row.role,
                        row.content,
                        row.parts,
                        row.author,
                        row.channel_type,
                        row.channel_id,
                        row.format,
                        row.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist the current content/parts of an already-journaled message.
    pub async fn update(&self, session_id: &str, msg: &Message) -> PlatformResult<()> {
        let session = session_id.to_string();
        let row = MessageRow::from_message(msg)?;
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE messages SET content = ?, parts = ?
                     WHERE session_id = ? AND id = ?",
                    params![row.content, row.parts, session, row.id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn remove(&self, session_id: &str, ids: &[String]) -> PlatformResult<()> {
        let session = session_id.to_string();
        let ids = ids.to_vec();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "DELETE FROM messages WHERE session_id = ? AND id = ?",
                        params![session, id],
                    )?;
                }
                tx.commit()
            })
            .await
    }

    /// All messages of a session in insertion order.
    pub async fn list(&self, session_id: &str) -> PlatformResult<Vec<Message>> {
        let session = session_id.to_string();
        let rows: Vec<MessageRow> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, role, content, parts, author, channel_type, channel_id,
                            format, created_at
                     FROM messages WHERE session_id = ? ORDER BY rowid ASC",
                )?;
                let rows = stmt.query_map(params![session], |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        role: row.get(1)?,
                        content: row.get(2)?,
                        parts: row.get(3)?,
                        author: row.get(4)?,
                        channel_type: row.get(5)?,
                        channel_id: row.get(6)?,
                        format: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                })?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Most recent messages, oldest first, capped at `limit`.
    pub async fn list_tail(&self, session_id: &str, limit: u32) -> PlatformResult<Vec<Message>> {
        let mut all = self.list(session_id).await?;
        let keep = all.len().saturating_sub(limit as usize);
        Ok(all.split_off(keep))
    }
}

struct MessageRow {
    id: String,
    role: String,
    content: String,
    parts: Option<String>,
    author: Option<String>,
    channel_type: Option<String>,
    channel_id: Option<String>,
    format: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_message(msg: &Message) -> PlatformResult<Self> {
        Ok(MessageRow {
            id: msg.id.clone(),
            role: role_str(msg.role).to_string(),
            content: msg.content.clone(),
            parts: msg
                .parts
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            author: msg.author.as_ref().map(serde_json::to_string).transpose()?,
            channel_type: msg.channel_type.clone(),
            channel_id: msg.channel_id.clone(),
            format: msg.format.map(|f| match f {
                MessageFormat::V1 => "v1".to_string(),
                MessageFormat::V2 => "v2".to_string(),
            }),
            created_at: format_ts(&msg.created_at),
        })
    }

    fn into_message(self) -> PlatformResult<Message> {
        let parts: Option<Vec<ContentPart>> = self
            .parts
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| PlatformError::Store(format!("bad parts json: {e}")))?;
        let author: Option<Author> = self
            .author
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| PlatformError::Store(format!("bad author json: {e}")))?;
        Ok(Message {
            id: self.id,
            role: parse_role(&self.role),
            content: self.content,
            parts,
            author,
            channel_type: self.channel_type,
            channel_id: self.channel_id,
            created_at: parse_ts(&self.created_at),
            format: self.format.as_deref().map(|f| match f {
                "v2" => MessageFormat::V2,
                _ => MessageFormat::V1,
            }),
        })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

fn parse_role(raw: &str) -> Role {
    match raw {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session_repo::NewSession;
    use crate::store::SessionStore;
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
    async fn insert_list_preserves_order_and_parts() {
        let (store, session_id) = store_with_session().await;
        let first = Message::new(Role::User, "hi").with_id("m1");
        let second = Message::new(Role::Assistant, "Hello")
            .with_id("m2")
            .with_parts(vec![ContentPart::text("Hello")]);
        store.messages.insert(&session_id, &first).await.unwrap();
        store.messages.insert(&session_id, &second).await.unwrap();

        let rows = store.messages.list(&session_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "m1");
        assert_eq!(rows[1].id, "m2");
        assert_eq!(rows[1].effective_format(), MessageFormat::V2);
        assert_eq!(rows[1].text(), "Hello");
    }

    #[tokio::test]
    async fn update_persists_new_content() {
        let (store, session_id) = store_with_session().await;
        let mut msg = Message::new(Role::Assistant, "draft").with_id("m1");
        store.messages.insert(&session_id, &msg).await.unwrap();

        msg.content = "final".into();
        store.messages.update(&session_id, &msg).await.unwrap();

        let rows = store.messages.list(&session_id).await.unwrap();
        assert_eq!(rows[0].content, "final");
    }

    #[tokio::test]
    async fn remove_deletes_only_named_ids() {
        let (store, session_id) = store_with_session().await;
        for id in ["a", "b", "c"] {
            store
                .messages
                .insert(&session_id, &Message::new(Role::User, id).with_id(id))
                .await
                .unwrap();
        }
        store
            .messages
            .remove(&session_id, &["b".to_string()])
            .await
            .unwrap();
        let ids: Vec<String> = store
            .messages
            .list(&session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn list_tail_caps_from_the_front() {
        let (store, session_id) = store_with_session().await;
        for i in 0..5 {
            store
                .messages
                .insert(
                    &session_id,
                    &Message::new(Role::User, format!("{i}")).with_id(format!("m{i}")),
                )
                .await
                .unwrap();
        }
        let tail = store.messages.list_tail(&session_id, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, "m3");
        assert_eq!(tail[1].id, "m4");
    }
}
