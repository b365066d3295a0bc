//! Channel bindings: scope key → session plus queue policy.

use super::{format_ts, Db};
use berth_core::config::clamp_collect_debounce;
use berth_core::error::PlatformResult;
use berth_core::protocol::QueueMode;
use berth_core::scope::ScopeKey;
use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBinding {
    pub scope_key: ScopeKey,
    pub session_id: String,
    pub queue_mode: QueueMode,
    pub collect_debounce_ms: u64,
}

#[derive(Clone)]
pub struct BindingRepo {
    db: Db,
}

impl BindingRepo {
    pub fn new(db: Db) -> Self {
        BindingRepo { db }
    }

    pub async fn put(&self, binding: ChannelBinding) -> PlatformResult<()> {
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO channel_bindings
                         (scope_key, session_id, queue_mode, collect_debounce_ms, created_at)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(scope_key) DO UPDATE SET
                         session_id = excluded.session_id,
                         queue_mode = excluded.queue_mode,
                         collect_debounce_ms = excluded.collect_debounce_ms",
                    params![
                        binding.scope_key.as_str(),
                        binding.session_id,
                        queue_mode_str(binding.queue_mode),
                        clamp_collect_debounce(binding.collect_debounce_ms) as i64,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, scope_key: &ScopeKey) -> PlatformResult<Option<ChannelBinding>> {
        let key = scope_key.as_str().to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT scope_key, session_id, queue_mode, collect_debounce_ms
                     FROM channel_bindings WHERE scope_key = ?",
                    params![key],
                    row_to_binding,
                )
                .optional()
            })
            .await
    }

    pub async fn remove(&self, scope_key: &ScopeKey) -> PlatformResult<bool> {
        let key = scope_key.as_str().to_string();
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "DELETE FROM channel_bindings WHERE scope_key = ?",
                    params![key],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn list_for_session(&self, session_id: &str) -> PlatformResult<Vec<ChannelBinding>> {
        let session = session_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT scope_key, session_id, queue_mode, collect_debounce_ms
                     FROM channel_bindings WHERE session_id = ?",
                )?;
                let rows = stmt.query_map(params![session], row_to_binding)?;
                rows.collect()
            })
            .await
    }
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> Result<ChannelBinding, rusqlite::Error> {
    let raw_key: String = row.get(0)?;
    let mode: String = row.get(2)?;
    let debounce: i64 = row.get(3)?;
    Ok(ChannelBinding {
        scope_key: ScopeKey::parse(&raw_key)
            .map(|(user, parts)| ScopeKey::from_parts(&user, &parts))
            .unwrap_or_else(|_| ScopeKey::compose("unknown", "web", &raw_key)),
        session_id: row.get(1)?,
        queue_mode: parse_queue_mode(&mode),
        collect_debounce_ms: debounce.max(0) as u64,
    })
}

fn queue_mode_str(mode: QueueMode) -> &'static str {
    match mode {
        QueueMode::Followup => "followup",
        QueueMode::Collect => "collect",
        QueueMode::Steer => "steer",
    }
}

fn parse_queue_mode(raw: &str) -> QueueMode {
    match raw {
        "collect" => QueueMode::Collect,
        "steer" => QueueMode::Steer,
        _ => QueueMode::Followup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::session_repo::NewSession;
    use crate::store::SessionStore;
    use berth_core::status::SessionPurpose;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
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

        let key = ScopeKey::compose("u1", "telegram", "999");
        let binding = ChannelBinding {
            scope_key: key.clone(),
            session_id: session.id.clone(),
            queue_mode: QueueMode::Collect,
            collect_debounce_ms: 1500,
        };
        store.bindings.put(binding.clone()).await.unwrap();

        let loaded = store.bindings.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded, binding);

        assert!(store.bindings.remove(&key).await.unwrap());
        assert!(store.bindings.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_clamps_debounce_and_rebinds() {
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

        let key = ScopeKey::compose("u1", "slack", "T:C:1");
        store
            .bindings
            .put(ChannelBinding {
                scope_key: key.clone(),
                session_id: session.id.clone(),
                queue_mode: QueueMode::Followup,
                collect_debounce_ms: 60_000,
            })
            .await
            .unwrap();

        let loaded = store.bindings.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded.collect_debounce_ms, 10_000);
    }
}
