//! Schema initialization for the session side of the store.
//!
//! Workflow tables live in the dispatch crate and share this database;
//! the stale-execution sweep joins `workflow_executions` against
//! `sessions` directly.

use rusqlite::Connection;

pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            workspace TEXT NOT NULL,
            status TEXT NOT NULL,
            purpose TEXT NOT NULL,
            parent_id TEXT,
            persona_id TEXT,
            gateway_url TEXT,
            sandbox_id TEXT,
            runner_token_hash TEXT,
            created_at TEXT NOT NULL,
            last_active_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_purpose
            ON sessions(owner_id, purpose) WHERE purpose != 'interactive';

        CREATE TABLE IF NOT EXISTS messages (
            rowid INTEGER PRIMARY KEY,
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            parts TEXT,
            author TEXT,
            channel_type TEXT,
            channel_id TEXT,
            format TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(session_id, id),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

        CREATE TABLE IF NOT EXISTS channel_bindings (
            scope_key TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            queue_mode TEXT NOT NULL DEFAULT 'followup',
            collect_debounce_ms INTEGER NOT NULL DEFAULT 2000,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_bindings_session ON channel_bindings(session_id);

        CREATE TABLE IF NOT EXISTS user_identity_links (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            external_id TEXT NOT NULL,
            external_name TEXT,
            team_id TEXT,
            PRIMARY KEY (provider, external_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_identity_lookup
            ON user_identity_links(provider, external_id);

        CREATE TABLE IF NOT EXISTS session_audit_log (
            rowid INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            at TEXT NOT NULL,
            kind TEXT NOT NULL,
            detail TEXT,
            actor TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_audit_session ON session_audit_log(session_id);

        CREATE TABLE IF NOT EXISTS session_prompt_queue (
            rowid INTEGER PRIMARY KEY,
            session_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_prompt_queue_session
            ON session_prompt_queue(session_id);

        CREATE TABLE IF NOT EXISTS session_git_state (
            session_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS session_files_changed (
            session_id TEXT PRIMARY KEY,
            files TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS session_memory (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );

        CREATE TABLE IF NOT EXISTS session_mailbox (
            rowid INTEGER PRIMARY KEY,
            to_session TEXT NOT NULL,
            from_session TEXT NOT NULL,
            body TEXT NOT NULL,
            read INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mailbox_to
            ON session_mailbox(to_session) WHERE read = 0;

        CREATE TABLE IF NOT EXISTS task_board (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            payload TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_task_board_user ON task_board(user_id);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_twice() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();
    }
}
