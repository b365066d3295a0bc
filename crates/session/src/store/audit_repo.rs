//! Session audit log rows. The holder keeps a bounded in-memory copy
//! reseeded from here on restart.

use super::{format_ts, parse_ts, Db};
use berth_core::error::PlatformResult;
use berth_core::protocol::AuditEntry;
use rusqlite::params;

#[derive(Clone)]
pub struct AuditRepo {
    db: Db,
}

impl AuditRepo {
    pub fn new(db: Db) -> Self {
        AuditRepo { db }
    }

    pub async fn append(&self, session_id: &str, entry: &AuditEntry) -> PlatformResult<()> {
        let session = session_id.to_string();
        let at = format_ts(&entry.at);
        let kind = entry.kind.clone();
        let detail = entry.detail.clone();
        let actor = entry.actor.clone();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO session_audit_log (session_id, at, kind, detail, actor)
                     VALUES (?, ?, ?, ?, ?)",
                    params![session, at, kind, detail, actor],
                )?;
                Ok(())
            })
            .await
    }

    /// Most recent entries, oldest first.
    pub async fn recent(&self, session_id: &str, limit: usize) -> PlatformResult<Vec<AuditEntry>> {
        let session = session_id.to_string();
        let mut entries: Vec<AuditEntry> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT at, kind, detail, actor FROM session_audit_log
                     WHERE session_id = ? ORDER BY rowid DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![session, limit as i64], |row| {
                    let at: String = row.get(0)?;
                    Ok(AuditEntry {
                        at: parse_ts(&at),
                        kind: row.get(1)?,
                        detail: row.get(2)?,
                        actor: row.get(3)?,
                    })
                })?;
                rows.collect()
            })
            .await?;
        entries.reverse();
        Ok(entries)
    }
}
