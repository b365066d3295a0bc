//! External identity links: who a Telegram/Slack/GitHub sender is on the
//! platform.

use super::Db;
use berth_core::error::PlatformResult;
use berth_core::scope::UserIdentityLink;
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct IdentityRepo {
    db: Db,
}

impl IdentityRepo {
    pub fn new(db: Db) -> Self {
        IdentityRepo { db }
    }

    pub async fn link(&self, link: UserIdentityLink) -> PlatformResult<()> {
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO user_identity_links
                         (user_id, provider, external_id, external_name, team_id)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(provider, external_id, user_id) DO UPDATE SET
                         external_name = excluded.external_name,
                         team_id = excluded.team_id",
                    params![
                        link.user_id,
                        link.provider,
                        link.external_id,
                        link.external_name,
                        link.team_id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Resolve an external identity to a platform user. When several
    /// users claim the same external identity the earliest link wins.
    pub async fn resolve(
        &self,
        provider: &str,
        external_id: &str,
    ) -> PlatformResult<Option<String>> {
        let provider = provider.to_string();
        let external = external_id.to_string();
        self.db
            .run(move |conn| {
                conn.query_row(
                    "SELECT user_id FROM user_identity_links
                     WHERE provider = ? AND external_id = ?
                     ORDER BY rowid ASC LIMIT 1",
                    params![provider, external],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn links_for_user(&self, user_id: &str) -> PlatformResult<Vec<UserIdentityLink>> {
        let user = user_id.to_string();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, provider, external_id, external_name, team_id
                     FROM user_identity_links WHERE user_id = ?",
                )?;
                let rows = stmt.query_map(params![user], |row| {
                    Ok(UserIdentityLink {
                        user_id: row.get(0)?,
                        provider: row.get(1)?,
                        external_id: row.get(2)?,
                        external_name: row.get(3)?,
                        team_id: row.get(4)?,
                    })
                })?;
                rows.collect()
            })
            .await
    }
}
