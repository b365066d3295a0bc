//! Trigger rows. Webhook path uniqueness is the store's job: a partial
//! unique index over `json_extract(config, '$.path')`.

use super::{format_ts, parse_ts, parse_ts_opt, store_err};
use crate::model::{Trigger, TriggerConfig, TriggerType};
use berth_core::error::{PlatformError, PlatformResult};
use berth_session::store::Db;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct TriggerRepo {
    db: Db,
}

impl TriggerRepo {
    pub fn new(db: Db) -> Self {
        TriggerRepo { db }
    }

    pub async fn insert(
        &self,
        user_id: &str,
        workflow_id: Option<String>,
        name: &str,
        enabled: bool,
        trigger_type: TriggerType,
        config: &TriggerConfig,
        variable_mapping: Option<&HashMap<String, String>>,
    ) -> PlatformResult<Trigger> {
        let trigger = Trigger {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            workflow_id,
            name: name.to_string(),
            enabled,
            trigger_type,
            config: config.clone(),
            variable_mapping: variable_mapping.cloned(),
            last_run_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let row = trigger.clone();
        let config_json = serde_json::to_string(&row.config)?;
        let mapping_json = row
            .variable_mapping
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = self
            .db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO triggers
                         (id, user_id, workflow_id, name, enabled, type, config,
                          variable_mapping, last_run_at, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
                    params![
                        row.id,
                        row.user_id,
                        row.workflow_id,
                        row.name,
                        row.enabled as i64,
                        row.trigger_type.as_str(),
                        config_json,
                        mapping_json,
                        format_ts(&row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(trigger),
            Err(PlatformError::Store(msg)) if msg.contains("UNIQUE") => {
                Err(PlatformError::Conflict(
                    "a webhook trigger with this path already exists".into(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, trigger_id: &str) -> PlatformResult<Option<Trigger>> {
        let id = trigger_id.to_string();
        let row: Option<TriggerRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, workflow_id, name, enabled, type, config,
                            variable_mapping, last_run_at, created_at
                     FROM triggers WHERE id = ?",
                    params![id],
                    TriggerRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(TriggerRow::into_trigger).transpose()
    }

    pub async fn require(&self, trigger_id: &str) -> PlatformResult<Trigger> {
        self.get(trigger_id)
            .await?
            .ok_or_else(|| PlatformError::not_found("trigger", trigger_id))
    }

    /// Resolve an inbound webhook by its configured path.
    pub async fn find_webhook(
        &self,
        user_id: &str,
        path: &str,
    ) -> PlatformResult<Option<Trigger>> {
        let user = user_id.to_string();
        let path = path.to_string();
        let row: Option<TriggerRow> = self
            .db
            .run(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, workflow_id, name, enabled, type, config,
                            variable_mapping, last_run_at, created_at
                     FROM triggers
                     WHERE user_id = ? AND type = 'webhook'
                       AND json_extract(config, '$.path') = ?",
                    params![user, path],
                    TriggerRow::from_row,
                )
                .optional()
            })
            .await?;
        row.map(TriggerRow::into_trigger).transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> PlatformResult<Vec<Trigger>> {
        let user = user_id.to_string();
        let rows: Vec<TriggerRow> = self
            .db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, workflow_id, name, enabled, type, config,
                            variable_mapping, last_run_at, created_at
                     FROM triggers WHERE user_id = ? ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![user], TriggerRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(TriggerRow::into_trigger).collect()
    }

    /// Enabled schedule triggers across all users (scheduler sweep).
    pub async fn list_enabled_schedules(&self) -> PlatformResult<Vec<Trigger>> {
        let rows: Vec<TriggerRow> = self
            .db
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, workflow_id, name, enabled, type, config,
                            variable_mapping, last_run_at, created_at
                     FROM triggers WHERE type = 'schedule' AND enabled = 1",
                )?;
                let rows = stmt.query_map([], TriggerRow::from_row)?;
                rows.collect()
            })
            .await?;
        rows.into_iter().map(TriggerRow::into_trigger).collect()
    }

    pub async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> PlatformResult<bool> {
        let id = trigger_id.to_string();
        self.db
            .run(move |conn| {
                let n = conn.execute(
                    "UPDATE triggers SET enabled = ? WHERE id = ?",
                    params![enabled as i64, id],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Stamp `last_run_at`; only called after a dispatch succeeded.
    pub async fn mark_ran(&self, trigger_id: &str) -> PlatformResult<()> {
        let id = trigger_id.to_string();
        let now = format_ts(&OffsetDateTime::now_utc());
        self.db
            .run(move |conn| {
                conn.execute(
                    "UPDATE triggers SET last_run_at = ? WHERE id = ?",
                    params![now, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, trigger_id: &str) -> PlatformResult<bool> {
        let id = trigger_id.to_string();
        self.db
            .run(move |conn| {
                let n = conn.execute("DELETE FROM triggers WHERE id = ?", params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

struct TriggerRow {
    id: String,
    user_id: String,
    workflow_id: Option<String>,
    name: String,
    enabled: i64,
    trigger_type: String,
    config: String,
    variable_mapping: Option<String>,
    last_run_at: Option<String>,
    created_at: String,
}

impl TriggerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(TriggerRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            workflow_id: row.get(2)?,
            name: row.get(3)?,
            enabled: row.get(4)?,
            trigger_type: row.get(5)?,
            config: row.get(6)?,
            variable_mapping: row.get(7)?,
            last_run_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_trigger(self) -> PlatformResult<Trigger> {
        Ok(Trigger {
            id: self.id,
            user_id: self.user_id,
            workflow_id: self.workflow_id,
            name: self.name,
            enabled: self.enabled != 0,
            trigger_type: self.trigger_type.parse().map_err(store_err)?,
            config: serde_json::from_str(&self.config).map_err(store_err)?,
            variable_mapping: self
                .variable_mapping
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(store_err)?,
            last_run_at: parse_ts_opt(self.last_run_at),
            created_at: parse_ts(&self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::stores;

    fn webhook_config(path: &str) -> TriggerConfig {
        TriggerConfig::Webhook {
            path: path.into(),
            method: "POST".into(),
            secret: None,
        }
    }

    #[tokio::test]
    async fn webhook_path_unique_per_user() {
        let (_sessions, dispatch) = stores().await;
        dispatch
            .triggers
            .insert(
                "u1",
                Some("w1".into()),
                "first",
                true,
                TriggerType::Webhook,
                &webhook_config("deploy"),
                None,
            )
            .await
            .unwrap();

        // Same path, same user: conflict.
        let err = dispatch
            .triggers
            .insert(
                "u1",
                Some("w2".into()),
                "dup",
                true,
                TriggerType::Webhook,
                &webhook_config("deploy"),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 409);

        // Same path, different user: fine.
        dispatch
            .triggers
            .insert(
                "u2",
                Some("w1".into()),
                "other-user",
                true,
                TriggerType::Webhook,
                &webhook_config("deploy"),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn find_webhook_resolves_by_path() {
        let (_sessions, dispatch) = stores().await;
        let created = dispatch
            .triggers
            .insert(
                "u1",
                Some("w1".into()),
                "t",
                true,
                TriggerType::Webhook,
                &webhook_config("deploy"),
                None,
            )
            .await
            .unwrap();

        let found = dispatch
            .triggers
            .find_webhook("u1", "deploy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert!(dispatch
            .triggers
            .find_webhook("u1", "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mark_ran_sets_last_run_at() {
        let (_sessions, dispatch) = stores().await;
        let trigger = dispatch
            .triggers
            .insert(
                "u1",
                Some("w1".into()),
                "t",
                true,
                TriggerType::Manual,
                &TriggerConfig::Manual {},
                None,
            )
            .await
            .unwrap();
        assert!(trigger.last_run_at.is_none());

        dispatch.triggers.mark_ran(&trigger.id).await.unwrap();
        let reloaded = dispatch.triggers.require(&trigger.id).await.unwrap();
        assert!(reloaded.last_run_at.is_some());
    }

    #[tokio::test]
    async fn enable_disable_and_delete() {
        let (_sessions, dispatch) = stores().await;
        let trigger = dispatch
            .triggers
            .insert(
                "u1",
                Some("w1".into()),
                "t",
                true,
                TriggerType::Manual,
                &TriggerConfig::Manual {},
                None,
            )
            .await
            .unwrap();

        assert!(dispatch.triggers.set_enabled(&trigger.id, false).await.unwrap());
        assert!(!dispatch.triggers.require(&trigger.id).await.unwrap().enabled);
        assert!(dispatch.triggers.delete(&trigger.id).await.unwrap());
        assert!(dispatch.triggers.get(&trigger.id).await.unwrap().is_none());
    }
}
