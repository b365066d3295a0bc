//! Platform configuration, loaded from TOML with per-field defaults.

use crate::error::{PlatformError, PlatformResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration shared by the service and the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// SQLite database path.
    pub db_path: String,
    /// Concurrency admission limits for workflow executions.
    pub limits: ExecutionLimits,
    /// Prompt-queue behaviour.
    pub queue: QueueConfig,
    /// Pending-question sweep interval, seconds.
    pub question_sweep_secs: u64,
    /// Approval/stale reconciler interval, seconds.
    pub reconcile_interval_secs: u64,
    /// Default approval-gate TTL when a workflow does not configure one,
    /// seconds.
    pub approval_ttl_secs: u64,
    /// Bounded in-memory audit log per session.
    pub audit_log_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Max executions in pending/running/waiting_approval per user.
    pub per_user: u32,
    /// Same count, platform-wide.
    pub global: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            per_user: 5,
            global: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default collect-mode debounce when a binding does not set one.
    pub collect_debounce_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            collect_debounce_ms: 2_000,
        }
    }
}

/// Collect debounce must stay within a sane window.
pub const MAX_COLLECT_DEBOUNCE_MS: u64 = 10_000;

pub fn clamp_collect_debounce(ms: u64) -> u64 {
    ms.min(MAX_COLLECT_DEBOUNCE_MS)
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            db_path: "berth.db".to_string(),
            limits: ExecutionLimits::default(),
            queue: QueueConfig::default(),
            question_sweep_secs: 60,
            reconcile_interval_secs: 60,
            approval_ttl_secs: 24 * 60 * 60,
            audit_log_capacity: 500,
        }
    }
}

impl PlatformConfig {
    pub fn load(path: &Path) -> PlatformResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlatformError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let mut config: PlatformConfig = toml::from_str(&raw)
            .map_err(|e| PlatformError::validation(format!("invalid config: {e}")))?;
        config.queue.collect_debounce_ms = clamp_collect_debounce(config.queue.collect_debounce_ms);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PlatformConfig::default();
        assert_eq!(config.limits.per_user, 5);
        assert_eq!(config.queue.collect_debounce_ms, 2_000);
        assert_eq!(config.audit_log_capacity, 500);
    }

    #[test]
    fn load_applies_partial_overrides_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/tmp/test.db"

[limits]
per_user = 2

[queue]
collect_debounce_ms = 99999
"#,
        )
        .unwrap();

        let config = PlatformConfig::load(&path).unwrap();
        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.limits.per_user, 2);
        assert_eq!(config.limits.global, 50);
        assert_eq!(config.queue.collect_debounce_ms, MAX_COLLECT_DEBOUNCE_MS);
    }

    #[test]
    fn load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.toml");
        std::fs::write(&path, "db_path = [").unwrap();
        assert!(PlatformConfig::load(&path).is_err());
    }
}
