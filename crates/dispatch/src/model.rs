//! Domain types for triggers, workflows and executions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

// ── Triggers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(TriggerType::Webhook),
            "schedule" => Ok(TriggerType::Schedule),
            "manual" => Ok(TriggerType::Manual),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleTarget {
    Workflow,
    Orchestrator,
}

/// Per-type trigger configuration, stored as JSON. Webhook paths live at
/// `$.path` so the store can enforce per-user uniqueness with a partial
/// index on `json_extract(config, '$.path')`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerConfig {
    Webhook {
        path: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        target: ScheduleTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    Manual {},
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub name: String,
    pub enabled: bool,
    pub trigger_type: TriggerType,
    pub config: TriggerConfig,
    /// Variable name → dotted path (`$.foo.bar[0]`) into the trigger body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_mapping: Option<HashMap<String, String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fields accepted when creating or updating a trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerDraft {
    pub name: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub config: Value,
    #[serde(default)]
    pub variable_mapping: Option<HashMap<String, String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ── Workflows ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// The declarative step graph, opaque to the dispatcher.
    pub data: Value,
    pub version: String,
    /// `sha256` of the serialized `data`.
    pub hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Workflow {
    pub fn allow_self_modification(&self) -> bool {
        self.data["constraints"]["allowSelfModification"]
            .as_bool()
            .unwrap_or(false)
    }

    /// Approval-gate TTL, seconds. Falls back to the platform default.
    pub fn approval_ttl_secs(&self, default: u64) -> u64 {
        self.data["constraints"]["approvalTimeoutSecs"]
            .as_u64()
            .unwrap_or(default)
    }
}

/// Canonical hash of a workflow snapshot.
pub fn workflow_hash(data: &Value) -> String {
    hex::encode(Sha256::digest(data.to_string().as_bytes()))
}

/// Bump the patch component of a `major.minor.patch` version. Malformed
/// input restarts at `{source}.1`.
pub fn bump_patch_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() == 3 {
        if let (Ok(major), Ok(minor), Ok(patch)) = (
            parts[0].parse::<u64>(),
            parts[1].parse::<u64>(),
            parts[2].parse::<u64>(),
        ) {
            return format!("{major}.{minor}.{}", patch + 1);
        }
    }
    format!("{version}.1")
}

// ── Executions ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::WaitingApproval => "waiting_approval",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal rows never change again; cancel/approve/resume after
    /// this are no-ops.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Statuses that count against admission limits.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "waiting_approval" => Ok(ExecutionStatus::WaitingApproval),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One durable run of a workflow. `(workflow_id, idempotency_key)` is
/// unique; `resume_token` is non-null iff the row is `waiting_approval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger_type: String,
    pub trigger_metadata: Value,
    pub variables: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<String>,
    pub workflow_hash: String,
    pub workflow_snapshot: Value,
    pub idempotency_key: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_state: Option<Value>,
    pub initiator_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_user_id: Option<String>,
    pub attempt_count: u32,
}

/// One step-trace row, keyed `(execution_id, step_id, attempt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub execution_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub started_at: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub completed_at: Option<OffsetDateTime>,
}

// ── Proposals & version history ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Applied => "applied",
            ProposalStatus::Expired => "expired",
        }
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "approved" => Ok(ProposalStatus::Approved),
            "rejected" => Ok(ProposalStatus::Rejected),
            "applied" => Ok(ProposalStatus::Applied),
            "expired" => Ok(ProposalStatus::Expired),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// Default proposal lifetime.
pub const PROPOSAL_TTL_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationProposal {
    pub id: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub user_id: String,
    /// Must equal the workflow's current hash at apply time.
    pub base_workflow_hash: String,
    pub proposed_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ProposalStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub applied_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub workflow_id: String,
    pub workflow_hash: String,
    pub version: String,
    pub data: Value,
    /// `sync | update | proposal_apply | rollback | system`.
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_config_round_trips_per_type() {
        let webhook: TriggerConfig = serde_json::from_value(json!({
            "path": "deploy",
            "method": "POST"
        }))
        .unwrap();
        assert!(matches!(webhook, TriggerConfig::Webhook { .. }));

        let schedule: TriggerConfig = serde_json::from_value(json!({
            "cron": "0 9 * * *",
            "target": "orchestrator",
            "prompt": "summarise"
        }))
        .unwrap();
        assert!(matches!(
            schedule,
            TriggerConfig::Schedule {
                target: ScheduleTarget::Orchestrator,
                ..
            }
        ));

        let manual: TriggerConfig = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(manual, TriggerConfig::Manual {}));
    }

    #[test]
    fn webhook_path_serializes_at_top_level() {
        let config = TriggerConfig::Webhook {
            path: "deploy".into(),
            method: "POST".into(),
            secret: None,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["path"], "deploy");
    }

    #[test]
    fn execution_status_terminality() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::WaitingApproval.is_terminal());
        assert!(ExecutionStatus::WaitingApproval.is_active());
    }

    #[test]
    fn hash_is_stable_per_snapshot() {
        let a = json!({"steps": [{"id": "s1"}]});
        let b = json!({"steps": [{"id": "s1"}]});
        assert_eq!(workflow_hash(&a), workflow_hash(&b));
        assert_ne!(workflow_hash(&a), workflow_hash(&json!({"steps": []})));
    }

    #[test]
    fn version_bump_rules() {
        assert_eq!(bump_patch_version("1.2.3"), "1.2.4");
        assert_eq!(bump_patch_version("0.0.0"), "0.0.1");
        assert_eq!(bump_patch_version("draft"), "draft.1");
        assert_eq!(bump_patch_version("1.2"), "1.2.1");
        assert_eq!(bump_patch_version("1.2.x"), "1.2.x.1");
    }

    #[test]
    fn constraints_read_from_workflow_data() {
        let wf = Workflow {
            id: "w".into(),
            user_id: "u".into(),
            name: "n".into(),
            data: json!({"constraints": {"allowSelfModification": true, "approvalTimeoutSecs": 120}}),
            version: "1.0.0".into(),
            hash: "h".into(),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert!(wf.allow_self_modification());
        assert_eq!(wf.approval_ttl_secs(3600), 120);
    }
}
