//! Trigger validation.

use crate::model::{ScheduleTarget, TriggerConfig, TriggerDraft, TriggerType};
use crate::variables;
use berth_core::error::{PlatformError, PlatformResult};
use std::str::FromStr;

/// Orchestrator prompts are bounded so a bad client cannot stuff the
/// orchestrator session.
pub const MAX_SCHEDULE_PROMPT_CHARS: usize = 100_000;

/// Validate a draft and produce its typed config.
pub fn validate_draft(draft: &TriggerDraft) -> PlatformResult<TriggerConfig> {
    if draft.name.trim().is_empty() {
        return Err(PlatformError::validation("trigger name is required"));
    }

    if let Some(mapping) = &draft.variable_mapping {
        for (name, path) in mapping {
            if !variables::is_valid_path(path) {
                return Err(PlatformError::validation(format!(
                    "variable '{name}' has an invalid path: {path}"
                )));
            }
        }
    }

    let config: TriggerConfig = serde_json::from_value(draft.config.clone())
        .map_err(|e| PlatformError::validation(format!("bad trigger config: {e}")))?;

    match (&draft.trigger_type, &config) {
        (TriggerType::Webhook, TriggerConfig::Webhook { path, method, .. }) => {
            if path.trim().is_empty() {
                return Err(PlatformError::validation("webhook path is required"));
            }
            if method != "GET" && method != "POST" {
                return Err(PlatformError::validation(format!(
                    "webhook method must be GET or POST, got {method}"
                )));
            }
            if draft.workflow_id.is_none() {
                return Err(PlatformError::validation(
                    "webhook triggers require a workflow",
                ));
            }
        }
        (TriggerType::Schedule, TriggerConfig::Schedule {
            cron,
            target,
            prompt,
            ..
        }) => {
            validate_cron(cron)?;
            match target {
                ScheduleTarget::Orchestrator => {
                    let prompt = prompt.as_deref().unwrap_or("").trim();
                    if prompt.is_empty() {
                        return Err(PlatformError::validation(
                            "orchestrator schedules require a prompt",
                        ));
                    }
                    if prompt.len() > MAX_SCHEDULE_PROMPT_CHARS {
                        return Err(PlatformError::validation(format!(
                            "schedule prompt exceeds {MAX_SCHEDULE_PROMPT_CHARS} characters"
                        )));
                    }
                    // workflow_id may be absent for orchestrator targets.
                }
                ScheduleTarget::Workflow => {
                    if draft.workflow_id.is_none() {
                        return Err(PlatformError::validation(
                            "workflow schedules require a workflow",
                        ));
                    }
                }
            }
        }
        (TriggerType::Manual, TriggerConfig::Manual {}) => {
            if draft.workflow_id.is_none() {
                return Err(PlatformError::validation(
                    "manual triggers require a workflow",
                ));
            }
        }
        (trigger_type, _) => {
            return Err(PlatformError::validation(format!(
                "config does not match trigger type {}",
                trigger_type.as_str()
            )));
        }
    }

    Ok(config)
}

/// Validate a cron expression. Accepts the standard 5-field form; the
/// parser wants a seconds field, so one is prepended.
pub fn validate_cron(expr: &str) -> PlatformResult<()> {
    cron::Schedule::from_str(&normalize_cron(expr))
        .map(|_| ())
        .map_err(|e| PlatformError::validation(format!("invalid cron '{expr}': {e}")))
}

/// Normalize a 5-field cron to the 6-field form the parser expects.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}
