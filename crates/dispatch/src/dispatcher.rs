//! The trigger dispatcher: admission control, idempotency, and routing
//! to either the workflow executor or the user's orchestrator session.

use crate::model::{
    workflow_hash, ExecutionStatus, ScheduleTarget, Trigger, TriggerConfig, WorkflowExecution,
};
use crate::store::DispatchStore;
use crate::variables::resolve_mapping;
use async_trait::async_trait;
use berth_core::config::ExecutionLimits;
use berth_core::error::{PlatformError, PlatformResult};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// The dispatcher's seam toward the session layer.
#[async_trait]
pub trait SessionBridge: Send + Sync {
    /// Create a workflow-purpose session owned by the workflow's owner;
    /// returns its id.
    async fn create_workflow_session(
        &self,
        owner_id: &str,
        workflow_id: &str,
    ) -> PlatformResult<String>;

    /// Post a prompt into the user's orchestrator session (creating it
    /// if absent).
    async fn post_orchestrator_prompt(&self, user_id: &str, prompt: &str) -> PlatformResult<()>;

    /// Hand a pending execution to the workflow executor.
    async fn launch_execution(&self, execution: &WorkflowExecution) -> PlatformResult<()>;
}

/// What a dispatch call produced.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A new execution row, enqueued. HTTP 201.
    Created(WorkflowExecution),
    /// A prior request already created the row. HTTP 200, no new work.
    Deduplicated(WorkflowExecution),
    /// Orchestrator-target schedule: prompt queued. HTTP 202.
    Queued,
    /// The row exists but the executor enqueue failed; the caller must
    /// retry dispatch.
    RetryDispatch(WorkflowExecution),
}

pub struct Dispatcher {
    store: DispatchStore,
    bridge: Arc<dyn SessionBridge>,
    limits: ExecutionLimits,
}

impl Dispatcher {
    pub fn new(store: DispatchStore, bridge: Arc<dyn SessionBridge>, limits: ExecutionLimits) -> Self {
        Dispatcher {
            store,
            bridge,
            limits,
        }
    }

    pub fn store(&self) -> &DispatchStore {
        &self.store
    }

    /// Direct manual run of a workflow.
    pub async fn run_manual(
        &self,
        user_id: &str,
        workflow_id: &str,
        client_request_id: Option<String>,
        variables: Value,
    ) -> PlatformResult<DispatchOutcome> {
        let request_id = client_request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = format!("manual:{workflow_id}:{user_id}:{request_id}");
        self.dispatch_workflow(DispatchRequest {
            user_id,
            workflow_id,
            trigger: None,
            trigger_type: "manual",
            trigger_metadata: json!({ "clientRequestId": request_id }),
            variables,
            idempotency_key: key,
            initiator_type: "user",
            initiator_user_id: Some(user_id.to_string()),
        })
        .await
    }

    /// Manual run of a trigger (fires its workflow with its mapping).
    pub async fn run_manual_trigger(
        &self,
        user_id: &str,
        trigger_id: &str,
        client_request_id: Option<String>,
        body: Value,
    ) -> PlatformResult<DispatchOutcome> {
        let trigger = self.owned_trigger(user_id, trigger_id).await?;
        if !trigger.enabled {
            return Err(PlatformError::validation("trigger is disabled"));
        }
        let workflow_id = trigger
            .workflow_id
            .clone()
            .ok_or_else(|| PlatformError::validation("trigger has no workflow"))?;

        let request_id = client_request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = format!("manual-trigger:{trigger_id}:{user_id}:{request_id}");
        let variables = self.map_variables(&trigger, &body)?;
        self.dispatch_workflow(DispatchRequest {
            user_id,
            workflow_id: &workflow_id,
            trigger: Some(&trigger),
            trigger_type: "manual",
            trigger_metadata: json!({
                "triggerId": trigger.id,
                "clientRequestId": request_id,
            }),
            variables,
            idempotency_key: key,
            initiator_type: "user",
            initiator_user_id: Some(user_id.to_string()),
        })
        .await
    }

    /// An inbound webhook delivery for one of the user's webhook paths.
    pub async fn fire_webhook(
        &self,
        user_id: &str,
        path: &str,
        delivery_id: Option<&str>,
        body: Value,
    ) -> PlatformResult<DispatchOutcome> {
        let trigger = self
            .store
            .triggers
            .find_webhook(user_id, path)
            .await?
            .filter(|t| t.enabled)
            .ok_or_else(|| PlatformError::not_found("webhook", path))?;
        let workflow_id = trigger
            .workflow_id
            .clone()
            .ok_or_else(|| PlatformError::validation("webhook trigger has no workflow"))?;

        // Retried deliveries of the same payload must dedup even when
        // the source sends no delivery id.
        let delivery = match delivery_id {
            Some(id) => id.to_string(),
            None => hex::encode(&Sha256::digest(body.to_string().as_bytes())[..8]),
        };
        let key = format!("webhook:{}:{delivery}", trigger.id);
        let variables = self.map_variables(&trigger, &body)?;
        self.dispatch_workflow(DispatchRequest {
            user_id,
            workflow_id: &workflow_id,
            trigger: Some(&trigger),
            trigger_type: "webhook",
            trigger_metadata: json!({
                "triggerId": trigger.id,
                "deliveryId": delivery,
                "path": path,
            }),
            variables,
            idempotency_key: key,
            initiator_type: "webhook",
            initiator_user_id: None,
        })
        .await
    }

    /// A schedule trigger firing at `fire_time`.
    pub async fn fire_schedule(
        &self,
        trigger: &Trigger,
        fire_time: OffsetDateTime,
    ) -> PlatformResult<DispatchOutcome> {
        let TriggerConfig::Schedule {
            target, prompt, ..
        } = &trigger.config
        else {
            return Err(PlatformError::validation("not a schedule trigger"));
        };

        if *target == ScheduleTarget::Orchestrator {
            let prompt = prompt
                .as_deref()
                .ok_or_else(|| PlatformError::validation("orchestrator schedule has no prompt"))?;
            match self
                .bridge
                .post_orchestrator_prompt(&trigger.user_id, prompt)
                .await
            {
                Ok(()) => {
                    self.store.triggers.mark_ran(&trigger.id).await?;
                    return Ok(DispatchOutcome::Queued);
                }
                Err(e) => {
                    log::warn!("schedule {}: orchestrator dispatch failed: {e}", trigger.id);
                    return Err(PlatformError::Conflict(format!(
                        "orchestrator dispatch failed: {e}"
                    )));
                }
            }
        }

        let workflow_id = trigger
            .workflow_id
            .clone()
            .ok_or_else(|| PlatformError::validation("schedule trigger has no workflow"))?;
        // One execution per (trigger, fire minute).
        let minute = fire_time.unix_timestamp() / 60;
        let key = format!("schedule:{}:{minute}", trigger.id);
        self.dispatch_workflow(DispatchRequest {
            user_id: &trigger.user_id,
            workflow_id: &workflow_id,
            trigger: Some(trigger),
            trigger_type: "schedule",
            trigger_metadata: json!({
                "triggerId": trigger.id,
                "firedAt": minute * 60,
            }),
            variables: json!({}),
            idempotency_key: key,
            initiator_type: "schedule",
            initiator_user_id: None,
        })
        .await
    }

    // ── Core pipeline ────────────────────────────────────────────────────

    async fn dispatch_workflow(
        &self,
        req: DispatchRequest<'_>,
    ) -> PlatformResult<DispatchOutcome> {
        // Idempotency short-circuit, before admission: a retried request
        // must not be rejected for load it already caused.
        if let Some(existing) = self
            .store
            .executions
            .find_by_idempotency(req.workflow_id, &req.idempotency_key)
            .await?
        {
            return Ok(DispatchOutcome::Deduplicated(existing));
        }

        self.check_admission(req.user_id).await?;

        let workflow = self.store.workflows.require(req.workflow_id).await?;
        if workflow.user_id != req.user_id {
            return Err(PlatformError::not_found("workflow", req.workflow_id));
        }

        let session_id = self
            .bridge
            .create_workflow_session(&workflow.user_id, &workflow.id)
            .await?;

        let execution = WorkflowExecution {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow.id.clone(),
            user_id: workflow.user_id.clone(),
            trigger_id: req.trigger.map(|t| t.id.clone()),
            status: ExecutionStatus::Pending,
            trigger_type: req.trigger_type.to_string(),
            trigger_metadata: req.trigger_metadata,
            variables: req.variables,
            outputs: None,
            error: None,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            workflow_version: Some(workflow.version.clone()),
            workflow_hash: workflow_hash(&workflow.data),
            workflow_snapshot: workflow.data.clone(),
            idempotency_key: req.idempotency_key.clone(),
            session_id,
            resume_token: None,
            runtime_state: None,
            initiator_type: req.initiator_type.to_string(),
            initiator_user_id: req.initiator_user_id,
            attempt_count: 1,
        };

        match self.store.executions.insert(&execution).await {
            Ok(()) => {}
            Err(PlatformError::Conflict(_)) => {
                // Lost a race with a concurrent identical dispatch.
                if let Some(existing) = self
                    .store
                    .executions
                    .find_by_idempotency(req.workflow_id, &req.idempotency_key)
                    .await?
                {
                    return Ok(DispatchOutcome::Deduplicated(existing));
                }
                return Err(PlatformError::Conflict(
                    "concurrent dispatch for idempotency key".into(),
                ));
            }
            Err(e) => return Err(e),
        }

        match self.bridge.launch_execution(&execution).await {
            Ok(()) => {
                if let Some(trigger) = req.trigger {
                    self.store.triggers.mark_ran(&trigger.id).await?;
                }
                Ok(DispatchOutcome::Created(execution))
            }
            Err(e) => {
                log::warn!(
                    "execution {}: executor enqueue failed, dispatch must be retried: {e}",
                    execution.id
                );
                Ok(DispatchOutcome::RetryDispatch(execution))
            }
        }
    }

    async fn check_admission(&self, user_id: &str) -> PlatformResult<()> {
        let (active_user, active_global) = self.store.executions.active_counts(user_id).await?;
        if active_user >= self.limits.per_user || active_global >= self.limits.global {
            return Err(PlatformError::Concurrency {
                active_user,
                active_global,
                limit: self.limits.per_user,
            });
        }
        Ok(())
    }

    async fn owned_trigger(&self, user_id: &str, trigger_id: &str) -> PlatformResult<Trigger> {
        let trigger = self.store.triggers.require(trigger_id).await?;
        if trigger.user_id != user_id {
            return Err(PlatformError::not_found("trigger", trigger_id));
        }
        Ok(trigger)
    }

    fn map_variables(&self, trigger: &Trigger, body: &Value) -> PlatformResult<Value> {
        match &trigger.variable_mapping {
            Some(mapping) => resolve_mapping(mapping, body),
            None => Ok(json!({})),
        }
    }
}

struct DispatchRequest<'a> {
    user_id: &'a str,
    workflow_id: &'a str,
    trigger: Option<&'a Trigger>,
    trigger_type: &'a str,
    trigger_metadata: Value,
    variables: Value,
    idempotency_key: String,
    initiator_type: &'a str,
    initiator_user_id: Option<String>,
}
