//! The workflow/trigger/execution API exposed to runners.
//!
//! Runners reach this through the holder (`workflow-api` operations on
//! the runner socket); the HTTP trigger surface in the service crate
//! talks to the dispatcher and runtime directly. Actions are dotted
//! verbs; payloads and results are JSON objects.

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::model::{ExecutionStep, TriggerDraft};
use crate::proposals::ProposalService;
use crate::runtime::ExecutionRuntime;
use crate::validate;
use async_trait::async_trait;
use berth_core::error::{PlatformError, PlatformResult};
use berth_session::services::WorkflowApi;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct DispatchWorkflowApi {
    dispatcher: Arc<Dispatcher>,
    runtime: ExecutionRuntime,
    proposals: ProposalService,
}

impl DispatchWorkflowApi {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        runtime: ExecutionRuntime,
        proposals: ProposalService,
    ) -> Self {
        DispatchWorkflowApi {
            dispatcher,
            runtime,
            proposals,
        }
    }

    fn str_field<'a>(payload: &'a Value, field: &str) -> PlatformResult<&'a str> {
        payload[field]
            .as_str()
            .ok_or_else(|| PlatformError::validation(format!("missing field: {field}")))
    }
}

#[async_trait]
impl WorkflowApi for DispatchWorkflowApi {
    async fn call(&self, user_id: &str, action: &str, payload: Value) -> PlatformResult<Value> {
        let store = self.dispatcher.store();
        match action {
            // ── Workflows ────────────────────────────────────────────
            "workflow.list" => {
                let workflows = store.workflows.list_for_user(user_id).await?;
                Ok(json!({ "workflows": workflows }))
            }
            "workflow.get" => {
                let id = Self::str_field(&payload, "id")?;
                let workflow = store.workflows.require(id).await?;
                if workflow.user_id != user_id {
                    return Err(PlatformError::not_found("workflow", id));
                }
                Ok(serde_json::to_value(workflow)?)
            }
            "workflow.create" => {
                let name = Self::str_field(&payload, "name")?;
                let data = payload
                    .get("data")
                    .cloned()
                    .ok_or_else(|| PlatformError::validation("missing field: data"))?;
                let workflow = store.workflows.create(user_id, name, data).await?;
                Ok(serde_json::to_value(workflow)?)
            }
            "workflow.history" => {
                let id = Self::str_field(&payload, "id")?;
                let entries = store.workflows.history_for_workflow(id).await?;
                Ok(json!({ "history": entries }))
            }
            "workflow.rollback" => {
                let id = Self::str_field(&payload, "id")?;
                let hash = Self::str_field(&payload, "hash")?;
                let workflow = self.proposals.rollback(user_id, id, hash).await?;
                Ok(serde_json::to_value(workflow)?)
            }

            // ── Triggers ─────────────────────────────────────────────
            "trigger.list" => {
                let triggers = store.triggers.list_for_user(user_id).await?;
                Ok(json!({ "triggers": triggers }))
            }
            "trigger.create" => {
                let draft: TriggerDraft = serde_json::from_value(payload)
                    .map_err(|e| PlatformError::validation(format!("bad trigger: {e}")))?;
                let config = validate::validate_draft(&draft)?;
                let trigger = store
                    .triggers
                    .insert(
                        user_id,
                        draft.workflow_id.clone(),
                        &draft.name,
                        draft.enabled,
                        draft.trigger_type,
                        &config,
                        draft.variable_mapping.as_ref(),
                    )
                    .await?;
                Ok(serde_json::to_value(trigger)?)
            }
            "trigger.delete" => {
                let id = Self::str_field(&payload, "id")?;
                let trigger = store.triggers.require(id).await?;
                if trigger.user_id != user_id {
                    return Err(PlatformError::not_found("trigger", id));
                }
                store.triggers.delete(id).await?;
                Ok(json!({ "ok": true }))
            }
            "trigger.set-enabled" => {
                let id = Self::str_field(&payload, "id")?;
                let enabled = payload["enabled"]
                    .as_bool()
                    .ok_or_else(|| PlatformError::validation("missing field: enabled"))?;
                let trigger = store.triggers.require(id).await?;
                if trigger.user_id != user_id {
                    return Err(PlatformError::not_found("trigger", id));
                }
                store.triggers.set_enabled(id, enabled).await?;
                Ok(json!({ "ok": true }))
            }

            // ── Executions ───────────────────────────────────────────
            "execution.list" => {
                let executions = store.executions.list_for_user(user_id, 100).await?;
                Ok(json!({ "executions": executions }))
            }
            "execution.get" => {
                let id = Self::str_field(&payload, "id")?;
                let execution = store.executions.require(id).await?;
                if execution.user_id != user_id {
                    return Err(PlatformError::not_found("execution", id));
                }
                let steps = store.executions.steps_for_execution(id).await?;
                Ok(json!({ "execution": execution, "steps": steps }))
            }
            "execution.run" => {
                let workflow_id = Self::str_field(&payload, "workflowId")?;
                let client_request_id = payload["clientRequestId"].as_str().map(String::from);
                let variables = payload.get("variables").cloned().unwrap_or(json!({}));
                let outcome = self
                    .dispatcher
                    .run_manual(user_id, workflow_id, client_request_id, variables)
                    .await?;
                Ok(outcome_json(outcome))
            }
            "execution.start" => {
                let id = Self::str_field(&payload, "id")?;
                let execution = self.runtime.start(id).await?;
                Ok(serde_json::to_value(execution)?)
            }
            "execution.step" => {
                let step: ExecutionStep = serde_json::from_value(payload)
                    .map_err(|e| PlatformError::validation(format!("bad step: {e}")))?;
                self.runtime.record_step(step).await?;
                Ok(json!({ "ok": true }))
            }
            "execution.suspend" => {
                let id = Self::str_field(&payload, "id")?;
                let token = self
                    .runtime
                    .suspend_for_approval(id, payload.get("runtimeState"))
                    .await?;
                Ok(json!({ "resumeToken": token }))
            }
            "execution.complete" => {
                let id = Self::str_field(&payload, "id")?;
                self.runtime.complete(id, payload.get("outputs")).await?;
                Ok(json!({ "ok": true }))
            }
            "execution.fail" => {
                let id = Self::str_field(&payload, "id")?;
                let error = Self::str_field(&payload, "error")?;
                self.runtime.fail(id, error).await?;
                Ok(json!({ "ok": true }))
            }
            "execution.cancel" => {
                let id = Self::str_field(&payload, "id")?;
                let execution = self.runtime.cancel(id).await?;
                Ok(serde_json::to_value(execution)?)
            }

            // ── Proposals ────────────────────────────────────────────
            "proposal.create" => {
                let workflow_id = Self::str_field(&payload, "workflowId")?;
                let data = payload
                    .get("data")
                    .cloned()
                    .ok_or_else(|| PlatformError::validation("missing field: data"))?;
                let proposal = self
                    .proposals
                    .propose(
                        user_id,
                        workflow_id,
                        payload["executionId"].as_str().map(String::from),
                        data,
                        payload["description"].as_str().map(String::from),
                    )
                    .await?;
                Ok(serde_json::to_value(proposal)?)
            }
            "proposal.approve" => {
                let id = Self::str_field(&payload, "id")?;
                self.proposals.approve(user_id, id).await?;
                Ok(json!({ "ok": true }))
            }
            "proposal.reject" => {
                let id = Self::str_field(&payload, "id")?;
                self.proposals.reject(user_id, id).await?;
                Ok(json!({ "ok": true }))
            }
            "proposal.apply" => {
                let id = Self::str_field(&payload, "id")?;
                let workflow = self.proposals.apply(user_id, id).await?;
                Ok(serde_json::to_value(workflow)?)
            }

            other => Err(PlatformError::validation(format!(
                "unknown workflow API action: {other}"
            ))),
        }
    }
}

/// Flatten a dispatch outcome for API consumers.
pub fn outcome_json(outcome: DispatchOutcome) -> Value {
    match outcome {
        DispatchOutcome::Created(execution) => json!({
            "status": "created",
            "executionId": execution.id,
            "executionStatus": execution.status,
            "sessionId": execution.session_id,
        }),
        DispatchOutcome::Deduplicated(execution) => json!({
            "status": "deduplicated",
            "executionId": execution.id,
            "executionStatus": execution.status,
            "sessionId": execution.session_id,
        }),
        DispatchOutcome::Queued => json!({ "status": "queued" }),
        DispatchOutcome::RetryDispatch(execution) => json!({
            "status": "retry_dispatch",
            "executionId": execution.id,
            "executionStatus": execution.status,
            "sessionId": execution.session_id,
        }),
    }
}
