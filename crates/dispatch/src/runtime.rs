//! The execution runtime: state-machine operations the executor and the
//! HTTP surface drive against durable rows.

use crate::model::{ExecutionStatus, ExecutionStep, WorkflowExecution};
use crate::store::DispatchStore;
use berth_core::error::{PlatformError, PlatformResult};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone)]
pub struct ExecutionRuntime {
    store: DispatchStore,
}

impl ExecutionRuntime {
    pub fn new(store: DispatchStore) -> Self {
        ExecutionRuntime { store }
    }

    pub fn store(&self) -> &DispatchStore {
        &self.store
    }

    /// The executor picked the row up: pending → running.
    pub async fn start(&self, execution_id: &str) -> PlatformResult<WorkflowExecution> {
        if !self.store.executions.mark_running(execution_id).await? {
            let current = self.store.executions.require(execution_id).await?;
            return Err(PlatformError::Conflict(format!(
                "execution {execution_id} is {}, not pending",
                current.status
            )));
        }
        self.store.executions.require(execution_id).await
    }

    /// Record step progress. Attempts are 1-based; retries bump the
    /// attempt and get their own trace row.
    pub async fn record_step(&self, step: ExecutionStep) -> PlatformResult<()> {
        if step.attempt == 0 {
            return Err(PlatformError::validation("step attempt must be >= 1"));
        }
        self.store.executions.upsert_step(&step).await
    }

    /// Suspend at an approval gate: running → waiting_approval. Returns
    /// the resume token the approver must present.
    pub async fn suspend_for_approval(
        &self,
        execution_id: &str,
        runtime_state: Option<&Value>,
    ) -> PlatformResult<String> {
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .executions
            .mark_waiting_approval(execution_id, &token, runtime_state)
            .await?
        {
            let current = self.store.executions.require(execution_id).await?;
            return Err(PlatformError::Conflict(format!(
                "execution {execution_id} is {}, not running",
                current.status
            )));
        }
        Ok(token)
    }

    /// Approve a waiting execution. The token must match; terminal rows
    /// are a no-op conflict.
    pub async fn approve(
        &self,
        execution_id: &str,
        resume_token: &str,
        runtime_state: Option<&Value>,
    ) -> PlatformResult<WorkflowExecution> {
        let current = self.store.executions.require(execution_id).await?;
        if current.status.is_terminal() {
            return Err(PlatformError::Conflict(format!(
                "execution {execution_id} is already {}",
                current.status
            )));
        }
        if !self
            .store
            .executions
            .mark_resumed(execution_id, resume_token, runtime_state)
            .await?
        {
            return Err(PlatformError::Conflict(
                "resume token mismatch or execution not waiting for approval".into(),
            ));
        }
        self.store.executions.require(execution_id).await
    }

    /// Deny a waiting execution: finalized as failed. Token-checked like
    /// approve.
    pub async fn deny(&self, execution_id: &str, resume_token: &str) -> PlatformResult<()> {
        let current = self.store.executions.require(execution_id).await?;
        if current.status.is_terminal() {
            return Err(PlatformError::Conflict(format!(
                "execution {execution_id} is already {}",
                current.status
            )));
        }
        if current.status != ExecutionStatus::WaitingApproval
            || current.resume_token.as_deref() != Some(resume_token)
        {
            return Err(PlatformError::Conflict(
                "resume token mismatch or execution not waiting for approval".into(),
            ));
        }
        self.store
            .executions
            .finalize(
                execution_id,
                ExecutionStatus::Failed,
                Some("approval denied"),
                None,
            )
            .await?;
        Ok(())
    }

    /// Cancel. A no-op on terminal rows (idempotent), an error on
    /// unknown ids.
    pub async fn cancel(&self, execution_id: &str) -> PlatformResult<WorkflowExecution> {
        let current = self.store.executions.require(execution_id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        self.store
            .executions
            .finalize(execution_id, ExecutionStatus::Cancelled, None, None)
            .await?;
        self.store.executions.require(execution_id).await
    }

    pub async fn complete(
        &self,
        execution_id: &str,
        outputs: Option<&Value>,
    ) -> PlatformResult<bool> {
        self.store
            .executions
            .finalize(execution_id, ExecutionStatus::Completed, None, outputs)
            .await
    }

    pub async fn fail(&self, execution_id: &str, error: &str) -> PlatformResult<bool> {
        self.store
            .executions
            .finalize(execution_id, ExecutionStatus::Failed, Some(error), None)
            .await
    }
}

/// Convenience for building a step-trace row.
pub fn step(
    execution_id: &str,
    step_id: &str,
    attempt: u32,
    status: &str,
) -> ExecutionStep {
    ExecutionStep {
        execution_id: execution_id.to_string(),
        step_id: step_id.to_string(),
        attempt,
        status: status.to_string(),
        input: None,
        output: None,
        error: None,
        started_at: Some(OffsetDateTime::now_utc()),
        completed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::workflow_hash;
    use crate::store::test_support::stores;
    use berth_core::status::SessionPurpose;
    use berth_session::store::session_repo::NewSession;
    use serde_json::json;

    async fn seeded_execution() -> (ExecutionRuntime, String) {
        let (sessions, dispatch) = stores().await;
        let session = sessions
            .sessions
            .create(NewSession {
                owner_id: "u1".into(),
                workspace: String::new(),
                purpose: SessionPurpose::Workflow,
                parent_id: None,
                persona_id: None,
            })
            .await
            .unwrap();
        let data = json!({"steps": [{"id": "s1"}]});
        let execution = WorkflowExecution {
            id: "e1".into(),
            workflow_id: "w1".into(),
            user_id: "u1".into(),
            trigger_id: None,
            status: ExecutionStatus::Pending,
            trigger_type: "manual".into(),
            trigger_metadata: json!({}),
            variables: json!({}),
            outputs: None,
            error: None,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            workflow_version: Some("1.0.0".into()),
            workflow_hash: workflow_hash(&data),
            workflow_snapshot: data,
            idempotency_key: "k1".into(),
            session_id: session.id,
            resume_token: None,
            runtime_state: None,
            initiator_type: "user".into(),
            initiator_user_id: Some("u1".into()),
            attempt_count: 1,
        };
        dispatch.executions.insert(&execution).await.unwrap();
        (ExecutionRuntime::new(dispatch), "e1".to_string())
    }

    #[tokio::test]
    async fn happy_path_pending_running_completed() {
        let (runtime, id) = seeded_execution().await;
        let running = runtime.start(&id).await.unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);

        assert!(runtime.complete(&id, Some(&json!({"out": 1}))).await.unwrap());
        let done = runtime.store().executions.require(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.outputs.unwrap()["out"], 1);

        // Terminal: further completes are no-ops.
        assert!(!runtime.complete(&id, None).await.unwrap());
    }

    #[tokio::test]
    async fn start_twice_conflicts() {
        let (runtime, id) = seeded_execution().await;
        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.start(&id).await.unwrap_err().http_status(), 409);
    }

    #[tokio::test]
    async fn approval_gate_round_trip() {
        let (runtime, id) = seeded_execution().await;
        runtime.start(&id).await.unwrap();
        let token = runtime
            .suspend_for_approval(&id, Some(&json!({"step": "s1"})))
            .await
            .unwrap();

        let waiting = runtime.store().executions.require(&id).await.unwrap();
        assert_eq!(waiting.status, ExecutionStatus::WaitingApproval);
        assert_eq!(waiting.resume_token.as_deref(), Some(token.as_str()));

        // Wrong token is rejected.
        assert_eq!(
            runtime
                .approve(&id, "wrong", None)
                .await
                .unwrap_err()
                .http_status(),
            409
        );

        let resumed = runtime
            .approve(&id, &token, Some(&json!({"step": "s2"})))
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert!(resumed.resume_token.is_none());
        assert!(resumed.error.is_none());
        assert_eq!(resumed.attempt_count, 2);
        assert_eq!(resumed.runtime_state.unwrap()["step"], "s2");
    }

    #[tokio::test]
    async fn deny_fails_the_execution() {
        let (runtime, id) = seeded_execution().await;
        runtime.start(&id).await.unwrap();
        let token = runtime.suspend_for_approval(&id, None).await.unwrap();
        runtime.deny(&id, &token).await.unwrap();

        let denied = runtime.store().executions.require(&id).await.unwrap();
        assert_eq!(denied.status, ExecutionStatus::Failed);
        assert_eq!(denied.error.as_deref(), Some("approval denied"));
        assert!(denied.resume_token.is_none());

        // Approve after terminal is a conflict no-op.
        assert_eq!(
            runtime
                .approve(&id, &token, None)
                .await
                .unwrap_err()
                .http_status(),
            409
        );
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (runtime, id) = seeded_execution().await;
        let cancelled = runtime.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        // Never started: cancelled straight from pending.
        let again = runtime.cancel(&id).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn step_upsert_keeps_earliest_started_at_and_input() {
        let (runtime, id) = seeded_execution().await;
        runtime.start(&id).await.unwrap();

        let first_start = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        let mut first = step(&id, "s1", 1, "running");
        first.started_at = Some(first_start);
        first.input = Some(json!({"arg": 1}));
        runtime.record_step(first).await.unwrap();

        // Retry-style overwrite: later started_at, no input, new status.
        let mut second = step(&id, "s1", 1, "failed");
        second.error = Some("boom".into());
        second.completed_at = Some(OffsetDateTime::now_utc());
        runtime.record_step(second).await.unwrap();

        let steps = runtime.store().executions.steps_for_execution(&id).await.unwrap();
        assert_eq!(steps.len(), 1);
        let trace = &steps[0];
        assert_eq!(trace.status, "failed");
        assert_eq!(trace.error.as_deref(), Some("boom"));
        assert_eq!(trace.input.as_ref().unwrap()["arg"], 1);
        // started_at never regresses.
        let kept = trace.started_at.unwrap();
        assert!((kept - first_start).abs() < time::Duration::seconds(1));

        // A genuine retry gets its own attempt row.
        runtime.record_step(step(&id, "s1", 2, "running")).await.unwrap();
        let steps = runtime.store().executions.steps_for_execution(&id).await.unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[tokio::test]
    async fn attempt_zero_is_rejected() {
        let (runtime, id) = seeded_execution().await;
        let err = runtime.record_step(step(&id, "s1", 0, "running")).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }
}
