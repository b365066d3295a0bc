//! The authenticated HTTP API: sessions, triggers, workflows,
//! executions, proposals.
//!
//! Status mapping: 200 on dedup-hit, 201 on create, 202 on queued
//! dispatch, 400 validation, 401 auth, 404 unknown, 409 conflicts,
//! 429 admission (body carries `activeUser` / `activeGlobal` / `limit`).

use crate::state::{fail, ApiResult, AppState, AuthedUser};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use berth_core::error::PlatformError;
use berth_core::protocol::{QueueMode, QueuedPrompt};
use berth_core::status::SessionPurpose;
use berth_dispatch::api::outcome_json;
use berth_dispatch::model::TriggerDraft;
use berth_dispatch::validate;
use berth_dispatch::DispatchOutcome;
use berth_session::messages::RotateToken;
use berth_session::services::SessionDirectory;
use berth_session::store::session_repo::NewSession;
use kameo::error::SendError;
use serde::Deserialize;
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        // Sessions
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}/prompt", post(post_session_prompt))
        .route("/sessions/{id}/rotate-token", post(rotate_token))
        .route("/sessions/{id}/terminate", post(terminate_session))
        // Triggers
        .route("/triggers", post(create_trigger).get(list_triggers))
        .route("/triggers/{id}", delete(delete_trigger))
        .route("/triggers/{id}/enabled", post(set_trigger_enabled))
        .route("/triggers/{id}/run", post(run_trigger))
        // Webhook trigger ingress
        .route("/hooks/{user_id}/{path}", post(fire_webhook).get(fire_webhook_get))
        // Workflows
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}/run", post(run_workflow))
        .route("/workflows/{id}/history", get(workflow_history))
        .route("/workflows/{id}/rollback", post(rollback_workflow))
        .route("/workflows/{id}/proposals", post(create_proposal))
        // Executions
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/approve", post(approve_execution))
        .route("/executions/{id}/deny", post(deny_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        // Proposals
        .route("/proposals/{id}/approve", post(approve_proposal))
        .route("/proposals/{id}/reject", post(reject_proposal))
        .route("/proposals/{id}/apply", post(apply_proposal))
}

fn ask_err<M>(e: SendError<M, PlatformError>) -> Response {
    match e {
        SendError::HandlerError(err) => fail(err),
        _ => fail(PlatformError::Internal("session actor unavailable".into())),
    }
}

fn dispatch_response(outcome: DispatchOutcome) -> Response {
    let status = match &outcome {
        DispatchOutcome::Created(_) => StatusCode::CREATED,
        DispatchOutcome::Deduplicated(_) => StatusCode::OK,
        DispatchOutcome::Queued | DispatchOutcome::RetryDispatch(_) => StatusCode::ACCEPTED,
    };
    (status, Json(outcome_json(outcome))).into_response()
}

// ── Sessions ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateSessionBody {
    workspace: String,
    #[serde(default)]
    purpose: Option<SessionPurpose>,
    #[serde(default)]
    persona_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult {
    let (record, token) = state
        .registry
        .create_session(NewSession {
            owner_id: user.id,
            workspace: body.workspace,
            purpose: body.purpose.unwrap_or(SessionPurpose::Interactive),
            parent_id: None,
            persona_id: body.persona_id,
        })
        .await
        .map_err(fail)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "session": record.view(), "runnerToken": token })),
    )
        .into_response())
}

async fn list_sessions(State(state): State<AppState>, user: AuthedUser) -> ApiResult {
    let sessions = state
        .registry
        .store()
        .sessions
        .list_for_owner(&user.id)
        .await
        .map_err(fail)?;
    let views: Vec<_> = sessions.iter().map(|s| s.view()).collect();
    Ok(Json(json!({ "sessions": views })).into_response())
}

#[derive(Deserialize)]
struct PromptBody {
    content: String,
    #[serde(default)]
    queue_mode: Option<QueueMode>,
}

async fn post_session_prompt(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
    Json(body): Json<PromptBody>,
) -> ApiResult {
    let prompt = QueuedPrompt::text(body.content, body.queue_mode.unwrap_or_default());
    state
        .registry
        .post_prompt(&user.id, &session_id, prompt)
        .await
        .map_err(fail)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response())
}

async fn rotate_token(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
) -> ApiResult {
    let record = state
        .registry
        .store()
        .sessions
        .require(&session_id)
        .await
        .map_err(fail)?;
    if record.owner_id != user.id {
        return Err(fail(PlatformError::not_found("session", &session_id)));
    }
    let actor = state
        .registry
        .ensure_actor(&session_id)
        .await
        .map_err(fail)?;
    let token = actor.ask(RotateToken).await.map_err(ask_err)?;
    Ok(Json(json!({ "runnerToken": token })).into_response())
}

async fn terminate_session(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(session_id): Path<String>,
) -> ApiResult {
    state
        .registry
        .terminate_session(&user.id, &session_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "status": "terminated" })).into_response())
}

// ── Triggers ─────────────────────────────────────────────────────────────

async fn create_trigger(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(draft): Json<TriggerDraft>,
) -> ApiResult {
    let config = validate::validate_draft(&draft).map_err(fail)?;
    if let Some(workflow_id) = &draft.workflow_id {
        let workflow = state
            .dispatcher
            .store()
            .workflows
            .require(workflow_id)
            .await
            .map_err(fail)?;
        if workflow.user_id != user.id {
            return Err(fail(PlatformError::not_found("workflow", workflow_id)));
        }
    }
    let trigger = state
        .dispatcher
        .store()
        .triggers
        .insert(
            &user.id,
            draft.workflow_id.clone(),
            &draft.name,
            draft.enabled,
            draft.trigger_type,
            &config,
            draft.variable_mapping.as_ref(),
        )
        .await
        .map_err(fail)?;
    Ok((StatusCode::CREATED, Json(json!({ "trigger": trigger }))).into_response())
}

async fn list_triggers(State(state): State<AppState>, user: AuthedUser) -> ApiResult {
    let triggers = state
        .dispatcher
        .store()
        .triggers
        .list_for_user(&user.id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "triggers": triggers })).into_response())
}

async fn owned_trigger(
    state: &AppState,
    user: &AuthedUser,
    trigger_id: &str,
) -> Result<berth_dispatch::Trigger, Response> {
    let trigger = state
        .dispatcher
        .store()
        .triggers
        .require(trigger_id)
        .await
        .map_err(fail)?;
    if trigger.user_id != user.id {
        return Err(fail(PlatformError::not_found("trigger", trigger_id)));
    }
    Ok(trigger)
}

async fn delete_trigger(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(trigger_id): Path<String>,
) -> ApiResult {
    owned_trigger(&state, &user, &trigger_id).await?;
    state
        .dispatcher
        .store()
        .triggers
        .delete(&trigger_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "status": "deleted" })).into_response())
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_trigger_enabled(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(trigger_id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult {
    owned_trigger(&state, &user, &trigger_id).await?;
    state
        .dispatcher
        .store()
        .triggers
        .set_enabled(&trigger_id, body.enabled)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "enabled": body.enabled })).into_response())
}

#[derive(Deserialize, Default)]
struct RunBody {
    #[serde(default)]
    client_request_id: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    variables: Option<Value>,
}

async fn run_trigger(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(trigger_id): Path<String>,
    body: Option<Json<RunBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = state
        .dispatcher
        .run_manual_trigger(
            &user.id,
            &trigger_id,
            body.client_request_id,
            body.body.unwrap_or(Value::Null),
        )
        .await
        .map_err(fail)?;
    Ok(dispatch_response(outcome))
}

// ── Webhook ingress ──────────────────────────────────────────────────────

async fn fire_webhook(
    State(state): State<AppState>,
    Path((user_id, path)): Path<(String, String)>,
    headers: axum::http::HeaderMap,
    body: Option<Json<Value>>,
) -> ApiResult {
    let delivery_id = headers
        .get("x-delivery-id")
        .or_else(|| headers.get("x-github-delivery"))
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let outcome = state
        .dispatcher
        .fire_webhook(
            &user_id,
            &path,
            delivery_id.as_deref(),
            body.map(|Json(b)| b).unwrap_or(Value::Null),
        )
        .await
        .map_err(fail)?;
    Ok(dispatch_response(outcome))
}

async fn fire_webhook_get(
    state: State<AppState>,
    path: Path<(String, String)>,
    headers: axum::http::HeaderMap,
) -> ApiResult {
    fire_webhook(state, path, headers, None).await
}

// ── Workflows ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateWorkflowBody {
    name: String,
    data: Value,
}

async fn create_workflow(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<CreateWorkflowBody>,
) -> ApiResult {
    let workflow = state
        .dispatcher
        .store()
        .workflows
        .create(&user.id, &body.name, body.data)
        .await
        .map_err(fail)?;
    Ok((StatusCode::CREATED, Json(json!({ "workflow": workflow }))).into_response())
}

async fn list_workflows(State(state): State<AppState>, user: AuthedUser) -> ApiResult {
    let workflows = state
        .dispatcher
        .store()
        .workflows
        .list_for_user(&user.id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "workflows": workflows })).into_response())
}

async fn run_workflow(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(workflow_id): Path<String>,
    body: Option<Json<RunBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = state
        .dispatcher
        .run_manual(
            &user.id,
            &workflow_id,
            body.client_request_id,
            body.variables.unwrap_or_else(|| json!({})),
        )
        .await
        .map_err(fail)?;
    Ok(dispatch_response(outcome))
}

async fn workflow_history(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(workflow_id): Path<String>,
) -> ApiResult {
    let workflow = state
        .dispatcher
        .store()
        .workflows
        .require(&workflow_id)
        .await
        .map_err(fail)?;
    if workflow.user_id != user.id {
        return Err(fail(PlatformError::not_found("workflow", &workflow_id)));
    }
    let history = state
        .dispatcher
        .store()
        .workflows
        .history_for_workflow(&workflow_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "history": history })).into_response())
}

#[derive(Deserialize)]
struct RollbackBody {
    hash: String,
}

async fn rollback_workflow(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(workflow_id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> ApiResult {
    let workflow = state
        .proposals
        .rollback(&user.id, &workflow_id, &body.hash)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "workflow": workflow })).into_response())
}

#[derive(Deserialize)]
struct CreateProposalBody {
    data: Value,
    #[serde(default)]
    execution_id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_proposal(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(workflow_id): Path<String>,
    Json(body): Json<CreateProposalBody>,
) -> ApiResult {
    let proposal = state
        .proposals
        .propose(
            &user.id,
            &workflow_id,
            body.execution_id,
            body.data,
            body.description,
        )
        .await
        .map_err(fail)?;
    Ok((StatusCode::CREATED, Json(json!({ "proposal": proposal }))).into_response())
}

// ── Executions ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_executions(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let executions = state
        .dispatcher
        .store()
        .executions
        .list_for_user(&user.id, query.limit.unwrap_or(50))
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "executions": executions })).into_response())
}

async fn owned_execution(
    state: &AppState,
    user: &AuthedUser,
    execution_id: &str,
) -> Result<berth_dispatch::WorkflowExecution, Response> {
    let execution = state
        .dispatcher
        .store()
        .executions
        .require(execution_id)
        .await
        .map_err(fail)?;
    if execution.user_id != user.id {
        return Err(fail(PlatformError::not_found("execution", execution_id)));
    }
    Ok(execution)
}

async fn get_execution(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(execution_id): Path<String>,
) -> ApiResult {
    let execution = owned_execution(&state, &user, &execution_id).await?;
    let steps = state
        .dispatcher
        .store()
        .executions
        .steps_for_execution(&execution_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "execution": execution, "steps": steps })).into_response())
}

#[derive(Deserialize)]
struct ApproveBody {
    resume_token: String,
    #[serde(default)]
    runtime_state: Option<Value>,
}

async fn approve_execution(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(execution_id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> ApiResult {
    owned_execution(&state, &user, &execution_id).await?;
    let execution = state
        .runtime
        .approve(&execution_id, &body.resume_token, body.runtime_state.as_ref())
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "execution": execution })).into_response())
}

#[derive(Deserialize)]
struct DenyBody {
    resume_token: String,
}

async fn deny_execution(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(execution_id): Path<String>,
    Json(body): Json<DenyBody>,
) -> ApiResult {
    owned_execution(&state, &user, &execution_id).await?;
    state
        .runtime
        .deny(&execution_id, &body.resume_token)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "status": "denied" })).into_response())
}

async fn cancel_execution(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(execution_id): Path<String>,
) -> ApiResult {
    owned_execution(&state, &user, &execution_id).await?;
    let execution = state.runtime.cancel(&execution_id).await.map_err(fail)?;
    Ok(Json(json!({ "execution": execution })).into_response())
}

// ── Proposals ────────────────────────────────────────────────────────────

async fn approve_proposal(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(proposal_id): Path<String>,
) -> ApiResult {
    state
        .proposals
        .approve(&user.id, &proposal_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "status": "approved" })).into_response())
}

async fn reject_proposal(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(proposal_id): Path<String>,
) -> ApiResult {
    state
        .proposals
        .reject(&user.id, &proposal_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "status": "rejected" })).into_response())
}

async fn apply_proposal(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(proposal_id): Path<String>,
) -> ApiResult {
    let workflow = state
        .proposals
        .apply(&user.id, &proposal_id)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "workflow": workflow })).into_response())
}
