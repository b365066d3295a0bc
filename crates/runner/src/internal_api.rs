//! The localhost internal API.
//!
//! In-sandbox tooling (the agent loop, helper scripts) calls these
//! routes; each one marshals to a typed runner operation over the bridge
//! and awaits the correlated holder response. Wire bodies use
//! snake_case. No auth beyond the loopback check — nothing else can
//! reach this port inside the sandbox.

use crate::gateway::{require_localhost, SharedState};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use berth_core::error::PlatformError;
use berth_core::protocol::RunnerOp;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/image", post(image))
        .route("/spawn-child", post(spawn_child))
        .route("/terminate-child", post(terminate_child))
        .route("/session-message", post(session_message))
        .route("/session-messages", post(session_messages))
        .route("/create-pull-request", post(create_pull_request))
        .route("/update-pull-request", post(update_pull_request))
        .route("/git-state", post(git_state))
        .route("/memory/read", get(memory_read))
        .route("/memory/write", post(memory_write))
        .route("/memory/list", get(memory_list))
        .route("/repos", get(list_repos))
        .route("/personas", get(list_personas))
        .route("/workflow", post(workflow_api))
        .route("/mailbox/send", post(mailbox_send))
        .route("/mailbox/check", get(mailbox_check))
        .route("/task-board", post(task_board))
        .route("/channel-reply", post(channel_reply))
}

/// Run an op through the bridge and shape the HTTP response.
async fn run_op(
    state: &SharedState,
    addr: &ConnectInfo<SocketAddr>,
    op: RunnerOp,
) -> Response {
    if let Err(status) = require_localhost(addr) {
        return status.into_response();
    }
    match state.bridge.request(op).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: PlatformError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({ "error": e.kind(), "reason": e.to_string() })),
    )
        .into_response()
}

// ── Request bodies (snake_case on the wire) ──────────────────────────────

#[derive(Deserialize)]
struct ImageBody {
    data: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

async fn image(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<ImageBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::ImageUpload {
            data: body.data,
            description: body.description,
            mime_type: body.mime_type,
        },
    )
    .await
}

#[derive(Deserialize)]
struct SpawnChildBody {
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    persona_id: Option<String>,
}

async fn spawn_child(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<SpawnChildBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::SpawnChild {
            workspace: body.workspace,
            prompt: body.prompt,
            persona_id: body.persona_id,
        },
    )
    .await
}

#[derive(Deserialize)]
struct SessionIdBody {
    session_id: String,
}

async fn terminate_child(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<SessionIdBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::TerminateChild {
            session_id: body.session_id,
        },
    )
    .await
}

#[derive(Deserialize)]
struct SessionMessageBody {
    session_id: String,
    content: String,
}

async fn session_message(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<SessionMessageBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::SessionMessage {
            session_id: body.session_id,
            content: body.content,
        },
    )
    .await
}

#[derive(Deserialize)]
struct SessionMessagesBody {
    session_id: String,
    #[serde(default)]
    limit: Option<u32>,
}

async fn session_messages(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<SessionMessagesBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::SessionMessages {
            session_id: body.session_id,
            limit: body.limit,
        },
    )
    .await
}

#[derive(Deserialize)]
struct CreatePrBody {
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    base: Option<String>,
}

async fn create_pull_request(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<CreatePrBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::CreatePr {
            title: body.title,
            body: body.body,
            branch: body.branch,
            base: body.base,
        },
    )
    .await
}

#[derive(Deserialize)]
struct UpdatePrBody {
    number: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
}

async fn update_pull_request(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<UpdatePrBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::UpdatePr {
            number: body.number,
            title: body.title,
            body: body.body,
        },
    )
    .await
}

#[derive(Deserialize)]
struct GitStateBody {
    state: Value,
}

async fn git_state(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<GitStateBody>,
) -> Response {
    run_op(&state, &addr, RunnerOp::GitState { state: body.state }).await
}

#[derive(Deserialize)]
struct MemoryKeyQuery {
    key: String,
}

async fn memory_read(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Query(query): Query<MemoryKeyQuery>,
) -> Response {
    run_op(&state, &addr, RunnerOp::MemoryRead { key: query.key }).await
}

#[derive(Deserialize)]
struct MemoryWriteBody {
    key: String,
    value: Value,
}

async fn memory_write(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<MemoryWriteBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::MemoryWrite {
            key: body.key,
            value: body.value,
        },
    )
    .await
}

async fn memory_list(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
) -> Response {
    run_op(&state, &addr, RunnerOp::MemoryList).await
}

async fn list_repos(State(state): State<SharedState>, addr: ConnectInfo<SocketAddr>) -> Response {
    run_op(&state, &addr, RunnerOp::ListRepos).await
}

async fn list_personas(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
) -> Response {
    run_op(&state, &addr, RunnerOp::ListPersonas).await
}

#[derive(Deserialize)]
struct WorkflowApiBody {
    action: String,
    #[serde(default)]
    payload: Value,
}

async fn workflow_api(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<WorkflowApiBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::WorkflowApi {
            action: body.action,
            payload: body.payload,
        },
    )
    .await
}

#[derive(Deserialize)]
struct MailboxSendBody {
    session_id: String,
    body: String,
}

async fn mailbox_send(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<MailboxSendBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::MailboxSend {
            session_id: body.session_id,
            body: body.body,
        },
    )
    .await
}

async fn mailbox_check(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
) -> Response {
    run_op(&state, &addr, RunnerOp::MailboxCheck).await
}

#[derive(Deserialize)]
struct TaskBoardBody {
    action: String,
    #[serde(default)]
    payload: Value,
}

async fn task_board(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<TaskBoardBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::TaskBoard {
            action: body.action,
            payload: body.payload,
        },
    )
    .await
}

#[derive(Deserialize)]
struct ChannelReplyBody {
    content: String,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
}

async fn channel_reply(
    State(state): State<SharedState>,
    addr: ConnectInfo<SocketAddr>,
    Json(body): Json<ChannelReplyBody>,
) -> Response {
    run_op(
        &state,
        &addr,
        RunnerOp::ChannelReply {
            content: body.content,
            channel_type: body.channel_type,
            channel_id: body.channel_id,
        },
    )
    .await
}
