//! Resolution of runner-initiated operations.
//!
//! The runner asks the platform for things (spawn a child, write memory,
//! reply on the bound channel) through `request` frames. Resolution can
//! take real time — store writes, other actors, outbound HTTP — so it
//! runs in a detached task that writes the `response` frame straight to
//! the runner socket instead of blocking the holder inbox.

use crate::actor::SessionActor;
use crate::messages::{Broadcast, ChildSpawned};
use crate::services::HolderServices;
use crate::sockets::{SocketOutput, SocketSender};
use crate::store::SessionStore;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::{HolderFrame, QueueMode, QueuedPrompt, RunnerOp};
use kameo::actor::ActorRef;
use serde_json::{json, Value};

/// Everything a resolution task needs, detached from the actor.
#[derive(Clone)]
pub struct OpContext {
    pub session_id: String,
    pub owner_id: String,
    pub store: SessionStore,
    pub services: HolderServices,
    pub runner_tx: SocketSender,
}

/// Spawn the resolution task for one runner request.
pub fn spawn_resolve(
    actor_ref: ActorRef<SessionActor>,
    ctx: OpContext,
    request_id: String,
    op: RunnerOp,
) {
    tokio::spawn(async move {
        let outcome = resolve(&actor_ref, &ctx, &op).await;
        let frame = match outcome {
            Ok(result) => HolderFrame::Response {
                request_id,
                result: Some(result),
                error: None,
            },
            Err(e) => HolderFrame::Response {
                request_id,
                result: None,
                error: Some(e.to_string()),
            },
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if ctx.runner_tx.send(SocketOutput::Frame(json)).await.is_err() {
                    log::debug!(
                        "session {}: runner gone before op response",
                        ctx.session_id
                    );
                }
            }
            Err(e) => log::error!("session {}: response serialize failed: {e}", ctx.session_id),
        }
    });
}

async fn resolve(
    actor_ref: &ActorRef<SessionActor>,
    ctx: &OpContext,
    op: &RunnerOp,
) -> PlatformResult<Value> {
    match op {
        RunnerOp::SpawnChild {
            workspace,
            prompt,
            persona_id,
        } => {
            let child_id = ctx
                .services
                .directory
                .spawn_child(
                    &ctx.owner_id,
                    &ctx.session_id,
                    workspace.clone(),
                    prompt.clone(),
                    persona_id.clone(),
                )
                .await?;
            let _ = actor_ref
                .tell(ChildSpawned {
                    session_id: child_id.clone(),
                })
                .await;
            Ok(json!({ "sessionId": child_id, "message": format!("Child session spawned: {child_id}") }))
        }
        RunnerOp::TerminateChild { session_id } => {
            ctx.services
                .directory
                .terminate_session(&ctx.owner_id, session_id)
                .await?;
            Ok(json!({ "terminated": session_id }))
        }
        RunnerOp::CreatePr {
            title,
            body,
            branch,
            base,
        } => match &ctx.services.pr {
            Some(pr) => {
                let result = pr
                    .create_pr(
                        &ctx.session_id,
                        title,
                        body.as_deref(),
                        branch.as_deref(),
                        base.as_deref(),
                    )
                    .await?;
                if let Some(url) = result["url"].as_str() {
                    let _ = actor_ref
                        .tell(Broadcast(berth_core::protocol::ServerFrame::PrCreated {
                            url: url.to_string(),
                            number: result["number"].as_u64(),
                        }))
                        .await;
                }
                Ok(result)
            }
            None => Err(HolderServices::unavailable("pull-request provider")),
        },
        RunnerOp::UpdatePr {
            number,
            title,
            body,
        } => match &ctx.services.pr {
            Some(pr) => {
                pr.update_pr(&ctx.session_id, *number, title.as_deref(), body.as_deref())
                    .await
            }
            None => Err(HolderServices::unavailable("pull-request provider")),
        },
        RunnerOp::GitState { state } => {
            ctx.store.extras.set_git_state(&ctx.session_id, state).await?;
            let _ = actor_ref
                .tell(Broadcast(berth_core::protocol::ServerFrame::GitState {
                    state: state.clone(),
                }))
                .await;
            Ok(json!({ "ok": true }))
        }
        RunnerOp::ImageUpload {
            data,
            description: _,
            mime_type,
        } => match &ctx.services.images {
            Some(images) => {
                let url = images.store(data, mime_type.as_deref()).await?;
                Ok(json!({ "url": url }))
            }
            None => Err(HolderServices::unavailable("image store")),
        },
        RunnerOp::MemoryRead { key } => {
            let value = ctx.store.extras.memory_read(&ctx.owner_id, key).await?;
            Ok(json!({ "key": key, "value": value }))
        }
        RunnerOp::MemoryWrite { key, value } => {
            ctx.store
                .extras
                .memory_write(&ctx.owner_id, key, value)
                .await?;
            Ok(json!({ "ok": true }))
        }
        RunnerOp::MemoryList => {
            let keys = ctx.store.extras.memory_list(&ctx.owner_id).await?;
            Ok(json!({ "keys": keys }))
        }
        RunnerOp::ListRepos => match &ctx.services.catalog {
            Some(catalog) => catalog.list_repos(&ctx.owner_id).await,
            None => Ok(json!({ "repos": [] })),
        },
        RunnerOp::ListPersonas => match &ctx.services.catalog {
            Some(catalog) => catalog.list_personas(&ctx.owner_id).await,
            None => Ok(json!({ "personas": [] })),
        },
        RunnerOp::SessionMessage {
            session_id,
            content,
        } => {
            let prompt = QueuedPrompt {
                content: content.clone(),
                model: None,
                author: None,
                model_preferences: None,
                attachments: None,
                channel_type: None,
                channel_id: None,
                queue_mode: QueueMode::Followup,
                scope_key: None,
            };
            ctx.services
                .directory
                .post_prompt(&ctx.owner_id, session_id, prompt)
                .await?;
            Ok(json!({ "ok": true }))
        }
        RunnerOp::SessionMessages { session_id, limit } => {
            let messages = ctx
                .services
                .directory
                .read_messages(&ctx.owner_id, session_id, *limit)
                .await?;
            Ok(json!({ "messages": messages }))
        }
        RunnerOp::WorkflowApi { action, payload } => match &ctx.services.workflow_api {
            Some(api) => api.call(&ctx.owner_id, action, payload.clone()).await,
            None => Err(HolderServices::unavailable("workflow API")),
        },
        RunnerOp::MailboxSend { session_id, body } => {
            ctx.store
                .extras
                .mailbox_send(session_id, &ctx.session_id, body)
                .await?;
            Ok(json!({ "ok": true }))
        }
        RunnerOp::MailboxCheck => {
            let mail = ctx.store.extras.mailbox_check(&ctx.session_id).await?;
            Ok(json!({ "mail": mail }))
        }
        RunnerOp::TaskBoard { action, payload } => {
            resolve_task_board(ctx, action, payload).await
        }
        RunnerOp::ChannelReply {
            content,
            channel_type,
            channel_id,
        } => match &ctx.services.channel_sender {
            Some(sender) => {
                sender
                    .reply(
                        &ctx.session_id,
                        channel_type.as_deref(),
                        channel_id.as_deref(),
                        content,
                    )
                    .await
            }
            None => Err(HolderServices::unavailable("channel delivery")),
        },
    }
}

async fn resolve_task_board(
    ctx: &OpContext,
    action: &str,
    payload: &Value,
) -> PlatformResult<Value> {
    match action {
        "create" => {
            let title = payload["title"]
                .as_str()
                .ok_or_else(|| PlatformError::validation("task title required"))?;
            let id = ctx
                .store
                .extras
                .task_create(&ctx.owner_id, title, payload.get("payload").cloned())
                .await?;
            Ok(json!({ "id": id }))
        }
        "set-status" => {
            let id = payload["id"]
                .as_str()
                .ok_or_else(|| PlatformError::validation("task id required"))?;
            let status = payload["status"]
                .as_str()
                .ok_or_else(|| PlatformError::validation("task status required"))?;
            let updated = ctx.store.extras.task_set_status(id, status).await?;
            if updated {
                Ok(json!({ "ok": true }))
            } else {
                Err(PlatformError::not_found("task", id))
            }
        }
        "list" => {
            let tasks = ctx.store.extras.task_list(&ctx.owner_id).await?;
            Ok(json!({ "tasks": tasks }))
        }
        other => Err(PlatformError::validation(format!(
            "unknown task board action: {other}"
        ))),
    }
}
