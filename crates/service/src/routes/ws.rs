//! WebSocket endpoints for the three session socket roles.
//!
//! Each accepted socket becomes a pair of tasks: the holder writes
//! through an mpsc outbox (interpreting `Close` instructions), and the
//! read loop feeds frames back into the holder actor. Rejected upgrades
//! close with code 1002 so the runner bridge can count them.

use crate::state::{AppState, AuthedUser};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use berth_core::protocol::{ClientFrame, ConnectedUser, RunnerFrame, CLOSE_AUTH_REJECTED};
use berth_session::messages::{
    ChannelConnect, ChannelDisconnect, ClientConnect, ClientDisconnect, ClientInput,
    RunnerConnect, RunnerDisconnect, RunnerInput,
};
use berth_session::sockets::{SocketOutput, SOCKET_BUFFER};
use berth_session::SessionActor;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kameo::actor::ActorRef;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Write half: drain the holder's outbox onto the socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<SocketOutput>,
) {
    while let Some(output) = rx.recv().await {
        match output {
            SocketOutput::Frame(json) => {
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            SocketOutput::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Close an accepted socket with a specific code before any traffic.
async fn reject(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

// ── Client role ──────────────────────────────────────────────────────────

pub async fn client_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    user: AuthedUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| client_session(state, session_id, user, socket))
}

async fn client_session(state: AppState, session_id: String, user: AuthedUser, socket: WebSocket) {
    let actor = match state.registry.ensure_actor(&session_id).await {
        Ok(actor) => actor,
        Err(e) => {
            log::warn!("client ws: session {session_id}: {e}");
            reject(socket, CLOSE_AUTH_REJECTED, "unknown session").await;
            return;
        }
    };

    // Visibility: orchestrator/workflow sessions only for their owner.
    match state.registry.store().sessions.require(&session_id).await {
        Ok(record) if record.visible_to(&user.id) => {}
        _ => {
            reject(socket, CLOSE_AUTH_REJECTED, "unknown session").await;
            return;
        }
    }

    let conn_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
    let (sink, source) = socket.split();

    let connected_user = ConnectedUser {
        id: user.id.clone(),
        name: None,
        email: None,
        avatar: None,
    };
    if actor
        .tell(ClientConnect {
            conn_id: conn_id.clone(),
            user: connected_user,
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(write_loop(sink, rx));
    client_read_loop(&actor, &conn_id, source).await;
    writer.abort();
    let _ = actor
        .tell(ClientDisconnect {
            conn_id: conn_id.clone(),
        })
        .await;
}

async fn client_read_loop(
    actor: &ActorRef<SessionActor>,
    conn_id: &str,
    mut source: SplitStream<WebSocket>,
) {
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    let _ = actor
                        .tell(ClientInput {
                            conn_id: conn_id.to_string(),
                            frame,
                        })
                        .await;
                }
                Err(e) => {
                    log::debug!("client ws: dropping undecodable frame: {e}");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("client ws: socket error: {e}");
                break;
            }
        }
    }
}

// ── Runner role ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RunnerQuery {
    token: String,
}

pub async fn runner_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RunnerQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| runner_session(state, session_id, query.token, socket))
}

async fn runner_session(state: AppState, session_id: String, token: String, socket: WebSocket) {
    let actor = match state.registry.ensure_actor(&session_id).await {
        Ok(actor) => actor,
        Err(e) => {
            log::warn!("runner ws: session {session_id}: {e}");
            reject(socket, CLOSE_AUTH_REJECTED, "unknown session").await;
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
    if actor
        .ask(RunnerConnect {
            conn_id: conn_id.clone(),
            token,
            tx,
        })
        .await
        .is_err()
    {
        // Stale or invalid token: the bridge counts these closes.
        reject(socket, CLOSE_AUTH_REJECTED, "invalid runner token").await;
        return;
    }

    let (sink, mut source) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx));

    let mut clean = false;
    let mut close_reason = None;
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<RunnerFrame>(&text) {
                Ok(frame) => {
                    let _ = actor.tell(RunnerInput { frame }).await;
                }
                Err(e) => {
                    log::debug!("runner ws: dropping undecodable frame: {e}");
                }
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    clean = frame.code == 1000;
                    if !frame.reason.is_empty() {
                        close_reason = Some(frame.reason.to_string());
                    }
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                close_reason = Some(e.to_string());
                break;
            }
        }
    }
    writer.abort();
    let _ = actor
        .tell(RunnerDisconnect {
            conn_id,
            clean,
            reason: close_reason,
        })
        .await;
}

// ── Channel role ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChannelQuery {
    scope_key: String,
    channel_type: String,
    channel_id: String,
}

pub async fn channel_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ChannelQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| channel_session(state, session_id, query, socket))
}

async fn channel_session(
    state: AppState,
    session_id: String,
    query: ChannelQuery,
    socket: WebSocket,
) {
    let actor = match state.registry.ensure_actor(&session_id).await {
        Ok(actor) => actor,
        Err(e) => {
            log::warn!("channel ws: session {session_id}: {e}");
            reject(socket, CLOSE_AUTH_REJECTED, "unknown session").await;
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(SOCKET_BUFFER);
    let (sink, mut source) = socket.split();

    if actor
        .tell(ChannelConnect {
            conn_id: conn_id.clone(),
            scope_key: query.scope_key,
            channel_type: query.channel_type,
            channel_id: query.channel_id,
            tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(write_loop(sink, rx));
    // Channel sockets are one-directional fan-out; inbound traffic comes
    // through the webhook route.
    while let Some(result) = source.next().await {
        match result {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    writer.abort();
    let _ = actor.tell(ChannelDisconnect { conn_id }).await;
}
