//! Message types for the session actor.
//!
//! One struct per operation; the actor IS the session, so none of them
//! carry a session id.

use crate::sockets::SocketSender;
use berth_core::protocol::{ClientFrame, ConnectedUser, HolderFrame, QueuedPrompt, RunnerFrame};
use berth_core::status::SessionStatus;

// ── Socket lifecycle ─────────────────────────────────────────────────────

/// A client WebSocket attached. The holder records the user, sends the
/// init snapshot and announces the new roster.
pub struct ClientConnect {
    pub conn_id: String,
    pub user: ConnectedUser,
    pub tx: SocketSender,
}

pub struct ClientDisconnect {
    pub conn_id: String,
}

/// A runner presented its single-use token. Success supersedes any
/// previously attached runner socket.
pub struct RunnerConnect {
    pub conn_id: String,
    pub token: String,
    pub tx: SocketSender,
}

pub struct RunnerDisconnect {
    pub conn_id: String,
    pub clean: bool,
    pub reason: Option<String>,
}

/// An adapter-owned socket bound to a scope key.
pub struct ChannelConnect {
    pub conn_id: String,
    pub scope_key: String,
    pub channel_type: String,
    pub channel_id: String,
    pub tx: SocketSender,
}

pub struct ChannelDisconnect {
    pub conn_id: String,
}

// ── Traffic ──────────────────────────────────────────────────────────────

/// A frame from a connected client.
pub struct ClientInput {
    pub conn_id: String,
    pub frame: ClientFrame,
}

/// A frame from the attached runner.
pub struct RunnerInput {
    pub frame: RunnerFrame,
}

/// Enqueue a prompt from outside the socket paths (channel webhooks, the
/// dispatcher, cross-session messaging).
pub struct EnqueuePrompt {
    pub prompt: QueuedPrompt,
}

/// Admin signal forwarded verbatim to the runner (`tunnel-delete`,
/// `workflow-execute`).
pub struct AdminSignal {
    pub frame: HolderFrame,
}

// ── Lifecycle / state ────────────────────────────────────────────────────

/// Mint a fresh runner token, invalidating every prior one. Replies with
/// the plaintext for the sandbox.
pub struct RotateToken;

pub struct GetStatus;

pub struct SetStatus {
    pub status: SessionStatus,
}

/// Periodic pending-question expiry sweep.
pub struct SweepQuestions;

/// Graceful termination: ask the runner to shut down, then finalize.
pub struct Terminate;

/// Internal: a spawned child session was created on behalf of this
/// session's runner.
pub(crate) struct ChildSpawned {
    pub session_id: String,
}

/// Internal: fan a frame out to clients from a detached resolution task
/// (PR created, git state reported).
pub(crate) struct Broadcast(pub berth_core::protocol::ServerFrame);

/// Internal: the detached terminate task finished (or timed out).
pub(crate) struct FinalizeTermination;
