//! Wire protocol for the three session socket roles.
//!
//! Clients, the holder and the runner exchange JSON frames tagged with a
//! `type` field. Unknown frame types are logged and ignored by every
//! receiver; frames that fail to parse are logged and dropped. Field
//! names are camelCase on the wire.
//!
//! Correlated operations travel inside `request` / `response` envelopes
//! carrying a `requestId`; both the holder and the runner bridge keep a
//! pending table keyed by it, with per-operation deadlines from
//! [`op_deadline`].

use crate::message::{Attachment, Author, Message, MessagePatch};
use crate::question::PendingQuestion;
use crate::status::{AgentStatus, SessionPurpose, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;

/// Close code used when a WebSocket upgrade is rejected (bad credentials
/// or a stale runner token).
pub const CLOSE_AUTH_REJECTED: u16 = 1002;
/// Close code used when an upstream proxy target errors.
pub const CLOSE_UPSTREAM_ERROR: u16 = 1011;
/// Normal-close reason announcing runner supersession. The superseded
/// runner must exit 0 without reconnecting.
pub const SUPERSEDED_REASON: &str = "Replaced by new runner connection";

/// Consecutive `1002` upgrade rejections after which the bridge treats
/// the rotation as intentional and exits the sandbox.
pub const MAX_CONSECUTIVE_UPGRADE_FAILURES: u32 = 5;

// ── Prompt queue ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    #[default]
    Followup,
    Collect,
    Steer,
}

/// One element of a session's prompt queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedPrompt {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "modelPreferences"
    )]
    pub model_preferences: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
    pub channel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
    pub channel_id: Option<String>,
    #[serde(default, rename = "queueMode")]
    pub queue_mode: QueueMode,
    /// Scope key of the originating binding; drives collect coalescing.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "scopeKey")]
    pub scope_key: Option<String>,
}

impl QueuedPrompt {
    pub fn text(content: impl Into<String>, queue_mode: QueueMode) -> Self {
        QueuedPrompt {
            content: content.into(),
            model: None,
            author: None,
            model_preferences: None,
            attachments: None,
            channel_type: None,
            channel_id: None,
            queue_mode,
            scope_key: None,
        }
    }
}

// ── Supporting DTOs ──────────────────────────────────────────────────────

/// A client currently attached to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Read-only session projection carried in the init snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    pub workspace: String,
    pub status: SessionStatus,
    pub purpose: SessionPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "parentId")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "personaId")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "gatewayUrl")]
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sandboxId")]
    pub sandbox_id: Option<String>,
    #[serde(with = "time::serde::rfc3339", rename = "createdAt")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", rename = "lastActiveAt")]
    pub last_active_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub additions: u32,
    pub deletions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Event detail attached to a `status` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEvent {
    QuestionAnswered {
        #[serde(rename = "questionId")]
        question_id: String,
    },
    QuestionExpired {
        #[serde(rename = "questionId")]
        question_id: String,
    },
}

/// Full state handed to a client on connect or holder restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSnapshot {
    pub session: SessionView,
    pub messages: Vec<Message>,
    pub status: SessionStatus,
    #[serde(rename = "agentStatus")]
    pub agent_status: AgentStatus,
    #[serde(rename = "queuedPrompts")]
    pub queued_prompts: usize,
    #[serde(rename = "pendingQuestions")]
    pub pending_questions: Vec<PendingQuestion>,
    pub users: Vec<ConnectedUser>,
    #[serde(rename = "auditLog")]
    pub audit_log: Vec<AuditEntry>,
}

// ── Client → holder ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Prompt {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<Attachment>>,
        #[serde(default, rename = "queueMode")]
        queue_mode: QueueMode,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
        channel_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
        channel_id: Option<String>,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
        channel_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
        channel_id: Option<String>,
    },
    Revert {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Answer {
        #[serde(rename = "questionId")]
        question_id: String,
        answer: String,
    },
    Diff,
    Review,
    Ping,
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
        channel_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
        channel_id: Option<String>,
    },
}

// ── Holder → client ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "init")]
    Init { snapshot: InitSnapshot },
    #[serde(rename = "message")]
    Message { message: Message },
    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },
    #[serde(rename = "messages.removed")]
    MessagesRemoved {
        #[serde(rename = "messageIds")]
        message_ids: Vec<String>,
    },
    #[serde(rename = "status")]
    Status {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<SessionEvent>,
    },
    #[serde(rename = "chunk")]
    Chunk {
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
    },
    #[serde(rename = "question")]
    Question { question: PendingQuestion },
    #[serde(rename = "agentStatus")]
    AgentStatus {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
        channel_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
        channel_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "models")]
    Models { models: Vec<ModelInfo> },
    #[serde(rename = "diff")]
    Diff { files: Vec<DiffFile> },
    #[serde(rename = "git-state")]
    GitState { state: Value },
    #[serde(rename = "pr-created")]
    PrCreated {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number: Option<u64>,
    },
    #[serde(rename = "files-changed")]
    FilesChanged { files: Vec<String> },
    #[serde(rename = "child-session")]
    ChildSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        event: String,
    },
    #[serde(rename = "review-result")]
    ReviewResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "title")]
    Title { title: String },
    #[serde(rename = "audit_log")]
    AuditLog { entries: Vec<AuditEntry> },
    #[serde(rename = "command-result")]
    CommandResult {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    #[serde(rename = "toast")]
    Toast { level: String, message: String },
    #[serde(rename = "user.joined")]
    UserJoined {
        user: ConnectedUser,
        users: Vec<ConnectedUser>,
    },
    #[serde(rename = "user.left")]
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
        users: Vec<ConnectedUser>,
    },
    #[serde(rename = "pong")]
    Pong,
}

// ── Runner → holder ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunnerFrame {
    /// One streaming text chunk of the in-flight assistant turn.
    #[serde(rename = "stream")]
    Stream { delta: String },
    /// Final assistant message for the in-flight turn.
    #[serde(rename = "result")]
    Result { message: Message },
    /// Tool-call progress: patch applied to an existing journal message,
    /// or a fresh tool message when `messageId` is absent.
    #[serde(rename = "tool")]
    Tool {
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "messageId")]
        message_id: Option<String>,
        #[serde(flatten)]
        patch: MessagePatch,
    },
    #[serde(rename = "question")]
    Question { question: PendingQuestion },
    #[serde(rename = "agentStatus")]
    AgentStatus { status: AgentStatus },
    #[serde(rename = "diff")]
    Diff { files: Vec<DiffFile> },
    #[serde(rename = "review-result")]
    ReviewResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "models")]
    Models { models: Vec<ModelInfo> },
    /// Agent-loop failure. The holder relays it to clients and appends a
    /// `system` journal message.
    #[serde(rename = "error")]
    Error { message: String },
    /// Runner-initiated correlated operation.
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        op: RunnerOp,
    },
    /// Reply to a holder-initiated operation.
    #[serde(rename = "response")]
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Operations the runner asks the platform to perform. Marshalled from
/// the gateway's internal API through the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RunnerOp {
    SpawnChild {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "personaId")]
        persona_id: Option<String>,
    },
    TerminateChild {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    CreatePr {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<String>,
    },
    UpdatePr {
        number: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    GitState {
        state: Value,
    },
    ImageUpload {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "mimeType")]
        mime_type: Option<String>,
    },
    MemoryRead {
        key: String,
    },
    MemoryWrite {
        key: String,
        value: Value,
    },
    MemoryList,
    ListRepos,
    ListPersonas,
    /// Post a message into another session owned by the same user.
    SessionMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
    },
    /// Read another session's messages. The result surface is
    /// deliberately narrow: role, content, createdAt only.
    SessionMessages {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    /// Workflow/trigger/execution API passthrough.
    WorkflowApi {
        action: String,
        #[serde(default)]
        payload: Value,
    },
    MailboxSend {
        #[serde(rename = "sessionId")]
        session_id: String,
        body: String,
    },
    MailboxCheck,
    TaskBoard {
        action: String,
        #[serde(default)]
        payload: Value,
    },
    /// Reply on the channel this session is bound to.
    ChannelReply {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelType")]
        channel_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "channelId")]
        channel_id: Option<String>,
    },
}

/// Narrow cross-session message projection returned by
/// `RunnerOp::SessionMessages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessageView {
    pub role: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339", rename = "createdAt")]
    pub created_at: OffsetDateTime,
}

// ── Holder → runner ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HolderFrame {
    #[serde(rename = "prompt")]
    Prompt { prompt: QueuedPrompt },
    #[serde(rename = "answer")]
    Answer {
        #[serde(rename = "questionId")]
        question_id: String,
        answer: String,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "revert")]
    Revert {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "diff")]
    Diff,
    #[serde(rename = "review")]
    Review,
    /// Holder-initiated correlated operation.
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(flatten)]
        op: HolderOp,
    },
    /// Reply to a runner-initiated operation.
    #[serde(rename = "response")]
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "tunnel-delete")]
    TunnelDelete,
    #[serde(rename = "workflow-execute")]
    WorkflowExecute {
        #[serde(rename = "executionId")]
        execution_id: String,
        workflow: Value,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

/// Operations the holder round-trips to its runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum HolderOp {
    /// Graceful shutdown request; the runner acknowledges before exiting.
    Terminate,
}

// ── Correlation deadlines ────────────────────────────────────────────────

/// Coarse operation classes for correlation deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    General,
    Pr,
    Spawn,
    Terminate,
}

impl RunnerOp {
    pub fn class(&self) -> OpClass {
        match self {
            RunnerOp::SpawnChild { .. } => OpClass::Spawn,
            RunnerOp::TerminateChild { .. } => OpClass::Terminate,
            RunnerOp::CreatePr { .. } | RunnerOp::UpdatePr { .. } => OpClass::Pr,
            _ => OpClass::General,
        }
    }
}

/// Deadline for a correlated round-trip of the given class.
pub fn op_deadline(class: OpClass) -> Duration {
    match class {
        OpClass::General => Duration::from_secs(15),
        OpClass::Pr => Duration::from_secs(30),
        OpClass::Spawn => Duration::from_secs(60),
        OpClass::Terminate => Duration::from_secs(30),
    }
}

/// Keepalive interval for both the runner bridge and the holder side.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_prompt_parses_the_documented_shape() {
        let raw = r#"{"type":"prompt","content":"hi","queueMode":"followup"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Prompt {
                content,
                queue_mode,
                ..
            } => {
                assert_eq!(content, "hi");
                assert_eq!(queue_mode, QueueMode::Followup);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn queue_mode_defaults_to_followup() {
        let raw = r#"{"type":"prompt","content":"hi"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Prompt {
                queue_mode: QueueMode::Followup,
                ..
            }
        ));
    }

    #[test]
    fn dotted_frame_names_survive_round_trip() {
        let frame = ServerFrame::MessagesRemoved {
            message_ids: vec!["a".into()],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "messages.removed");
        assert_eq!(json["messageIds"][0], "a");

        let joined = ServerFrame::UserJoined {
            user: ConnectedUser {
                id: "u".into(),
                ..ConnectedUser::default()
            },
            users: vec![],
        };
        assert_eq!(
            serde_json::to_value(&joined).unwrap()["type"],
            "user.joined"
        );
    }

    #[test]
    fn runner_request_flattens_the_op() {
        let frame = RunnerFrame::Request {
            request_id: "r1".into(),
            op: RunnerOp::SpawnChild {
                workspace: Some("repo".into()),
                prompt: None,
                persona_id: None,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["requestId"], "r1");
        assert_eq!(json["op"], "spawn-child");
        assert_eq!(json["workspace"], "repo");

        let back: RunnerFrame = serde_json::from_value(json).unwrap();
        assert!(matches!(
            back,
            RunnerFrame::Request {
                op: RunnerOp::SpawnChild { .. },
                ..
            }
        ));
    }

    #[test]
    fn op_deadlines_match_the_contract() {
        assert_eq!(
            op_deadline(RunnerOp::MemoryList.class()),
            Duration::from_secs(15)
        );
        assert_eq!(
            op_deadline(
                RunnerOp::CreatePr {
                    title: "t".into(),
                    body: None,
                    branch: None,
                    base: None,
                }
                .class()
            ),
            Duration::from_secs(30)
        );
        assert_eq!(
            op_deadline(
                RunnerOp::SpawnChild {
                    workspace: None,
                    prompt: None,
                    persona_id: None,
                }
                .class()
            ),
            Duration::from_secs(60)
        );
        assert_eq!(
            op_deadline(
                RunnerOp::TerminateChild {
                    session_id: "s".into(),
                }
                .class()
            ),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unknown_frame_type_is_a_parse_error() {
        // Receivers log and drop these rather than crashing.
        let raw = r#"{"type":"sticker","data":1}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
        assert!(serde_json::from_str::<RunnerFrame>(raw).is_err());
    }

    #[test]
    fn session_messages_view_is_narrow() {
        let view = SessionMessageView {
            role: "assistant".into(),
            content: "done".into(),
            created_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_value(&view).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3, "no authoring metadata may leak: {keys:?}");
    }
}
