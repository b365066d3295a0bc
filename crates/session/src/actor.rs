//! The session state holder: one single-writer actor per session.
//!
//! Every mutation of a session's state arrives as an actor message, so
//! ordering is defined by inbox order and nothing interleaves. Store
//! writes are awaited inline; runner round-trips that must not block the
//! inbox (graceful terminate, runner-requested platform ops) run in
//! detached tasks that message the actor back.

use crate::messages::*;
use crate::queue::{EnqueueOutcome, PromptQueue};
use crate::questions::QuestionBoard;
use crate::replay::scan_child_sessions;
use crate::runner_ops;
use crate::services::HolderServices;
use crate::sockets::{RunnerSocket, SocketHub};
use crate::store::{SessionRecord, SessionStore};
use crate::token::{verify_token, RunnerToken};
use berth_core::config::PlatformConfig;
use berth_core::correlation::PendingMap;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::journal::Journal;
use berth_core::message::{Author, Message as JournalMessage, MessageFormat, MessagePatch, Role};
use berth_core::protocol::{
    op_deadline, AuditEntry, ClientFrame, DiffFile, HolderFrame, HolderOp, InitSnapshot, OpClass,
    QueuedPrompt, RunnerFrame, ServerFrame, SessionEvent, SUPERSEDED_REASON,
};
use berth_core::status::{effective_agent_status, AgentStatus, SessionStatus};
use kameo::message::{Context, Message};
use kameo::Actor;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use uuid::Uuid;

/// Close reason used when the holder rotates the runner token out from
/// under a connected runner.
const ROTATED_REASON: &str = "Runner token rotated";

#[derive(Actor)]
pub struct SessionActor {
    record: SessionRecord,
    journal: Journal,
    queue: PromptQueue,
    questions: QuestionBoard,
    hub: SocketHub,
    /// Holder-issued correlated requests to the runner.
    pending: PendingMap,
    store: SessionStore,
    config: Arc<PlatformConfig>,
    services: HolderServices,
    agent_status: AgentStatus,
    /// Set between a steer abort and the runner's idle acknowledgement.
    awaiting_steer: bool,
    review_loading: bool,
    diff_files: Vec<DiffFile>,
    /// Bounded in-memory audit log, reseeded from the store on init.
    audit: VecDeque<AuditEntry>,
    child_sessions: Vec<String>,
    /// `(channelType, channelId)` of the channel currently receiving a
    /// stream, for per-channel telemetry fan-out.
    streaming_channel: Option<(String, String)>,
    /// Admin signals accepted while no runner was attached; flushed on
    /// the next runner connect.
    pending_signals: Vec<HolderFrame>,
}

impl SessionActor {
    /// Rebuild a holder from the store: journal replay, audit reseed,
    /// queued prompts (including any that were in flight when the
    /// previous holder died).
    pub async fn load(
        record: SessionRecord,
        store: SessionStore,
        config: Arc<PlatformConfig>,
        services: HolderServices,
    ) -> PlatformResult<Self> {
        let rows = store.messages.list(&record.id).await?;
        let child_sessions = scan_child_sessions(&rows);
        let journal = Journal::replay(rows);
        let audit_rows = store
            .audit
            .recent(&record.id, config.audit_log_capacity)
            .await?;

        let mut queue = PromptQueue::new();
        for (row_id, prompt) in store.extras.queue_list(&record.id).await? {
            queue.restore(prompt, row_id);
        }

        let agent_status = if queue.is_empty() {
            AgentStatus::Idle
        } else {
            AgentStatus::Queued
        };

        Ok(SessionActor {
            record,
            journal,
            queue,
            questions: QuestionBoard::new(),
            hub: SocketHub::new(),
            pending: PendingMap::new(),
            store,
            config,
            services,
            agent_status,
            awaiting_steer: false,
            review_loading: false,
            diff_files: Vec::new(),
            audit: audit_rows.into(),
            child_sessions,
            streaming_channel: None,
            pending_signals: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.record.id
    }

    // ── Fan-out helpers ──────────────────────────────────────────────────

    fn broadcast(&self, frame: &ServerFrame) {
        self.hub.broadcast(frame);
    }

    fn broadcast_status(&self) {
        self.broadcast(&ServerFrame::Status {
            status: self.record.status,
            event: None,
        });
    }

    fn broadcast_agent_status(&self) {
        let status = effective_agent_status(self.record.status, self.agent_status);
        let (channel_type, channel_id) = match &self.streaming_channel {
            Some((ct, cid)) => (Some(ct.clone()), Some(cid.clone())),
            None => (None, None),
        };
        let frame = ServerFrame::AgentStatus {
            status,
            channel_type: channel_type.clone(),
            channel_id: channel_id.clone(),
        };
        self.broadcast(&frame);
        if let (Some(ct), Some(cid)) = (channel_type, channel_id) {
            self.hub.send_to_channel(&ct, &cid, &frame);
        }
    }

    fn set_agent_status(&mut self, status: AgentStatus) {
        if self.agent_status != status {
            self.agent_status = status;
            if status != AgentStatus::Streaming {
                self.streaming_channel = None;
            }
            self.broadcast_agent_status();
        }
    }

    async fn set_session_status(&mut self, next: SessionStatus) {
        if self.record.status == next {
            return;
        }
        if !self.record.status.can_transition_to(next) {
            log::warn!(
                "session {}: refusing status transition {} -> {}",
                self.record.id,
                self.record.status,
                next
            );
            return;
        }
        self.record.status = next;
        if let Err(e) = self.store.sessions.set_status(&self.record.id, next).await {
            log::error!("session {}: persisting status failed: {e}", self.record.id);
        }
        if next.is_terminal() {
            self.journal.clear_stream();
            self.streaming_channel = None;
            self.agent_status = effective_agent_status(next, self.agent_status);
        }
        self.broadcast_status();
        self.broadcast_agent_status();
        self.push_audit("status", Some(next.as_str().to_string()), None).await;
    }

    async fn push_audit(&mut self, kind: &str, detail: Option<String>, actor: Option<String>) {
        let entry = AuditEntry {
            at: OffsetDateTime::now_utc(),
            kind: kind.to_string(),
            detail,
            actor,
        };
        if let Err(e) = self.store.audit.append(&self.record.id, &entry).await {
            log::warn!("session {}: audit append failed: {e}", self.record.id);
        }
        self.audit.push_back(entry);
        while self.audit.len() > self.config.audit_log_capacity {
            self.audit.pop_front();
        }
    }

    fn snapshot(&self) -> InitSnapshot {
        InitSnapshot {
            session: self.record.view(),
            messages: self.journal.list().to_vec(),
            status: self.record.status,
            agent_status: effective_agent_status(self.record.status, self.agent_status),
            queued_prompts: self.queue.len() + usize::from(self.queue.has_in_flight()),
            pending_questions: self.questions.list(),
            users: self.hub.roster(),
            audit_log: self.audit.iter().cloned().collect(),
        }
    }

    // ── Prompt pipeline ──────────────────────────────────────────────────

    /// Append the user message, queue the prompt under its mode, and
    /// dispatch if the runner is free.
    async fn accept_prompt(&mut self, prompt: QueuedPrompt) -> PlatformResult<()> {
        if !self.record.status.accepts_prompts() {
            return Err(PlatformError::Conflict(format!(
                "session {} is {}",
                self.record.id, self.record.status
            )));
        }

        let mut user_msg = JournalMessage::new(Role::User, prompt.content.clone());
        user_msg.author = prompt.author.clone();
        user_msg.channel_type = prompt.channel_type.clone();
        user_msg.channel_id = prompt.channel_id.clone();
        let msg = self.journal.append(user_msg)?.clone();
        let first_message = self.journal.len() == 1;
        self.store.messages.insert(&self.record.id, &msg).await?;
        self.broadcast(&ServerFrame::Message { message: msg });

        // The first prompt names the session until something better
        // (a generated title) replaces it.
        if first_message {
            let title: String = prompt.content.chars().take(80).collect();
            self.broadcast(&ServerFrame::Title { title });
        }

        if let Err(e) = self.store.sessions.touch(&self.record.id).await {
            log::warn!("session {}: touch failed: {e}", self.record.id);
        }

        let debounce = self.debounce_for(&prompt).await;
        let scope = prompt.scope_key.clone();
        let outcome = self.queue.enqueue(prompt, debounce, Instant::now());
        match outcome {
            EnqueueOutcome::Coalesced => {
                if let Some(scope) = scope.as_deref() {
                    if let Some((fused, Some(row_id))) = self
                        .queue
                        .queued_for_scope(scope)
                        .map(|(p, row)| (p.clone(), row))
                    {
                        self.store.extras.queue_update(row_id, &fused).await?;
                    }
                }
            }
            EnqueueOutcome::Queued { .. } => {
                self.persist_tail_prompt().await?;
                if !self.hub.has_runner() {
                    self.set_agent_status(AgentStatus::Queued);
                }
                self.try_dispatch();
            }
            EnqueueOutcome::SteerQueued => {
                self.persist_tail_prompt().await?;
                if self.queue.has_in_flight() {
                    self.hub.send_runner(&HolderFrame::Abort);
                    self.journal.clear_stream();
                    if let Some(row_id) = self.queue.abort_in_flight() {
                        let _ = self.store.extras.queue_remove(row_id).await;
                    }
                    self.awaiting_steer = true;
                } else {
                    self.try_dispatch();
                }
            }
        }
        self.push_audit("prompt", None, None).await;
        Ok(())
    }

    /// Persist the prompt that `enqueue` just appended and remember its
    /// row id for deletion when it finishes.
    async fn persist_tail_prompt(&mut self) -> PlatformResult<()> {
        if let Some(prompt) = self.queue.newest_unpersisted() {
            let row_id = self
                .store
                .extras
                .queue_push(&self.record.id, &prompt)
                .await?;
            self.queue.set_last_row_id(row_id);
        }
        Ok(())
    }

    async fn debounce_for(&self, prompt: &QueuedPrompt) -> Duration {
        let default = Duration::from_millis(self.config.queue.collect_debounce_ms);
        let Some(scope) = prompt.scope_key.as_deref() else {
            return default;
        };
        let Ok((user, parts)) = berth_core::scope::ScopeKey::parse(scope) else {
            return default;
        };
        let key = berth_core::scope::ScopeKey::from_parts(&user, &parts);
        match self.store.bindings.get(&key).await {
            Ok(Some(binding)) => Duration::from_millis(binding.collect_debounce_ms),
            _ => default,
        }
    }

    fn try_dispatch(&mut self) {
        if !self.hub.has_runner() {
            if !self.queue.is_empty() {
                self.set_agent_status(AgentStatus::Queued);
            }
            return;
        }
        if self.awaiting_steer || self.queue.has_in_flight() {
            return;
        }
        let Some(prompt) = self.queue.next_ready().cloned() else {
            return;
        };
        if !self.hub.send_runner(&HolderFrame::Prompt { prompt }) {
            log::error!(
                "session {}: runner send failed during dispatch",
                self.record.id
            );
        }
    }

    // ── Runner turn results ──────────────────────────────────────────────

    async fn handle_stream_chunk(&mut self, delta: String) {
        if self.agent_status != AgentStatus::Streaming {
            self.streaming_channel = self
                .queue
                .in_flight()
                .and_then(|p| match (&p.channel_type, &p.channel_id) {
                    (Some(ct), Some(cid)) => Some((ct.clone(), cid.clone())),
                    _ => None,
                });
            self.agent_status = AgentStatus::Streaming;
            self.broadcast_agent_status();
        }
        let message_id = self.journal.append_chunk(MessageFormat::V2, &delta);
        self.broadcast(&ServerFrame::Chunk { message_id, delta });
    }

    async fn handle_turn_result(&mut self, message: JournalMessage) {
        let streaming_id = self.journal.streaming_message_id().map(|s| s.to_string());
        self.journal.finalize_stream();

        let final_msg = match streaming_id {
            Some(id) => {
                // Merge the runner's final message into the accumulated
                // one; content-wins already ran its course, and the
                // stream is finalized so the longer final body applies.
                self.journal.update(
                    &id,
                    MessagePatch {
                        content: Some(message.content.clone()),
                        parts: message.parts.clone(),
                    },
                );
                match self.journal.get(&id) {
                    Some(msg) => msg.clone(),
                    None => message,
                }
            }
            None => match self.journal.append(message.clone()) {
                Ok(msg) => msg.clone(),
                Err(_) => {
                    // Duplicate id: treat as an update.
                    self.journal.update(
                        &message.id,
                        MessagePatch {
                            content: Some(message.content.clone()),
                            parts: message.parts.clone(),
                        },
                    );
                    message
                }
            },
        };

        if let Err(e) = self.store.messages.insert(&self.record.id, &final_msg).await {
            log::error!("session {}: persisting result failed: {e}", self.record.id);
        }
        self.broadcast(&ServerFrame::Message { message: final_msg });

        if let Some(row_id) = self.queue.finish_in_flight() {
            let _ = self.store.extras.queue_remove(row_id).await;
        }
        self.set_agent_status(AgentStatus::Idle);
        self.try_dispatch();
    }

    async fn handle_runner_error(&mut self, text: String) {
        self.broadcast(&ServerFrame::Error {
            message: text.clone(),
        });
        let system = JournalMessage::new(Role::System, format!("Error: {text}"));
        if let Ok(msg) = self.journal.append(system).map(|m| m.clone()) {
            if let Err(e) = self.store.messages.insert(&self.record.id, &msg).await {
                log::warn!("session {}: persisting error message failed: {e}", self.record.id);
            }
            self.broadcast(&ServerFrame::Message { message: msg });
        }
        self.set_agent_status(AgentStatus::Error);
    }

    // ── Client frames ────────────────────────────────────────────────────

    async fn handle_client_frame(&mut self, conn_id: String, frame: ClientFrame) {
        match frame {
            ClientFrame::Prompt {
                content,
                model,
                attachments,
                queue_mode,
                channel_type,
                channel_id,
            } => {
                let author = self.author_for(&conn_id);
                let prompt = QueuedPrompt {
                    content,
                    model,
                    author,
                    model_preferences: None,
                    attachments,
                    channel_type,
                    channel_id,
                    queue_mode,
                    scope_key: None,
                };
                if let Err(e) = self.accept_prompt(prompt).await {
                    self.hub.send_to_client(
                        &conn_id,
                        &ServerFrame::Error {
                            message: e.to_string(),
                        },
                    );
                }
            }
            ClientFrame::Abort { .. } => {
                self.hub.send_runner(&HolderFrame::Abort);
                self.journal.clear_stream();
                if let Some(row_id) = self.queue.abort_in_flight() {
                    let _ = self.store.extras.queue_remove(row_id).await;
                }
                self.awaiting_steer = false;
                self.set_agent_status(AgentStatus::Idle);
                self.push_audit("abort", None, Some(conn_id)).await;
            }
            ClientFrame::Revert { message_id } => {
                let removed = self.journal.remove_from(&message_id);
                if removed.is_empty() {
                    self.hub.send_to_client(
                        &conn_id,
                        &ServerFrame::Error {
                            message: format!("message not found: {message_id}"),
                        },
                    );
                    return;
                }
                if let Err(e) = self.store.messages.remove(&self.record.id, &removed).await {
                    log::error!("session {}: revert persist failed: {e}", self.record.id);
                }
                self.hub.send_runner(&HolderFrame::Revert {
                    message_id: message_id.clone(),
                });
                self.broadcast(&ServerFrame::MessagesRemoved {
                    message_ids: removed,
                });
                self.push_audit("revert", Some(message_id), Some(conn_id)).await;
            }
            ClientFrame::Answer {
                question_id,
                answer,
            } => {
                self.resolve_question(&question_id, &answer).await;
            }
            ClientFrame::Diff => {
                if !self.hub.send_runner(&HolderFrame::Diff) && !self.diff_files.is_empty() {
                    // No runner: serve the cached diff.
                    self.hub.send_to_client(
                        &conn_id,
                        &ServerFrame::Diff {
                            files: self.diff_files.clone(),
                        },
                    );
                }
            }
            ClientFrame::Review => {
                self.review_loading = true;
                if !self.hub.send_runner(&HolderFrame::Review) {
                    self.review_loading = false;
                    self.hub.send_to_client(
                        &conn_id,
                        &ServerFrame::ReviewResult {
                            data: None,
                            error: Some("no runner attached".into()),
                        },
                    );
                }
            }
            ClientFrame::Ping => {
                self.hub.send_to_client(&conn_id, &ServerFrame::Pong);
            }
            ClientFrame::Command { command, .. } => {
                self.handle_command(&conn_id, &command).await;
            }
        }
    }

    fn author_for(&self, conn_id: &str) -> Option<Author> {
        self.hub.client_user(conn_id).map(|user| Author {
            id: Some(user.id.clone()),
            email: user.email.clone(),
            name: user.name.clone(),
            avatar: user.avatar.clone(),
        })
    }

    async fn resolve_question(&mut self, question_id: &str, answer: &str) {
        match self.questions.answer(question_id) {
            Some(_) => {
                self.hub.send_runner(&HolderFrame::Answer {
                    question_id: question_id.to_string(),
                    answer: answer.to_string(),
                });
                self.broadcast(&ServerFrame::Status {
                    status: self.record.status,
                    event: Some(SessionEvent::QuestionAnswered {
                        question_id: question_id.to_string(),
                    }),
                });
                self.push_audit("question.answered", Some(question_id.to_string()), None)
                    .await;
            }
            None => {
                log::debug!(
                    "session {}: answer for unknown question {question_id}",
                    self.record.id
                );
            }
        }
    }

    async fn handle_command(&mut self, conn_id: &str, command: &str) {
        match command.trim() {
            "status" => {
                let output = serde_json::json!({
                    "status": self.record.status,
                    "agentStatus": effective_agent_status(self.record.status, self.agent_status),
                    "queuedPrompts": self.queue.len(),
                    "pendingQuestions": self.questions.len(),
                    "childSessions": self.child_sessions,
                    "reviewLoading": self.review_loading,
                });
                self.hub.send_to_client(
                    conn_id,
                    &ServerFrame::CommandResult {
                        command: "status".into(),
                        output: Some(output),
                    },
                );
            }
            "audit" => {
                self.hub.send_to_client(
                    conn_id,
                    &ServerFrame::AuditLog {
                        entries: self.audit.iter().cloned().collect(),
                    },
                );
            }
            other => {
                self.hub.send_to_client(
                    conn_id,
                    &ServerFrame::Toast {
                        level: "warn".into(),
                        message: format!("unknown command: {other}"),
                    },
                );
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Socket lifecycle handlers
// ══════════════════════════════════════════════════════════════════════════

impl Message<ClientConnect> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ClientConnect, _ctx: &mut Context<Self, Self::Reply>) {
        // Connect-time expiry check, before the snapshot is assembled.
        let expired = self.questions.sweep_expired(OffsetDateTime::now_utc());
        for question in expired {
            self.broadcast(&ServerFrame::Status {
                status: self.record.status,
                event: Some(SessionEvent::QuestionExpired {
                    question_id: question.question_id,
                }),
            });
        }

        self.hub.add_client(msg.conn_id.clone(), msg.user.clone(), msg.tx);
        self.hub.send_to_client(
            &msg.conn_id,
            &ServerFrame::Init {
                snapshot: self.snapshot(),
            },
        );
        self.broadcast(&ServerFrame::UserJoined {
            user: msg.user,
            users: self.hub.roster(),
        });
    }
}

impl Message<ClientDisconnect> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ClientDisconnect, _ctx: &mut Context<Self, Self::Reply>) {
        if let Some(client) = self.hub.remove_client(&msg.conn_id) {
            self.broadcast(&ServerFrame::UserLeft {
                user_id: client.user.id,
                users: self.hub.roster(),
            });
        }
    }
}

impl Message<RunnerConnect> for SessionActor {
    type Reply = Result<(), PlatformError>;

    async fn handle(
        &mut self,
        msg: RunnerConnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if !verify_token(&msg.token, self.record.runner_token_hash.as_deref()) {
            self.push_audit("runner.rejected", None, None).await;
            return Err(PlatformError::Unauthorized(
                "invalid runner token".to_string(),
            ));
        }

        if let Some(replaced) = self
            .hub
            .attach_runner(RunnerSocket::new(msg.conn_id.clone(), msg.tx))
        {
            log::info!(
                "session {}: runner {} superseded by {}",
                self.record.id,
                replaced.conn_id,
                msg.conn_id
            );
            replaced.close(1000, SUPERSEDED_REASON);
            self.pending
                .fail_all(PlatformError::Fatal("runner superseded".into()));
            // The replacement never saw the in-flight prompt; hand it
            // back to the head of the queue.
            self.journal.clear_stream();
            self.queue.requeue_in_flight();
            self.awaiting_steer = false;
        }

        self.push_audit("runner.connected", Some(msg.conn_id), None).await;
        match self.record.status {
            SessionStatus::Initializing | SessionStatus::Restoring | SessionStatus::Error => {
                self.set_session_status(SessionStatus::Running).await;
            }
            _ => {}
        }
        self.try_dispatch();
        for frame in std::mem::take(&mut self.pending_signals) {
            self.hub.send_runner(&frame);
        }
        Ok(())
    }
}

impl Message<RunnerDisconnect> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: RunnerDisconnect, _ctx: &mut Context<Self, Self::Reply>) {
        if self.hub.detach_runner(&msg.conn_id).is_none() {
            // A superseded socket closing after replacement.
            return;
        }
        self.pending
            .fail_all(PlatformError::Fatal("runner disconnected".into()));
        self.journal.clear_stream();
        self.awaiting_steer = false;
        // No automatic retry of the in-flight prompt.
        if let Some(row_id) = self.queue.abort_in_flight() {
            let _ = self.store.extras.queue_remove(row_id).await;
        }

        if self.record.status.is_terminal() {
            return;
        }
        if msg.clean {
            self.set_session_status(SessionStatus::Idle).await;
            self.set_agent_status(if self.queue.is_empty() {
                AgentStatus::Idle
            } else {
                AgentStatus::Queued
            });
        } else {
            log::warn!(
                "session {}: runner dropped: {}",
                self.record.id,
                msg.reason.as_deref().unwrap_or("unknown")
            );
            self.set_session_status(SessionStatus::Error).await;
        }
    }
}

impl Message<ChannelConnect> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ChannelConnect, _ctx: &mut Context<Self, Self::Reply>) {
        self.hub.add_channel(
            msg.conn_id,
            msg.scope_key,
            msg.channel_type,
            msg.channel_id,
            msg.tx,
        );
    }
}

impl Message<ChannelDisconnect> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ChannelDisconnect, _ctx: &mut Context<Self, Self::Reply>) {
        self.hub.remove_channel(&msg.conn_id);
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Traffic handlers
// ══════════════════════════════════════════════════════════════════════════

impl Message<ClientInput> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ClientInput, _ctx: &mut Context<Self, Self::Reply>) {
        self.handle_client_frame(msg.conn_id, msg.frame).await;
    }
}

impl Message<EnqueuePrompt> for SessionActor {
    type Reply = Result<(), PlatformError>;

    async fn handle(
        &mut self,
        msg: EnqueuePrompt,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.accept_prompt(msg.prompt).await
    }
}

impl Message<RunnerInput> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: RunnerInput, ctx: &mut Context<Self, Self::Reply>) {
        match msg.frame {
            RunnerFrame::Stream { delta } => self.handle_stream_chunk(delta).await,
            RunnerFrame::Result { message } => self.handle_turn_result(message).await,
            RunnerFrame::Tool { message_id, patch } => {
                match message_id {
                    Some(id) => {
                        if let Some(updated) = self.journal.update(&id, patch).map(|m| m.clone()) {
                            if let Err(e) =
                                self.store.messages.update(&self.record.id, &updated).await
                            {
                                log::warn!("session {}: tool update persist failed: {e}", self.record.id);
                            }
                            self.broadcast(&ServerFrame::MessageUpdated { message: updated });
                        }
                    }
                    None => {
                        let mut tool_msg = JournalMessage::new(
                            Role::Tool,
                            patch.content.clone().unwrap_or_default(),
                        );
                        if let Some(parts) = patch.parts {
                            tool_msg = tool_msg.with_parts(parts);
                        }
                        if let Ok(appended) = self.journal.append(tool_msg).map(|m| m.clone()) {
                            if let Err(e) =
                                self.store.messages.insert(&self.record.id, &appended).await
                            {
                                log::warn!("session {}: tool insert persist failed: {e}", self.record.id);
                            }
                            self.broadcast(&ServerFrame::Message { message: appended });
                        }
                    }
                }
                if self.agent_status != AgentStatus::ToolCalling {
                    self.set_agent_status(AgentStatus::ToolCalling);
                }
            }
            RunnerFrame::Question { question } => {
                self.questions.ask(question.clone());
                self.broadcast(&ServerFrame::Question { question });
            }
            RunnerFrame::AgentStatus { status } => {
                self.set_agent_status(status);
                if status == AgentStatus::Idle {
                    self.awaiting_steer = false;
                    self.try_dispatch();
                }
            }
            RunnerFrame::Diff { files } => {
                let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
                if let Err(e) = self
                    .store
                    .extras
                    .set_files_changed(&self.record.id, &paths)
                    .await
                {
                    log::warn!("session {}: files-changed persist failed: {e}", self.record.id);
                }
                self.diff_files = files.clone();
                self.broadcast(&ServerFrame::Diff { files });
                self.broadcast(&ServerFrame::FilesChanged { files: paths });
            }
            RunnerFrame::ReviewResult { data, error } => {
                self.review_loading = false;
                self.broadcast(&ServerFrame::ReviewResult { data, error });
            }
            RunnerFrame::Models { models } => {
                self.broadcast(&ServerFrame::Models { models });
            }
            RunnerFrame::Error { message } => {
                self.handle_runner_error(message).await;
            }
            RunnerFrame::Request { request_id, op } => {
                let Some(runner_tx) = self.hub.runner_tx() else {
                    return;
                };
                runner_ops::spawn_resolve(
                    ctx.actor_ref().clone(),
                    runner_ops::OpContext {
                        session_id: self.record.id.clone(),
                        owner_id: self.record.owner_id.clone(),
                        store: self.store.clone(),
                        services: self.services.clone(),
                        runner_tx,
                    },
                    request_id,
                    op,
                );
            }
            RunnerFrame::Response {
                request_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(message) => Err(PlatformError::Internal(message)),
                    None => Ok(result.unwrap_or(serde_json::Value::Null)),
                };
                if !self.pending.resolve(&request_id, outcome) {
                    log::debug!(
                        "session {}: late response for {request_id} dropped",
                        self.record.id
                    );
                }
            }
            RunnerFrame::Ping => {
                self.hub.send_runner(&HolderFrame::Pong);
            }
            RunnerFrame::Pong => {}
        }
    }
}

impl Message<AdminSignal> for SessionActor {
    type Reply = Result<(), PlatformError>;

    async fn handle(
        &mut self,
        msg: AdminSignal,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if !self.record.status.accepts_prompts() {
            return Err(PlatformError::Conflict(format!(
                "session {} is {}",
                self.record.id, self.record.status
            )));
        }
        if !self.hub.send_runner(&msg.frame) {
            // Held until the sandbox runner attaches.
            self.pending_signals.push(msg.frame);
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  Lifecycle handlers
// ══════════════════════════════════════════════════════════════════════════

impl Message<RotateToken> for SessionActor {
    type Reply = Result<String, PlatformError>;

    async fn handle(
        &mut self,
        _msg: RotateToken,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let token = RunnerToken::mint();
        self.store
            .sessions
            .set_runner_token_hash(&self.record.id, &token.hash)
            .await?;
        self.record.runner_token_hash = Some(token.hash.clone());

        // Rotation invalidates every prior socket, not just future
        // upgrades.
        if let Some(runner) = self.hub.detach_runner_any() {
            runner.close(berth_core::protocol::CLOSE_AUTH_REJECTED, ROTATED_REASON);
            self.pending
                .fail_all(PlatformError::Fatal("runner token rotated".into()));
        }
        self.push_audit("runner.token_rotated", None, None).await;
        Ok(token.plaintext)
    }
}

impl Message<GetStatus> for SessionActor {
    type Reply = Result<(SessionStatus, AgentStatus), kameo::error::Infallible>;

    async fn handle(
        &mut self,
        _msg: GetStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok((
            self.record.status,
            effective_agent_status(self.record.status, self.agent_status),
        ))
    }
}

impl Message<SetStatus> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: SetStatus, _ctx: &mut Context<Self, Self::Reply>) {
        self.set_session_status(msg.status).await;
    }
}

impl Message<SweepQuestions> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, _msg: SweepQuestions, _ctx: &mut Context<Self, Self::Reply>) {
        let expired = self.questions.sweep_expired(OffsetDateTime::now_utc());
        for question in expired {
            log::info!(
                "session {}: question {} expired",
                self.record.id,
                question.question_id
            );
            self.broadcast(&ServerFrame::Status {
                status: self.record.status,
                event: Some(SessionEvent::QuestionExpired {
                    question_id: question.question_id,
                }),
            });
        }
    }
}

impl Message<Terminate> for SessionActor {
    type Reply = Result<(), PlatformError>;

    async fn handle(
        &mut self,
        _msg: Terminate,
        ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.record.status.is_terminal() {
            return Ok(());
        }

        if self.hub.has_runner() {
            // Ask the runner to shut down; finalize on ack or deadline.
            // The wait happens off the inbox so the response frame can
            // still be delivered.
            let request_id = Uuid::new_v4().to_string();
            let rx = self.pending.register(
                &request_id,
                "terminate",
                op_deadline(OpClass::Terminate),
            );
            self.hub.send_runner(&HolderFrame::Request {
                request_id,
                op: HolderOp::Terminate,
            });
            let actor_ref = ctx.actor_ref().clone();
            tokio::spawn(async move {
                let _ = rx.await;
                let _ = actor_ref.tell(FinalizeTermination).await;
            });
        }
        self.set_session_status(SessionStatus::Terminated).await;
        Ok(())
    }
}

impl Message<FinalizeTermination> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, _msg: FinalizeTermination, _ctx: &mut Context<Self, Self::Reply>) {
        if let Some(runner) = self.hub.detach_runner_any() {
            runner.close(1000, "Session terminated");
        }
    }
}

impl Message<Broadcast> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: Broadcast, _ctx: &mut Context<Self, Self::Reply>) {
        self.broadcast(&msg.0);
    }
}

impl Message<ChildSpawned> for SessionActor {
    type Reply = ();

    async fn handle(&mut self, msg: ChildSpawned, _ctx: &mut Context<Self, Self::Reply>) {
        if !self.child_sessions.contains(&msg.session_id) {
            self.child_sessions.push(msg.session_id.clone());
        }
        self.broadcast(&ServerFrame::ChildSession {
            session_id: msg.session_id,
            event: "spawned".into(),
        });
    }
}
