//! Session registry: routes session ids to holder actors.
//!
//! Lives on the server layer. A plain map behind a mutex — it is only
//! touched for routing and lifecycle, never during prompt execution.
//! The registry is also the [`SessionDirectory`] holders use to spawn
//! children, terminate siblings and move messages across sessions.

use crate::actor::SessionActor;
use crate::messages::{EnqueuePrompt, GetStatus, RotateToken, Terminate};
use crate::services::{
    Catalog, ChannelSender, HolderServices, ImageStore, PrService, SessionDirectory, WorkflowApi,
};
use crate::store::session_repo::NewSession;
use crate::store::{SessionRecord, SessionStore};
use async_trait::async_trait;
use berth_core::config::PlatformConfig;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::{QueuedPrompt, SessionMessageView};
use berth_core::status::{AgentStatus, SessionPurpose, SessionStatus};
use kameo::actor::{ActorRef, Spawn};
use kameo::error::SendError;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Unwrap an `ask` result, surfacing handler errors with their type and
/// mapping transport failures to an internal error.
fn ask_err<M>(e: SendError<M, PlatformError>) -> PlatformError {
    match e {
        SendError::HandlerError(err) => err,
        _ => PlatformError::Internal("session actor unavailable".into()),
    }
}

/// Optional collaborators handed to every holder. Set once during
/// service wiring.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub workflow_api: Option<Arc<dyn WorkflowApi>>,
    pub pr: Option<Arc<dyn PrService>>,
    pub images: Option<Arc<dyn ImageStore>>,
    pub catalog: Option<Arc<dyn Catalog>>,
    pub channel_sender: Option<Arc<dyn ChannelSender>>,
}

pub struct SessionRegistry {
    store: SessionStore,
    config: Arc<PlatformConfig>,
    actors: Mutex<HashMap<String, ActorRef<SessionActor>>>,
    collaborators: parking_lot::RwLock<Collaborators>,
    self_ref: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(store: SessionStore, config: Arc<PlatformConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak| SessionRegistry {
            store,
            config,
            actors: Mutex::new(HashMap::new()),
            collaborators: parking_lot::RwLock::new(Collaborators::default()),
            self_ref: weak.clone(),
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> Arc<PlatformConfig> {
        self.config.clone()
    }

    pub fn set_collaborators(&self, collaborators: Collaborators) {
        *self.collaborators.write() = collaborators;
    }

    fn services(&self) -> PlatformResult<HolderServices> {
        let directory: Arc<dyn SessionDirectory> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| PlatformError::Internal("session registry dropped".into()))?;
        let collaborators = self.collaborators.read().clone();
        Ok(HolderServices {
            directory,
            workflow_api: collaborators.workflow_api,
            pr: collaborators.pr,
            images: collaborators.images,
            catalog: collaborators.catalog,
            channel_sender: collaborators.channel_sender,
        })
    }

    /// Create a session row, spawn its holder, and mint the first runner
    /// token. Returns the record and the token plaintext for the sandbox.
    pub async fn create_session(
        &self,
        new: NewSession,
    ) -> PlatformResult<(SessionRecord, String)> {
        let record = self.store.sessions.create(new).await?;
        let actor_ref = self.ensure_actor(&record.id).await?;
        let token = actor_ref.ask(RotateToken).await.map_err(ask_err)?;
        Ok((record, token))
    }

    /// Holder for a session, spawning (and replaying) it if needed.
    pub async fn ensure_actor(
        &self,
        session_id: &str,
    ) -> PlatformResult<ActorRef<SessionActor>> {
        if let Some(actor_ref) = self.actors.lock().await.get(session_id) {
            return Ok(actor_ref.clone());
        }

        let record = self.store.sessions.require(session_id).await?;
        let actor = SessionActor::load(
            record,
            self.store.clone(),
            self.config.clone(),
            self.services()?,
        )
        .await?;
        let actor_ref = SessionActor::spawn(actor);

        let mut actors = self.actors.lock().await;
        // Another caller may have raced us; keep the first.
        let entry = actors
            .entry(session_id.to_string())
            .or_insert_with(|| actor_ref.clone());
        Ok(entry.clone())
    }

    /// Holder if it is already running (no spawn).
    pub async fn get(&self, session_id: &str) -> Option<ActorRef<SessionActor>> {
        self.actors.lock().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<ActorRef<SessionActor>> {
        self.actors.lock().await.remove(session_id)
    }

    pub async fn active_count(&self) -> usize {
        self.actors.lock().await.len()
    }

    /// All live holder actors (for periodic sweeps).
    pub async fn live_actors(&self) -> Vec<ActorRef<SessionActor>> {
        self.actors.lock().await.values().cloned().collect()
    }

    /// The user's orchestrator session, created on first use.
    pub async fn orchestrator_session(&self, user_id: &str) -> PlatformResult<SessionRecord> {
        if let Some(record) = self.store.sessions.find_orchestrator(user_id).await? {
            return Ok(record);
        }
        let (record, _token) = self
            .create_session(NewSession {
                owner_id: user_id.to_string(),
                workspace: String::new(),
                purpose: SessionPurpose::Orchestrator,
                parent_id: None,
                persona_id: None,
            })
            .await?;
        Ok(record)
    }

    /// Current lifecycle/agent status of a session, asking the live
    /// holder when there is one and falling back to the store.
    pub async fn session_status(
        &self,
        session_id: &str,
    ) -> PlatformResult<(SessionStatus, AgentStatus)> {
        if let Some(actor_ref) = self.get(session_id).await {
            if let Ok(status) = actor_ref.ask(GetStatus).await {
                return Ok(status);
            }
        }
        let record = self.store.sessions.require(session_id).await?;
        Ok((record.status, AgentStatus::Idle))
    }

    async fn owned_session(
        &self,
        requester_id: &str,
        session_id: &str,
    ) -> PlatformResult<SessionRecord> {
        let record = self.store.sessions.require(session_id).await?;
        if record.owner_id != requester_id {
            // Cross-user access reads as absence, not forbiddenness.
            return Err(PlatformError::not_found("session", session_id));
        }
        Ok(record)
    }
}

#[async_trait]
impl SessionDirectory for SessionRegistry {
    async fn spawn_child(
        &self,
        owner_id: &str,
        parent_id: &str,
        workspace: Option<String>,
        prompt: Option<String>,
        persona_id: Option<String>,
    ) -> PlatformResult<String> {
        let parent = self.owned_session(owner_id, parent_id).await?;
        let (child, _token) = self
            .create_session(NewSession {
                owner_id: owner_id.to_string(),
                workspace: workspace.unwrap_or_else(|| parent.workspace.clone()),
                purpose: SessionPurpose::Interactive,
                parent_id: Some(parent_id.to_string()),
                persona_id,
            })
            .await?;
        if let Some(content) = prompt {
            let actor_ref = self.ensure_actor(&child.id).await?;
            actor_ref
                .ask(EnqueuePrompt {
                    prompt: QueuedPrompt::text(content, Default::default()),
                })
                .await
                .map_err(ask_err)?;
        }
        Ok(child.id)
    }

    async fn terminate_session(
        &self,
        requester_id: &str,
        session_id: &str,
    ) -> PlatformResult<()> {
        self.owned_session(requester_id, session_id).await?;
        let actor_ref = self.ensure_actor(session_id).await?;
        actor_ref.ask(Terminate).await.map_err(ask_err)
    }

    async fn post_prompt(
        &self,
        requester_id: &str,
        session_id: &str,
        prompt: QueuedPrompt,
    ) -> PlatformResult<()> {
        self.owned_session(requester_id, session_id).await?;
        let actor_ref = self.ensure_actor(session_id).await?;
        actor_ref
            .ask(EnqueuePrompt { prompt })
            .await
            .map_err(ask_err)
    }

    async fn read_messages(
        &self,
        requester_id: &str,
        session_id: &str,
        limit: Option<u32>,
    ) -> PlatformResult<Vec<SessionMessageView>> {
        self.owned_session(requester_id, session_id).await?;
        let messages = self
            .store
            .messages
            .list_tail(session_id, limit.unwrap_or(50))
            .await?;
        Ok(messages
            .into_iter()
            .map(|msg| SessionMessageView {
                role: match msg.role {
                    berth_core::message::Role::User => "user",
                    berth_core::message::Role::Assistant => "assistant",
                    berth_core::message::Role::System => "system",
                    berth_core::message::Role::Tool => "tool",
                }
                .to_string(),
                content: msg.content,
                created_at: msg.created_at,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        let store = SessionStore::open_in_memory().unwrap();
        SessionRegistry::new(store, Arc::new(PlatformConfig::default()))
    }

    fn interactive(owner: &str) -> NewSession {
        NewSession {
            owner_id: owner.into(),
            workspace: "repo".into(),
            purpose: SessionPurpose::Interactive,
            parent_id: None,
            persona_id: None,
        }
    }

    #[tokio::test]
    async fn create_session_mints_a_verifiable_token() {
        let registry = registry();
        let (record, token) = registry.create_session(interactive("u1")).await.unwrap();
        assert_eq!(token.len(), 64);
        let stored = registry.store().sessions.require(&record.id).await.unwrap();
        assert!(crate::token::verify_token(
            &token,
            stored.runner_token_hash.as_deref()
        ));
    }

    #[tokio::test]
    async fn ensure_actor_reuses_the_same_holder() {
        let registry = registry();
        let (record, _) = registry.create_session(interactive("u1")).await.unwrap();
        assert_eq!(registry.active_count().await, 1);
        registry.ensure_actor(&record.id).await.unwrap();
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn orchestrator_session_is_created_once() {
        let registry = registry();
        let first = registry.orchestrator_session("u1").await.unwrap();
        let second = registry.orchestrator_session("u1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.purpose, SessionPurpose::Orchestrator);
    }

    #[tokio::test]
    async fn spawn_child_links_parent_and_queues_prompt() {
        let registry = registry();
        let (parent, _) = registry.create_session(interactive("u1")).await.unwrap();
        let child_id = registry
            .spawn_child("u1", &parent.id, None, Some("do the thing".into()), None)
            .await
            .unwrap();

        let child = registry.store().sessions.require(&child_id).await.unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));

        // The prompt landed in the child's journal and queue.
        let messages = registry.store().messages.list(&child_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "do the thing");
        let queued = registry.store().extras.queue_list(&child_id).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn cross_user_access_reads_as_not_found() {
        let registry = registry();
        let (record, _) = registry.create_session(interactive("u1")).await.unwrap();
        let err = registry
            .post_prompt("u2", &record.id, QueuedPrompt::text("hi", Default::default()))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let registry = registry();
        let (record, _) = registry.create_session(interactive("u1")).await.unwrap();
        registry.terminate_session("u1", &record.id).await.unwrap();
        registry.terminate_session("u1", &record.id).await.unwrap();
        let (status, agent) = registry.session_status(&record.id).await.unwrap();
        assert_eq!(status, SessionStatus::Terminated);
        assert_eq!(agent, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn read_messages_uses_the_narrow_surface() {
        let registry = registry();
        let (record, _) = registry.create_session(interactive("u1")).await.unwrap();
        registry
            .post_prompt(
                "u1",
                &record.id,
                QueuedPrompt::text("hello", Default::default()),
            )
            .await
            .unwrap();

        let views = registry.read_messages("u1", &record.id, None).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].role, "user");
        assert_eq!(views[0].content, "hello");
    }
}
