//! Traits at the holder's seams.
//!
//! The holder resolves runner operations against the rest of the
//! platform through these interfaces: the session directory (spawn /
//! terminate / cross-session messaging), the workflow API, and the
//! contract-named external collaborators (PR provider, image store,
//! repo/persona catalog).

use async_trait::async_trait;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::{QueuedPrompt, SessionMessageView};
use serde_json::Value;
use std::sync::Arc;

/// Platform-side session operations the holder cannot perform alone.
/// Implemented by [`crate::registry::SessionRegistry`].
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Create a child session and return its id.
    async fn spawn_child(
        &self,
        owner_id: &str,
        parent_id: &str,
        workspace: Option<String>,
        prompt: Option<String>,
        persona_id: Option<String>,
    ) -> PlatformResult<String>;

    /// Gracefully terminate a session owned by the same user.
    async fn terminate_session(&self, requester_id: &str, session_id: &str) -> PlatformResult<()>;

    /// Post a prompt into another session owned by the same user.
    async fn post_prompt(
        &self,
        requester_id: &str,
        session_id: &str,
        prompt: QueuedPrompt,
    ) -> PlatformResult<()>;

    /// Read another session's messages through the narrow cross-session
    /// surface.
    async fn read_messages(
        &self,
        requester_id: &str,
        session_id: &str,
        limit: Option<u32>,
    ) -> PlatformResult<Vec<SessionMessageView>>;
}

/// Workflow/trigger/execution API exposed to runners. Implemented by the
/// dispatch crate.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    async fn call(&self, user_id: &str, action: &str, payload: Value) -> PlatformResult<Value>;
}

/// External pull-request provider (contract only; the concrete SDK is
/// out of scope).
#[async_trait]
pub trait PrService: Send + Sync {
    async fn create_pr(
        &self,
        session_id: &str,
        title: &str,
        body: Option<&str>,
        branch: Option<&str>,
        base: Option<&str>,
    ) -> PlatformResult<Value>;

    async fn update_pr(
        &self,
        session_id: &str,
        number: u64,
        title: Option<&str>,
        body: Option<&str>,
    ) -> PlatformResult<Value>;
}

/// External object store for screenshots and uploads (contract only).
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store a base64 payload; returns the public URL.
    async fn store(&self, data: &str, mime_type: Option<&str>) -> PlatformResult<String>;
}

/// Repo / persona catalog (contract only).
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_repos(&self, user_id: &str) -> PlatformResult<Value>;
    async fn list_personas(&self, user_id: &str) -> PlatformResult<Value>;
}

/// Outbound delivery on the channel a session is bound to. Implemented
/// by the service layer, which holds the adapter registry and per-user
/// channel credentials.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn reply(
        &self,
        session_id: &str,
        channel_type: Option<&str>,
        channel_id: Option<&str>,
        markdown: &str,
    ) -> PlatformResult<Value>;
}

/// Everything a holder needs from the rest of the platform. Optional
/// collaborators answer "unavailable" when absent.
#[derive(Clone)]
pub struct HolderServices {
    pub directory: Arc<dyn SessionDirectory>,
    pub workflow_api: Option<Arc<dyn WorkflowApi>>,
    pub pr: Option<Arc<dyn PrService>>,
    pub images: Option<Arc<dyn ImageStore>>,
    pub catalog: Option<Arc<dyn Catalog>>,
    pub channel_sender: Option<Arc<dyn ChannelSender>>,
}

impl HolderServices {
    pub fn new(directory: Arc<dyn SessionDirectory>) -> Self {
        HolderServices {
            directory,
            workflow_api: None,
            pr: None,
            images: None,
            catalog: None,
            channel_sender: None,
        }
    }

    pub fn unavailable(what: &str) -> PlatformError {
        PlatformError::Validation(format!("{what} is not configured on this deployment"))
    }
}
