//! Concrete implementations of the cross-crate seams: the dispatcher's
//! session bridge and the holder's channel sender.

use crate::state::ServiceConfig;
use async_trait::async_trait;
use berth_channels::ChannelRegistry;
use berth_core::error::{PlatformError, PlatformResult};
use berth_core::protocol::{HolderFrame, QueueMode, QueuedPrompt};
use berth_core::scope::ScopeKey;
use berth_core::status::SessionPurpose;
use berth_dispatch::dispatcher::SessionBridge;
use berth_dispatch::WorkflowExecution;
use berth_session::messages::{AdminSignal, EnqueuePrompt};
use berth_session::services::{ChannelSender, SessionDirectory};
use berth_session::store::session_repo::NewSession;
use berth_session::SessionRegistry;
use kameo::error::SendError;
use serde_json::{json, Value};
use std::sync::Arc;

fn ask_err<M>(e: SendError<M, PlatformError>) -> PlatformError {
    match e {
        SendError::HandlerError(err) => err,
        _ => PlatformError::Internal("session actor unavailable".into()),
    }
}

/// The dispatcher's window into the session layer.
pub struct RegistryBridge {
    registry: Arc<SessionRegistry>,
}

impl RegistryBridge {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        RegistryBridge { registry }
    }
}

#[async_trait]
impl SessionBridge for RegistryBridge {
    async fn create_workflow_session(
        &self,
        owner_id: &str,
        workflow_id: &str,
    ) -> PlatformResult<String> {
        let (record, _token) = self
            .registry
            .create_session(NewSession {
                owner_id: owner_id.to_string(),
                workspace: format!("workflow:{workflow_id}"),
                purpose: SessionPurpose::Workflow,
                parent_id: None,
                persona_id: None,
            })
            .await?;
        Ok(record.id)
    }

    async fn post_orchestrator_prompt(&self, user_id: &str, prompt: &str) -> PlatformResult<()> {
        let record = self.registry.orchestrator_session(user_id).await?;
        self.registry
            .post_prompt(
                user_id,
                &record.id,
                QueuedPrompt::text(prompt, QueueMode::Followup),
            )
            .await
    }

    async fn launch_execution(&self, execution: &WorkflowExecution) -> PlatformResult<()> {
        let actor_ref = self.registry.ensure_actor(&execution.session_id).await?;
        actor_ref
            .ask(AdminSignal {
                frame: HolderFrame::WorkflowExecute {
                    execution_id: execution.id.clone(),
                    workflow: execution.workflow_snapshot.clone(),
                },
            })
            .await
            .map_err(ask_err)
    }
}

/// Outbound channel delivery for `channel-reply` runner operations:
/// resolves the session's binding, renders markdown and sends through
/// the adapter.
pub struct AdapterChannelSender {
    registry: Arc<SessionRegistry>,
    channels: Arc<ChannelRegistry>,
    config: Arc<ServiceConfig>,
}

impl AdapterChannelSender {
    pub fn new(
        registry: Arc<SessionRegistry>,
        channels: Arc<ChannelRegistry>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        AdapterChannelSender {
            registry,
            channels,
            config,
        }
    }
}

#[async_trait]
impl ChannelSender for AdapterChannelSender {
    async fn reply(
        &self,
        session_id: &str,
        channel_type: Option<&str>,
        channel_id: Option<&str>,
        markdown: &str,
    ) -> PlatformResult<Value> {
        // Explicit addressing wins; otherwise the session's binding
        // decides where the reply goes.
        let (channel_type, channel_id) = match (channel_type, channel_id) {
            (Some(ct), Some(cid)) => (ct.to_string(), cid.to_string()),
            _ => {
                let bindings = self
                    .registry
                    .store()
                    .bindings
                    .list_for_session(session_id)
                    .await?;
                let binding = bindings.first().ok_or_else(|| {
                    PlatformError::Validation(format!(
                        "session {session_id} has no channel binding"
                    ))
                })?;
                let (_user, parts) = ScopeKey::parse(binding.scope_key.as_str())?;
                (parts.channel_type, parts.channel_id)
            }
        };

        let adapter = self
            .channels
            .get(&channel_type)
            .ok_or_else(|| PlatformError::Channel(format!("unknown channel: {channel_type}")))?;
        let ctx = self.config.channel_context(&channel_type);
        let message_ref = adapter.send_message(&ctx, &channel_id, markdown).await?;
        Ok(json!({
            "channelType": channel_type,
            "channelId": channel_id,
            "messageRef": message_ref,
        }))
    }
}
